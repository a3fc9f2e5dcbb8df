//! Persistence stage
//!
//! Decides when the write batch goes to storage, detaches it, and appends it
//! to the current log file. A flush is split in three steps so the slow part
//! can run off the scheduling thread:
//!
//! 1. [`PersistenceStage::poll_flush`] evaluates the flush policy and detaches
//!    the batch into a [`FlushJob`],
//! 2. [`FlushJob::execute`] performs the scoped open, write, flush and close,
//! 3. [`PersistenceStage::complete`] folds the result into the statistics.
//!
//! [`PersistenceStage::run_cycle`] chains all three synchronously.

use crate::batch::{BatchFlusher, FlushPolicy};
use crate::clock::SharedClock;
use crate::error::{CaptureError, Result};
use crate::storage::{Storage, append_scoped, log_file_name};
use std::io;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// First line of a log file opened at startup
pub const STARTUP_MARKER: &str = "=== USB Logger Started ===";

/// First line of a log file opened by `newlog`
pub const SESSION_MARKER: &str = "=== New logging session ===";

/// Totals since startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistStats {
    pub bytes_written: u64,
    pub lines_written: u64,
    pub flush_ops: u64,
    pub failed_flushes: u64,
    /// Lines in batches whose write failed
    pub lines_lost: u64,
}

/// A detached batch bound for one log file
#[derive(Debug)]
pub struct FlushJob<S> {
    storage: S,
    file: String,
    text: String,
    lines: usize,
}

impl<S: Storage> FlushJob<S> {
    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Append the detached text to the log file
    pub fn execute(self) -> FlushReport {
        let result = append_scoped(&self.storage, &self.file, self.text.as_bytes());
        FlushReport {
            file: self.file,
            bytes: self.text.len(),
            lines: self.lines,
            result,
        }
    }
}

/// Result of an executed [`FlushJob`]
#[derive(Debug)]
pub struct FlushReport {
    pub file: String,
    pub bytes: usize,
    pub lines: usize,
    pub result: io::Result<()>,
}

/// Summary of a completed flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    pub lines: usize,
    pub bytes: usize,
    pub written: bool,
}

/// Owns the log file selection and the draining end of the write batch
pub struct PersistenceStage<S: Storage> {
    storage: S,
    flusher: BatchFlusher,
    policy: FlushPolicy,
    clock: SharedClock,
    current_file: Option<String>,
    storage_available: bool,
    last_flush: Instant,
    stats: PersistStats,
}

impl<S: Storage> PersistenceStage<S> {
    pub fn new(storage: S, flusher: BatchFlusher, policy: FlushPolicy, clock: SharedClock) -> Self {
        let storage_available = storage.is_available();
        Self {
            storage,
            flusher,
            policy,
            clock,
            current_file: None,
            storage_available,
            last_flush: Instant::now(),
            stats: PersistStats::default(),
        }
    }

    pub fn current_file(&self) -> Option<&str> {
        self.current_file.as_deref()
    }

    pub fn storage_available(&self) -> bool {
        self.storage_available
    }

    pub fn stats(&self) -> PersistStats {
        self.stats
    }

    pub fn pending_bytes(&self) -> usize {
        self.flusher.pending_bytes()
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Open the first log file of this run
    pub fn start_session(&mut self) -> Result<String> {
        self.open_session(STARTUP_MARKER)
    }

    /// Flush pending lines to the current file, then switch to a new one
    pub fn rotate(&mut self, now: Instant) -> Result<String> {
        if let Some(job) = self.flush_now(now) {
            let report = job.execute();
            self.complete(report);
        }
        self.open_session(SESSION_MARKER)
    }

    fn open_session(&mut self, marker: &str) -> Result<String> {
        self.storage_available = self.storage.is_available();
        if !self.storage_available {
            warn!("Storage unavailable, log file not opened");
            return Err(CaptureError::StorageUnavailable);
        }

        let stamp = self.clock.stamp();
        let name = log_file_name(stamp.time());
        let line = format!("{} {}\n", stamp, marker);

        match append_scoped(&self.storage, &name, line.as_bytes()) {
            Ok(()) => {
                info!("Logging to {}", name);
                self.current_file = Some(name.clone());
                Ok(name)
            }
            Err(e) => {
                error!("Failed to open log file {}: {}", name, e);
                self.current_file = None;
                Err(e.into())
            }
        }
    }

    /// Detach the batch if the flush policy says so
    pub fn poll_flush(&mut self, now: Instant) -> Option<FlushJob<S>> {
        let since = now.saturating_duration_since(self.last_flush);
        if !self.policy.should_flush(self.flusher.pending_bytes(), since) {
            return None;
        }
        self.flush_now(now)
    }

    /// Detach the batch regardless of the flush policy
    ///
    /// Returns `None` when there is nothing to write or nowhere to write it.
    pub fn flush_now(&mut self, now: Instant) -> Option<FlushJob<S>> {
        if !self.storage_available {
            return None;
        }
        let file = self.current_file.clone()?;

        let snapshot = self.flusher.take();
        if snapshot.is_empty() {
            return None;
        }
        self.last_flush = now;

        let mut text = String::with_capacity(snapshot.text.len() + 64);
        if snapshot.dropped_lines > 0 {
            warn!(
                "Write batch full, {} oldest lines dropped",
                snapshot.dropped_lines
            );
            text.push_str(&format!(
                "{} [BATCH OVERFLOW] {} lines dropped\n",
                self.clock.stamp(),
                snapshot.dropped_lines
            ));
        }
        text.push_str(&snapshot.text);

        Some(FlushJob {
            storage: self.storage.clone(),
            file,
            text,
            lines: snapshot.lines,
        })
    }

    /// Record the result of an executed job
    pub fn complete(&mut self, report: FlushReport) -> FlushOutcome {
        let written = match report.result {
            Ok(()) => {
                self.stats.bytes_written += report.bytes as u64;
                self.stats.lines_written += report.lines as u64;
                self.stats.flush_ops += 1;
                debug!(
                    "Flushed {} lines ({} bytes) to {}",
                    report.lines, report.bytes, report.file
                );
                true
            }
            Err(e) => {
                self.stats.failed_flushes += 1;
                self.stats.lines_lost += report.lines as u64;
                error!(
                    "Failed to write {} lines to {}: {}",
                    report.lines, report.file, e
                );
                false
            }
        };

        FlushOutcome {
            lines: report.lines,
            bytes: report.bytes,
            written,
        }
    }

    /// Poll, execute and complete in one call
    pub fn run_cycle(&mut self, now: Instant) -> Option<FlushOutcome> {
        let job = self.poll_flush(now)?;
        let report = job.execute();
        Some(self.complete(report))
    }

    /// Write out whatever is pending, used on shutdown
    pub fn finish(&mut self, now: Instant) -> Option<FlushOutcome> {
        let job = self.flush_now(now)?;
        let report = job.execute();
        Some(self.complete(report))
    }
}
