//! Write batch and flush policy
//!
//! Rendered lines accumulate in a batch shared between the reassembly stage
//! (which appends) and the persistence stage (which detaches). Detaching swaps
//! in an empty batch while the lock is held, so the slow storage write always
//! runs on a private copy and the producer never waits on storage I/O.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Pending lines plus their serialized size
#[derive(Debug, Default)]
struct WriteBatch {
    lines: VecDeque<String>,
    /// Serialized size: every line plus its terminator
    bytes: usize,
    /// Lines evicted by the hard cap since the last detach
    dropped: u64,
}

impl WriteBatch {
    fn push(&mut self, line: String, cap: usize) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line);

        // The newest line always stays, even if it alone exceeds the cap
        while self.bytes > cap && self.lines.len() > 1 {
            if let Some(old) = self.lines.pop_front() {
                self.bytes -= old.len() + 1;
                self.dropped += 1;
            }
        }
    }
}

/// Lines detached from the batch for one storage write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSnapshot {
    /// Lines joined with `\n`, each one terminated
    pub text: String,
    pub lines: usize,
    /// Lines evicted by the hard cap before this detach
    pub dropped_lines: u64,
}

impl BatchSnapshot {
    pub fn is_empty(&self) -> bool {
        self.lines == 0 && self.dropped_lines == 0
    }
}

fn lock(batch: &Mutex<WriteBatch>) -> MutexGuard<'_, WriteBatch> {
    batch.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Create a write batch holding at most `cap` serialized bytes
pub fn write_batch(cap: usize) -> (BatchWriter, BatchFlusher) {
    let shared = Arc::new(Mutex::new(WriteBatch::default()));
    (
        BatchWriter {
            batch: shared.clone(),
            cap,
        },
        BatchFlusher { batch: shared },
    )
}

/// Appending end, owned by the reassembly stage
#[derive(Debug)]
pub struct BatchWriter {
    batch: Arc<Mutex<WriteBatch>>,
    cap: usize,
}

impl BatchWriter {
    /// Append one rendered line (without terminator)
    pub fn push(&mut self, line: String) {
        lock(&self.batch).push(line, self.cap);
    }

    pub fn cap(&self) -> usize {
        self.cap
    }
}

/// Detaching end, owned by the persistence stage
#[derive(Debug)]
pub struct BatchFlusher {
    batch: Arc<Mutex<WriteBatch>>,
}

impl BatchFlusher {
    pub fn pending_bytes(&self) -> usize {
        lock(&self.batch).bytes
    }

    pub fn pending_lines(&self) -> usize {
        lock(&self.batch).lines.len()
    }

    /// Swap the pending batch for an empty one and serialize it
    pub fn take(&mut self) -> BatchSnapshot {
        let detached = std::mem::take(&mut *lock(&self.batch));

        let mut text = String::with_capacity(detached.bytes);
        for line in &detached.lines {
            text.push_str(line);
            text.push('\n');
        }

        BatchSnapshot {
            text,
            lines: detached.lines.len(),
            dropped_lines: detached.dropped,
        }
    }
}

/// Decides when the pending batch is written out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Pending size that forces a flush
    pub high_water: usize,
    /// Longest a non-empty batch may wait
    pub max_dwell: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            high_water: 4096,
            max_dwell: Duration::from_secs(2),
        }
    }
}

impl FlushPolicy {
    pub fn should_flush(&self, pending_bytes: usize, since_last_flush: Duration) -> bool {
        pending_bytes > 0
            && (pending_bytes >= self.high_water || since_last_flush >= self.max_dwell)
    }
}
