//! Storage backend for log files
//!
//! Log files are opened, written and closed within a single flush so that a
//! sudden power loss leaves at most the last batch in flight.

use chrono::NaiveDateTime;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name used when no clock is available
pub const FALLBACK_LOG_NAME: &str = "usb_log.txt";

/// Log file name for a session started at `time`
pub fn log_file_name(time: Option<NaiveDateTime>) -> String {
    match time {
        Some(time) => time.format("log_%Y%m%d_%H%M%S.txt").to_string(),
        None => FALLBACK_LOG_NAME.to_string(),
    }
}

/// Append-only file store
pub trait Storage: Clone + Send + 'static {
    type Handle: Write;

    /// Whether the volume is mounted and writable
    fn is_available(&self) -> bool;

    /// Open `name` for appending, creating it if needed
    fn open_append(&self, name: &str) -> io::Result<Self::Handle>;
}

/// Append `bytes` to `name`, closing the file before returning
///
/// `flush` on the handle is where a backend commits to the medium.
pub fn append_scoped<S: Storage>(storage: &S, name: &str, bytes: &[u8]) -> io::Result<()> {
    let mut handle = storage.open_append(name)?;
    handle.write_all(bytes)?;
    handle.flush()
}

/// Log files kept in a directory on a mounted volume
#[derive(Debug, Clone)]
pub struct DirStorage {
    root: PathBuf,
    sync_on_flush: bool,
}

impl DirStorage {
    pub fn new(root: impl Into<PathBuf>, sync_on_flush: bool) -> Self {
        Self {
            root: root.into(),
            sync_on_flush,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Storage for DirStorage {
    type Handle = LogFileHandle;

    fn is_available(&self) -> bool {
        match fs::metadata(&self.root) {
            Ok(meta) => meta.is_dir() && !meta.permissions().readonly(),
            Err(e) => {
                debug!("Storage {:?} not available: {}", self.root, e);
                false
            }
        }
    }

    fn open_append(&self, name: &str) -> io::Result<LogFileHandle> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_of(name))?;
        Ok(LogFileHandle {
            file,
            sync_on_flush: self.sync_on_flush,
        })
    }
}

/// Open log file; closed when dropped
#[derive(Debug)]
pub struct LogFileHandle {
    file: File,
    sync_on_flush: bool,
}

impl Write for LogFileHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.sync_on_flush {
            self.file.sync_data()?;
        }
        Ok(())
    }
}
