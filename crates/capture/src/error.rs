//! Capture pipeline error types

use thiserror::Error;

/// Errors raised by the capture pipeline stages
#[derive(Debug, Error)]
pub enum CaptureError {
    /// A descriptor record is too short or runs past the end of the buffer
    #[error("Malformed configuration descriptor at offset {offset}: {reason}")]
    MalformedDescriptor { offset: usize, reason: &'static str },

    /// The configuration has no interface with a bulk-IN endpoint
    #[error("No bulk-IN endpoint found in configuration descriptor")]
    NoBulkIn,

    /// The clock source was not available when the adapter was seeded
    #[error("Clock unavailable")]
    ClockUnavailable,

    /// Writing the external clock failed
    #[error("Failed to set clock: {0}")]
    ClockWrite(String),

    /// A `settime` argument did not match `YYYY-MM-DD HH:MM:SS`
    #[error("Invalid time format '{input}', expected YYYY-MM-DD HH:MM:SS")]
    InvalidTimeFormat { input: String },

    /// The storage volume is not mounted or not writable
    #[error("Storage unavailable")]
    StorageUnavailable,

    /// I/O error while talking to storage
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for capture results
pub type Result<T> = std::result::Result<T, CaptureError>;
