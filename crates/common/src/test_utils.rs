//! Test utilities for the USB line logger
//!
//! Provides in-memory fakes for the pipeline's seams and helper functions for
//! testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::ConfigDescriptorBuilder;
//!
//! # fn main() {
//! let config = ConfigDescriptorBuilder::cdc_acm(0x81).build();
//! let ep = capture::resolve_bulk_in(&config, None).unwrap();
//! assert_eq!(ep.address, 0x81);
//! # }
//! ```

use capture::descriptor::{DESC_TYPE_CONFIGURATION, DESC_TYPE_ENDPOINT, DESC_TYPE_INTERFACE};
use capture::{CaptureError, ClockSource, ConsoleSink, Storage};
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Build a wall-clock time, panicking on invalid input
pub fn datetime(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, min, sec))
        .expect("valid test datetime")
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// Split `data` into packets of at most `packet_size` bytes
pub fn packetize(data: &[u8], packet_size: usize) -> Vec<Vec<u8>> {
    data.chunks(packet_size).map(<[u8]>::to_vec).collect()
}

#[derive(Debug, Default)]
struct MemoryVolume {
    files: Mutex<HashMap<String, Vec<u8>>>,
    available: AtomicBool,
    failing: AtomicBool,
    opens: AtomicUsize,
}

/// In-memory storage volume
///
/// Clones share the same files. A write only lands in the file on `flush`,
/// and a failing volume refuses every flush.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    volume: Arc<MemoryVolume>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        let volume = MemoryVolume::default();
        volume.available.store(true, Ordering::SeqCst);
        Self {
            volume: Arc::new(volume),
        }
    }

    /// Storage that reports itself unmounted
    pub fn unavailable() -> Self {
        let storage = Self::new();
        storage.set_available(false);
        storage
    }

    pub fn set_available(&self, available: bool) {
        self.volume.available.store(available, Ordering::SeqCst);
    }

    /// Make every following flush fail
    pub fn set_failing(&self, failing: bool) {
        self.volume.failing.store(failing, Ordering::SeqCst);
    }

    pub fn contents(&self, name: &str) -> Option<String> {
        lock(&self.volume.files)
            .get(name)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.volume.files).keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of times a file was opened
    pub fn open_count(&self) -> usize {
        self.volume.opens.load(Ordering::SeqCst)
    }
}

/// Open file on a [`MemoryStorage`]
#[derive(Debug)]
pub struct MemoryHandle {
    volume: Arc<MemoryVolume>,
    name: String,
    pending: Vec<u8>,
}

impl io::Write for MemoryHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.volume.failing.load(Ordering::SeqCst) {
            self.pending.clear();
            return Err(io::Error::other("simulated write failure"));
        }
        lock(&self.volume.files)
            .entry(self.name.clone())
            .or_default()
            .append(&mut self.pending);
        Ok(())
    }
}

impl Storage for MemoryStorage {
    type Handle = MemoryHandle;

    fn is_available(&self) -> bool {
        self.volume.available.load(Ordering::SeqCst)
    }

    fn open_append(&self, name: &str) -> io::Result<MemoryHandle> {
        if !self.is_available() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "volume not mounted"));
        }
        self.volume.opens.fetch_add(1, Ordering::SeqCst);
        lock(&self.volume.files).entry(name.to_string()).or_default();
        Ok(MemoryHandle {
            volume: self.volume.clone(),
            name: name.to_string(),
            pending: Vec::new(),
        })
    }
}

/// Clock source whose reading is controlled by the test
///
/// Clones share the same reading and read counter.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    reading: Arc<Mutex<Option<NaiveDateTime>>>,
    reads: Arc<AtomicUsize>,
}

impl ManualClock {
    pub fn at(time: NaiveDateTime) -> Self {
        let clock = Self::default();
        clock.set_reading(Some(time));
        clock
    }

    pub fn unavailable() -> Self {
        Self::default()
    }

    /// Change what the next `read` returns
    pub fn set_reading(&self, reading: Option<NaiveDateTime>) {
        *lock(&self.reading) = reading;
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl ClockSource for ManualClock {
    fn read(&mut self) -> Option<NaiveDateTime> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        *lock(&self.reading)
    }

    fn set(&mut self, time: NaiveDateTime) -> capture::Result<()> {
        let mut reading = lock(&self.reading);
        if reading.is_none() {
            return Err(CaptureError::ClockUnavailable);
        }
        *reading = Some(time);
        Ok(())
    }
}

/// Console sink that records every line
#[derive(Debug, Clone, Default)]
pub struct CapturedConsole {
    lines: Arc<Mutex<Vec<String>>>,
}

impl CapturedConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        lock(&self.lines).clone()
    }
}

impl ConsoleSink for CapturedConsole {
    fn emit(&mut self, line: &str) {
        lock(&self.lines).push(line.to_string());
    }
}

/// Builder for raw configuration descriptors
///
/// `wTotalLength` is filled in by [`build`](Self::build).
#[derive(Debug, Clone, Default)]
pub struct ConfigDescriptorBuilder {
    records: Vec<u8>,
    interfaces: u8,
}

impl ConfigDescriptorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Typical CDC-ACM layout: communication interface with an interrupt
    /// endpoint, then a CDC-Data interface with bulk OUT and bulk IN
    pub fn cdc_acm(bulk_in: u8) -> Self {
        Self::new()
            .interface(0, 0x02, 1)
            .raw(&[5, 0x24, 0x00, 0x10, 0x01])
            .raw(&[5, 0x24, 0x01, 0x00, 0x01])
            .endpoint(0x83, 0x03, 16)
            .interface(1, 0x0A, 2)
            .endpoint(0x02, 0x02, 64)
            .endpoint(bulk_in, 0x02, 64)
    }

    pub fn interface(mut self, number: u8, class: u8, num_endpoints: u8) -> Self {
        self.records.extend_from_slice(&[
            9,
            DESC_TYPE_INTERFACE,
            number,
            0,
            num_endpoints,
            class,
            0,
            0,
            0,
        ]);
        self.interfaces += 1;
        self
    }

    pub fn endpoint(mut self, address: u8, attributes: u8, max_packet_size: u16) -> Self {
        let [lo, hi] = max_packet_size.to_le_bytes();
        self.records
            .extend_from_slice(&[7, DESC_TYPE_ENDPOINT, address, attributes, lo, hi, 0]);
        self
    }

    /// Append an arbitrary record (class-specific descriptors, malformed input)
    pub fn raw(mut self, record: &[u8]) -> Self {
        self.records.extend_from_slice(record);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let total = (9 + self.records.len()) as u16;
        let [lo, hi] = total.to_le_bytes();
        let mut out = vec![
            9,
            DESC_TYPE_CONFIGURATION,
            lo,
            hi,
            self.interfaces,
            1,
            0,
            0x80,
            50,
        ];
        out.extend_from_slice(&self.records);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_memory_storage_commits_on_flush() {
        let storage = MemoryStorage::new();
        let mut handle = storage.open_append("a.txt").unwrap();
        handle.write_all(b"line\n").unwrap();
        assert_eq!(storage.contents("a.txt").as_deref(), Some(""));
        handle.flush().unwrap();
        assert_eq!(storage.contents("a.txt").as_deref(), Some("line\n"));
        assert_eq!(storage.open_count(), 1);
    }

    #[test]
    fn test_memory_storage_failures() {
        let storage = MemoryStorage::unavailable();
        assert!(storage.open_append("a.txt").is_err());

        storage.set_available(true);
        storage.set_failing(true);
        let mut handle = storage.open_append("a.txt").unwrap();
        handle.write_all(b"lost\n").unwrap();
        assert!(handle.flush().is_err());
        assert_eq!(storage.contents("a.txt").as_deref(), Some(""));
    }

    #[test]
    fn test_manual_clock() {
        let mut clock = ManualClock::at(datetime(2025, 1, 15, 10, 30, 0));
        let observer = clock.clone();
        assert_eq!(clock.read(), Some(datetime(2025, 1, 15, 10, 30, 0)));
        clock.set(datetime(2026, 2, 1, 0, 0, 0)).unwrap();
        assert_eq!(clock.read(), Some(datetime(2026, 2, 1, 0, 0, 0)));
        assert_eq!(observer.reads(), 2);

        let mut none = ManualClock::unavailable();
        assert!(none.read().is_none());
        assert!(none.set(datetime(2025, 1, 1, 0, 0, 0)).is_err());
    }

    #[test]
    fn test_config_descriptor_builder() {
        let desc = ConfigDescriptorBuilder::cdc_acm(0x81).build();
        assert_eq!(capture::descriptor::total_length(&desc), Some(desc.len() as u16));
        assert_eq!(desc[4], 2); // bNumInterfaces

        let ep = capture::resolve_bulk_in(&desc, None).unwrap();
        assert_eq!(ep.interface, 1);
        assert_eq!(ep.address, 0x81);
    }

    #[test]
    fn test_packetize() {
        let packets = packetize(b"abcdefg", 3);
        assert_eq!(packets, vec![b"abc".to_vec(), b"def".to_vec(), b"g".to_vec()]);
    }

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await;

        assert!(result.is_ok());
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        assert!(result.is_err());
    }
}
