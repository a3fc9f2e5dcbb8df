//! Ingestion stage
//!
//! The USB completion path appends received bytes to the ingestion buffer and
//! immediately asks for the transfer to be resubmitted. Nothing here blocks:
//! chunks are handed to the reassembly stage over a lock-free queue, and the
//! byte occupancy of the buffer is tracked in an atomic counter that the
//! producer raises before hand-off and the consumer lowers on removal. An
//! append that would push the occupancy past capacity is dropped whole and
//! counted, so the USB read cadence never depends on how fast lines are
//! drained downstream.

use async_channel::{Receiver, Sender, TryRecvError};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// State shared by both ends of the ingestion buffer
#[derive(Debug)]
struct Shared {
    capacity: usize,
    /// Bytes queued or held by the reader
    len: AtomicUsize,
    /// Bytes refused since the reader last asked
    dropped: AtomicU64,
}

/// Create an ingestion buffer holding at most `capacity` bytes
///
/// Returns the producer end (for the USB completion handler), the consumer
/// end (for line reassembly) and a gauge for status reporting. Neither end is
/// `Clone`, so each has exactly one owner.
pub fn ingestion_buffer(capacity: usize) -> (IngestWriter, IngestReader, BufferGauge) {
    let shared = Arc::new(Shared {
        capacity,
        len: AtomicUsize::new(0),
        dropped: AtomicU64::new(0),
    });
    let (tx, rx) = async_channel::unbounded();

    (
        IngestWriter {
            tx,
            shared: shared.clone(),
        },
        IngestReader {
            rx,
            shared: shared.clone(),
            buf: BytesMut::with_capacity(capacity),
        },
        BufferGauge { shared },
    )
}

/// Producer end of the ingestion buffer
#[derive(Debug)]
pub struct IngestWriter {
    tx: Sender<Bytes>,
    shared: Arc<Shared>,
}

impl IngestWriter {
    /// Append a chunk if it fits entirely, otherwise drop it
    ///
    /// Returns whether the chunk was accepted.
    pub fn append(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            return true;
        }

        // Only this end raises `len`, so the check cannot be invalidated by a
        // concurrent increase; the reader can only make more room.
        let used = self.shared.len.load(Ordering::Acquire);
        if used + data.len() > self.shared.capacity {
            self.shared
                .dropped
                .fetch_add(data.len() as u64, Ordering::Relaxed);
            return false;
        }

        self.shared.len.fetch_add(data.len(), Ordering::AcqRel);
        if self.tx.try_send(Bytes::copy_from_slice(data)).is_err() {
            // Reader is gone
            self.shared.len.fetch_sub(data.len(), Ordering::AcqRel);
            self.shared
                .dropped
                .fetch_add(data.len() as u64, Ordering::Relaxed);
            return false;
        }
        true
    }

    pub fn len(&self) -> usize {
        self.shared.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

/// Consumer end of the ingestion buffer
#[derive(Debug)]
pub struct IngestReader {
    rx: Receiver<Bytes>,
    shared: Arc<Shared>,
    buf: BytesMut,
}

impl IngestReader {
    /// Move every queued chunk into the contiguous read buffer
    ///
    /// Returns false once the producer end has been dropped and the queue is
    /// empty.
    pub fn fill(&mut self) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok(chunk) => self.buf.extend_from_slice(&chunk),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Closed) => return false,
            }
        }
    }

    /// Bytes available for reading without another `fill`
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Remove and return the first `n` buffered bytes
    pub fn consume(&mut self, n: usize) -> BytesMut {
        let n = n.min(self.buf.len());
        let out = self.buf.split_to(n);
        self.shared.len.fetch_sub(n, Ordering::AcqRel);
        out
    }

    /// Discard everything, including chunks still queued
    ///
    /// Returns the number of bytes discarded.
    pub fn clear(&mut self) -> usize {
        self.fill();
        let n = self.buf.len();
        self.buf.clear();
        self.shared.len.fetch_sub(n, Ordering::AcqRel);
        n
    }

    /// Total occupancy, queued chunks included
    pub fn len(&self) -> usize {
        self.shared.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes refused by the producer since the last call
    pub fn take_dropped(&self) -> u64 {
        self.shared.dropped.swap(0, Ordering::AcqRel)
    }
}

/// Read-only view of ingestion buffer occupancy
#[derive(Debug, Clone)]
pub struct BufferGauge {
    shared: Arc<Shared>,
}

impl BufferGauge {
    pub fn used(&self) -> usize {
        self.shared.len.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

/// Status reported by the host stack for a finished bulk-IN transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Transfer finished; the byte count may be zero
    Completed,
    /// No data arrived within the transfer timeout
    TimedOut,
    /// Endpoint halted
    Stalled,
    /// Device handle is no longer valid
    NoDevice,
    /// Device sent more data than requested
    Overflow,
    /// Any other failure
    Error,
}

/// What the USB path should do after a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resubmit {
    /// Submit the same transfer again immediately
    Again,
    /// The device is gone; release the transfer
    Stop,
}

/// Liveness flag for the attached device
///
/// Opened after a device is set up for reading and closed on detach before
/// its handle is released, so a late completion never resubmits against a
/// stale handle. Every open starts a new device session.
#[derive(Debug, Clone, Default)]
pub struct DeviceGate(Arc<GateState>);

#[derive(Debug, Default)]
struct GateState {
    open: AtomicBool,
    session: AtomicU64,
}

impl DeviceGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        self.0.session.fetch_add(1, Ordering::AcqRel);
        self.0.open.store(true, Ordering::Release);
    }

    pub fn close(&self) {
        self.0.open.store(false, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.0.open.load(Ordering::Acquire)
    }

    /// Number of times the gate has been opened
    pub fn session(&self) -> u64 {
        self.0.session.load(Ordering::Acquire)
    }
}

/// Throughput counters for one reporting period
#[derive(Debug, Default)]
pub struct ThroughputCounters {
    bytes: AtomicU64,
    transfers: AtomicU64,
    dropped_bytes: AtomicU64,
    errors: AtomicU64,
    total_bytes: AtomicU64,
}

/// Counter values taken at the end of a reporting period
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThroughputSnapshot {
    pub bytes: u64,
    pub transfers: u64,
    pub dropped_bytes: u64,
    pub errors: u64,
}

impl ThroughputCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_transfer(&self, bytes: usize) {
        self.transfers.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_drop(&self, bytes: usize) {
        self.dropped_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Read and reset the per-period counters
    pub fn take_interval(&self) -> ThroughputSnapshot {
        ThroughputSnapshot {
            bytes: self.bytes.swap(0, Ordering::Relaxed),
            transfers: self.transfers.swap(0, Ordering::Relaxed),
            dropped_bytes: self.dropped_bytes.swap(0, Ordering::Relaxed),
            errors: self.errors.swap(0, Ordering::Relaxed),
        }
    }

    /// Bytes received since startup
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }
}

/// Completion handler for the persistent bulk-IN transfer
///
/// Runs on whatever context the host stack completes transfers on. It only
/// checks the device gate, appends to the ingestion buffer and bumps counters.
#[derive(Debug)]
pub struct IngestionStage {
    writer: IngestWriter,
    gate: DeviceGate,
    counters: Arc<ThroughputCounters>,
    /// Gate session the last completion belonged to
    session: AtomicU64,
    /// The last accepted chunk did not end with a line feed
    mid_line: AtomicBool,
}

impl IngestionStage {
    pub fn new(writer: IngestWriter, gate: DeviceGate, counters: Arc<ThroughputCounters>) -> Self {
        Self {
            writer,
            gate,
            counters,
            session: AtomicU64::new(0),
            mid_line: AtomicBool::new(false),
        }
    }

    pub fn gate(&self) -> &DeviceGate {
        &self.gate
    }

    pub fn counters(&self) -> &Arc<ThroughputCounters> {
        &self.counters
    }

    /// Handle one finished transfer
    ///
    /// Resubmission never depends on whether the append succeeded.
    pub fn on_transfer_complete(&self, status: TransferStatus, data: &[u8]) -> Resubmit {
        if !self.gate.is_open() {
            return Resubmit::Stop;
        }

        match status {
            TransferStatus::Completed => {
                // End the previous device's unfinished line before new data
                let session = self.gate.session();
                if self.session.swap(session, Ordering::AcqRel) != session
                    && self.mid_line.load(Ordering::Acquire)
                {
                    self.writer.append(b"\n");
                }

                self.counters.record_transfer(data.len());
                if self.writer.append(data) {
                    if let Some(&last) = data.last() {
                        self.mid_line.store(last != b'\n', Ordering::Release);
                    }
                } else {
                    self.counters.record_drop(data.len());
                }
            }
            TransferStatus::TimedOut => {}
            TransferStatus::NoDevice => {
                self.gate.close();
                return Resubmit::Stop;
            }
            TransferStatus::Stalled | TransferStatus::Overflow | TransferStatus::Error => {
                self.counters.record_error();
            }
        }

        Resubmit::Again
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn stage(capacity: usize) -> (IngestionStage, IngestReader, DeviceGate) {
        let (writer, reader, _gauge) = ingestion_buffer(capacity);
        let gate = DeviceGate::new();
        gate.open();
        let stage = IngestionStage::new(writer, gate.clone(), Arc::new(ThroughputCounters::new()));
        (stage, reader, gate)
    }

    #[test]
    fn test_append_and_drain_in_order() {
        let (writer, mut reader, gauge) = ingestion_buffer(64);
        assert!(writer.append(b"hello "));
        assert!(writer.append(b"world"));
        assert_eq!(gauge.used(), 11);

        assert!(reader.fill());
        assert_eq!(reader.buffered(), b"hello world");
        let head = reader.consume(6);
        assert_eq!(&head[..], b"hello ");
        assert_eq!(reader.len(), 5);
        assert_eq!(gauge.used(), 5);
    }

    #[test]
    fn test_append_at_capacity_is_noop() {
        let (writer, mut reader, _gauge) = ingestion_buffer(8);
        assert!(writer.append(b"12345678"));
        assert!(!writer.append(b"9"));
        assert_eq!(writer.len(), 8);
        assert_eq!(reader.take_dropped(), 1);
        assert_eq!(reader.take_dropped(), 0);

        reader.fill();
        reader.consume(4);
        assert!(writer.append(b"abcd"));
        reader.fill();
        assert_eq!(reader.buffered(), b"5678abcd");
    }

    #[test]
    fn test_append_is_all_or_nothing() {
        let (writer, mut reader, _gauge) = ingestion_buffer(10);
        assert!(writer.append(b"123456"));
        assert!(!writer.append(b"abcdef"));
        reader.fill();
        assert_eq!(reader.buffered(), b"123456");
        assert_eq!(reader.take_dropped(), 6);
    }

    #[test]
    fn test_random_bursts_never_exceed_capacity() {
        let capacity = 1024;
        let (writer, mut reader, gauge) = ingestion_buffer(capacity);
        let mut rng = rand::rng();
        let mut accepted = 0usize;
        let mut refused = 0u64;

        for round in 0..2_000 {
            let len = rng.random_range(1..=300);
            let chunk: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            if writer.append(&chunk) {
                accepted += len;
            } else {
                refused += len as u64;
            }
            assert!(gauge.used() <= capacity);

            // Drain slowly so the buffer spends most of its time near full
            if round % 7 == 0 {
                reader.fill();
                let n = reader.buffered().len() / 3;
                accepted -= reader.consume(n).len();
            }
        }

        assert_eq!(reader.len(), accepted);
        assert_eq!(reader.take_dropped(), refused);
    }

    #[test]
    fn test_clear_discards_queued_chunks() {
        let (writer, mut reader, gauge) = ingestion_buffer(64);
        writer.append(b"abc");
        writer.append(b"def");
        assert_eq!(reader.clear(), 6);
        assert_eq!(gauge.used(), 0);
        assert!(reader.buffered().is_empty());
    }

    #[test]
    fn test_fill_reports_closed_producer() {
        let (writer, mut reader, _gauge) = ingestion_buffer(64);
        writer.append(b"tail");
        drop(writer);
        assert!(!reader.fill());
        assert_eq!(reader.buffered(), b"tail");
    }

    #[test]
    fn test_completion_appends_and_resubmits() {
        let (stage, mut reader, _gate) = stage(64);
        assert_eq!(
            stage.on_transfer_complete(TransferStatus::Completed, b"line\n"),
            Resubmit::Again
        );
        assert_eq!(
            stage.on_transfer_complete(TransferStatus::TimedOut, &[]),
            Resubmit::Again
        );
        reader.fill();
        assert_eq!(reader.buffered(), b"line\n");

        let snapshot = stage.counters().take_interval();
        assert_eq!(snapshot.bytes, 5);
        assert_eq!(snapshot.transfers, 1);
        assert_eq!(stage.counters().take_interval(), ThroughputSnapshot::default());
        assert_eq!(stage.counters().total_bytes(), 5);
    }

    #[test]
    fn test_resubmits_even_when_buffer_full() {
        let (stage, _reader, _gate) = stage(4);
        assert_eq!(
            stage.on_transfer_complete(TransferStatus::Completed, b"too long"),
            Resubmit::Again
        );
        assert_eq!(stage.counters().take_interval().dropped_bytes, 8);
    }

    #[test]
    fn test_errors_are_counted_and_resubmitted() {
        let (stage, _reader, _gate) = stage(64);
        assert_eq!(
            stage.on_transfer_complete(TransferStatus::Stalled, &[]),
            Resubmit::Again
        );
        assert_eq!(stage.counters().take_interval().errors, 1);
    }

    #[test]
    fn test_no_resubmit_after_detach() {
        let (stage, mut reader, gate) = stage(64);
        gate.close();
        assert_eq!(
            stage.on_transfer_complete(TransferStatus::Completed, b"late\n"),
            Resubmit::Stop
        );
        reader.fill();
        assert!(reader.buffered().is_empty());
    }

    #[test]
    fn test_reopened_gate_ends_stale_partial_line() {
        let (stage, mut reader, gate) = stage(64);
        stage.on_transfer_complete(TransferStatus::Completed, b"done\nhal");
        stage.on_transfer_complete(TransferStatus::NoDevice, &[]);

        gate.open();
        stage.on_transfer_complete(TransferStatus::Completed, b"fresh\n");
        reader.fill();
        assert_eq!(reader.buffered(), b"done\nhal\nfresh\n");
        assert_eq!(reader.len(), 15);
    }

    #[test]
    fn test_session_boundary_after_complete_line_adds_nothing() {
        let (stage, mut reader, gate) = stage(64);
        stage.on_transfer_complete(TransferStatus::Completed, b"done\n");
        gate.close();
        gate.open();
        stage.on_transfer_complete(TransferStatus::Completed, b"next\n");
        reader.fill();
        assert_eq!(reader.buffered(), b"done\nnext\n");
    }

    #[test]
    fn test_no_device_status_closes_gate() {
        let (stage, _reader, gate) = stage(64);
        assert_eq!(
            stage.on_transfer_complete(TransferStatus::NoDevice, &[]),
            Resubmit::Stop
        );
        assert!(!gate.is_open());
    }
}
