//! USB line capture pipeline
//!
//! Platform-neutral core of the USB line logger. Bytes read from a CDC bulk-IN
//! endpoint flow through four stages:
//!
//! - **Ingestion**: the transfer completion handler appends to a bounded
//!   buffer and resubmits immediately ([`ingest`])
//! - **Reassembly**: the buffer is split into timestamped lines ([`line`])
//! - **Batching**: lines accumulate in a double-buffered batch ([`batch`])
//! - **Persistence**: batches are appended to the current log file
//!   ([`persist`], [`storage`])
//!
//! Endpoint discovery ([`descriptor`]), the clock adapter ([`clock`]) and the
//! console command grammar ([`command`]) live here too. Talking to real
//! hardware is left to the binary.

pub mod batch;
pub mod clock;
pub mod command;
pub mod descriptor;
pub mod error;
pub mod ingest;
pub mod line;
pub mod persist;
pub mod pipeline;
pub mod storage;

pub use batch::{BatchFlusher, BatchSnapshot, BatchWriter, FlushPolicy, write_batch};
pub use clock::{ClockAdapter, ClockSource, NO_CLOCK_MARKER, NoClock, SharedClock, Stamp};
pub use command::{Command, CommandError, StatusReport};
pub use descriptor::{ResolvedEndpoint, resolve_bulk_in};
pub use error::{CaptureError, Result};
pub use ingest::{
    BufferGauge, DeviceGate, IngestReader, IngestWriter, IngestionStage, Resubmit,
    ThroughputCounters, ThroughputSnapshot, TransferStatus, ingestion_buffer,
};
pub use line::{ConsoleSink, CycleReport, LineAssembler, LogLine, ReassemblyConfig};
pub use persist::{FlushJob, FlushOutcome, FlushReport, PersistStats, PersistenceStage};
pub use pipeline::{Pipeline, PipelineConfig};
pub use storage::{DirStorage, Storage, append_scoped, log_file_name};
