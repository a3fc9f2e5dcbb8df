//! Pipeline assembly
//!
//! Builds every stage at once and hands each shared buffer end to exactly one
//! owner. The caller moves the parts to their runtime contexts: the ingestion
//! stage to the USB thread, the assembler and batch writer to the reassembly
//! task, and the persistence stage to the persistence task.

use crate::batch::{BatchWriter, FlushPolicy, write_batch};
use crate::clock::SharedClock;
use crate::ingest::{BufferGauge, DeviceGate, IngestionStage, ThroughputCounters, ingestion_buffer};
use crate::line::{LineAssembler, ReassemblyConfig};
use crate::persist::PersistenceStage;
use crate::storage::Storage;
use std::sync::Arc;

/// Sizing of the buffers between stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Ingestion buffer capacity in bytes
    pub ingest_capacity: usize,
    pub reassembly: ReassemblyConfig,
    pub flush: FlushPolicy,
    /// Hard cap on the write batch in bytes
    pub batch_cap: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ingest_capacity: 16 * 1024,
            reassembly: ReassemblyConfig::default(),
            flush: FlushPolicy::default(),
            batch_cap: 64 * 1024,
        }
    }
}

/// All stages of one capture session, wired together
pub struct Pipeline<S: Storage> {
    pub ingestion: IngestionStage,
    pub assembler: LineAssembler,
    pub batch: BatchWriter,
    pub persistence: PersistenceStage<S>,
    pub gauge: BufferGauge,
    pub gate: DeviceGate,
    pub counters: Arc<ThroughputCounters>,
    pub clock: SharedClock,
}

impl<S: Storage> Pipeline<S> {
    pub fn build(config: &PipelineConfig, storage: S, clock: SharedClock) -> Self {
        let (writer, reader, gauge) = ingestion_buffer(config.ingest_capacity);
        let (batch, flusher) = write_batch(config.batch_cap);
        let gate = DeviceGate::new();
        let counters = Arc::new(ThroughputCounters::new());

        Self {
            ingestion: IngestionStage::new(writer, gate.clone(), counters.clone()),
            assembler: LineAssembler::new(reader, config.reassembly),
            batch,
            persistence: PersistenceStage::new(storage, flusher, config.flush, clock.clone()),
            gauge,
            gate,
            counters,
            clock,
        }
    }
}
