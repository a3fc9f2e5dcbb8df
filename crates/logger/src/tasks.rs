//! Async stage tasks
//!
//! The reassembly stage runs on a short fixed interval, the persistence stage
//! on a slower one. Storage I/O happens on the blocking pool and is awaited
//! before the next persistence cycle, so flushes never overlap.

use crate::service::{Heartbeat, notify_status};
use capture::{
    BatchWriter, CaptureError, ConsoleSink, LineAssembler, PersistStats, PersistenceStage,
    SharedClock, Storage,
};
use common::{UsbBridge, UsbEvent};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Persistence state as seen by the command surface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistStatus {
    pub current_file: Option<String>,
    pub storage_available: bool,
    pub stats: PersistStats,
}

/// Requests served by the persistence task
#[derive(Debug)]
pub enum PersistCommand {
    /// Flush to the current file, then open a new one
    Rotate {
        response: oneshot::Sender<capture::Result<String>>,
    },
    Status {
        response: oneshot::Sender<PersistStatus>,
    },
    /// Final flush, then stop
    Shutdown {
        response: oneshot::Sender<PersistStats>,
    },
}

/// Everything the reassembly task owns
pub struct ReassemblyParts {
    pub assembler: LineAssembler,
    pub batch: BatchWriter,
    pub clock: SharedClock,
    pub console: Box<dyn ConsoleSink>,
}

impl ReassemblyParts {
    /// Forward every complete line still buffered
    pub fn drain(&mut self) -> usize {
        self.assembler
            .drain(&self.clock, self.console.as_mut(), &mut self.batch)
    }
}

/// Run reassembly cycles until `stop` fires, then hand the parts back
pub fn spawn_reassembly(
    mut parts: ReassemblyParts,
    period: Duration,
    heartbeat: Heartbeat,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<ReassemblyParts> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let lines_per_cycle = parts.assembler.config().lines_per_cycle;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => break,
            }

            // Keep going while cycles come back full, yielding between slices
            loop {
                let report = parts.assembler.run_cycle(
                    &parts.clock,
                    parts.console.as_mut(),
                    &mut parts.batch,
                );
                heartbeat.beat();
                if report.records < lines_per_cycle {
                    break;
                }
                tokio::task::yield_now().await;
            }
        }

        debug!("Reassembly task stopped");
        parts
    })
}

/// Serve persistence commands and flush on the policy until shut down
pub fn spawn_persistence<S: Storage>(
    stage: PersistenceStage<S>,
    period: Duration,
    heartbeat: Heartbeat,
    commands: mpsc::Receiver<PersistCommand>,
) -> JoinHandle<()> {
    tokio::spawn(run_persistence(stage, period, heartbeat, commands))
}

async fn run_persistence<S: Storage>(
    mut stage: PersistenceStage<S>,
    period: Duration,
    heartbeat: Heartbeat,
    mut commands: mpsc::Receiver<PersistCommand>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                flush(&mut stage, false).await;
                heartbeat.beat();
            }
            cmd = commands.recv() => match cmd {
                Some(PersistCommand::Rotate { response }) => {
                    let Some((returned, result)) = rotate(stage).await else {
                        return;
                    };
                    stage = returned;
                    let _ = response.send(result);
                }
                Some(PersistCommand::Status { response }) => {
                    let _ = response.send(status_of(&stage));
                }
                Some(PersistCommand::Shutdown { response }) => {
                    flush(&mut stage, true).await;
                    info!("Persistence stopped: {:?}", stage.stats());
                    let _ = response.send(stage.stats());
                    return;
                }
                None => {
                    flush(&mut stage, true).await;
                    debug!("Persistence command channel closed");
                    return;
                }
            },
        }
    }
}

fn status_of<S: Storage>(stage: &PersistenceStage<S>) -> PersistStatus {
    PersistStatus {
        current_file: stage.current_file().map(str::to_string),
        storage_available: stage.storage_available(),
        stats: stage.stats(),
    }
}

/// Detach a batch and write it on the blocking pool
async fn flush<S: Storage>(stage: &mut PersistenceStage<S>, force: bool) {
    let now = Instant::now();
    let job = if force {
        stage.flush_now(now)
    } else {
        stage.poll_flush(now)
    };
    let Some(job) = job else {
        return;
    };

    match tokio::task::spawn_blocking(move || job.execute()).await {
        Ok(report) => {
            stage.complete(report);
        }
        Err(e) => error!("Flush task failed: {}", e),
    }
}

/// Rotation opens files, so the whole stage moves to the blocking pool
async fn rotate<S: Storage>(
    mut stage: PersistenceStage<S>,
) -> Option<(PersistenceStage<S>, capture::Result<String>)> {
    let result = tokio::task::spawn_blocking(move || {
        let result = stage.rotate(Instant::now());
        (stage, result)
    })
    .await;

    match result {
        Ok((stage, result)) => {
            match &result {
                Ok(name) => info!("Rotated to {}", name),
                Err(CaptureError::StorageUnavailable) => warn!("Rotation skipped, storage unavailable"),
                Err(e) => error!("Rotation failed: {}", e),
            }
            Some((stage, result))
        }
        Err(e) => {
            error!("Rotation task failed, persistence stopped: {}", e);
            None
        }
    }
}

/// Log USB worker events and mirror the device state to systemd
pub fn spawn_event_logger(bridge: UsbBridge) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(event) = bridge.recv_event().await {
            match event {
                UsbEvent::DeviceAttached { device, endpoint } => {
                    info!(
                        "Capturing from {:04x}:{:04x} endpoint {:#04x}",
                        device.vendor_id, device.product_id, endpoint.address
                    );
                    let _ = notify_status(&format!(
                        "Capturing from {:04x}:{:04x}",
                        device.vendor_id, device.product_id
                    ));
                }
                UsbEvent::DeviceDetached {
                    bus_number,
                    device_address,
                } => {
                    info!(
                        "Device on bus {} address {} gone, waiting for a new one",
                        bus_number, device_address
                    );
                    let _ = notify_status("Waiting for USB device");
                }
                UsbEvent::AttachFailed {
                    bus_number,
                    device_address,
                    reason,
                } => {
                    warn!(
                        "Device on bus {} address {} not captured: {}",
                        bus_number, device_address, reason
                    );
                }
                UsbEvent::Throughput(snapshot) => {
                    debug!("Throughput report: {:?}", snapshot);
                }
            }
        }
        debug!("USB event channel closed");
    })
}
