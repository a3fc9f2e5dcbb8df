//! USB worker thread
//!
//! Dedicated thread owning the libusb context, the capture device and the
//! ingestion stage. Each loop iteration:
//!
//! 1. drains commands from the Tokio runtime (non-blocking)
//! 2. applies hot-plug notifications, so a detach is seen before the next read
//! 3. performs one bulk-IN transfer with a short timeout and hands the result
//!    to the completion handler
//! 4. sends the throughput report when it is due
//!
//! With no device attached the loop pumps libusb events instead of reading.

use crate::config::UsbSettings;
use crate::usb::manager::{DeviceManager, ManagerOptions};
use capture::{DeviceGate, IngestionStage, Resubmit, TransferStatus};
use common::{UsbCommand, UsbEvent, UsbWorker};
use rusb::UsbContext;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// libusb event wait while no device is attached
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Worker settings derived from the `[usb]` config section
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub manager: ManagerOptions,
    pub transfer_size: usize,
    pub transfer_timeout: Duration,
    pub report_interval: Duration,
}

impl WorkerOptions {
    pub fn from_settings(settings: &UsbSettings) -> anyhow::Result<Self> {
        Ok(Self {
            manager: ManagerOptions {
                filters: settings.device_filters()?,
                forced_interface: settings.interface,
                detach_kernel_driver: settings.detach_kernel_driver,
                auto_attach: true,
            },
            transfer_size: settings.transfer_size,
            transfer_timeout: settings.transfer_timeout(),
            report_interval: settings.report_interval(),
        })
    }
}

pub struct UsbWorkerThread {
    manager: DeviceManager,
    worker: UsbWorker,
    /// `None` when the worker only answers listing commands
    ingestion: Option<IngestionStage>,
    buf: Vec<u8>,
    transfer_timeout: Duration,
    report_interval: Duration,
    last_report: Instant,
}

impl UsbWorkerThread {
    pub fn new(
        worker: UsbWorker,
        mut options: WorkerOptions,
        ingestion: Option<IngestionStage>,
    ) -> Result<Self, rusb::Error> {
        let gate = match &ingestion {
            Some(stage) => stage.gate().clone(),
            None => DeviceGate::new(),
        };
        options.manager.auto_attach &= ingestion.is_some();
        let manager = DeviceManager::new(options.manager, gate)?;

        Ok(Self {
            manager,
            worker,
            ingestion,
            buf: vec![0u8; options.transfer_size.max(1)],
            transfer_timeout: options.transfer_timeout,
            report_interval: options.report_interval,
            last_report: Instant::now(),
        })
    }

    /// Run until Shutdown is received or the runtime side goes away
    pub fn run(mut self) -> Result<(), rusb::Error> {
        info!("USB worker thread started");

        for event in self.manager.initialize() {
            self.publish(event);
        }

        loop {
            match self.worker.try_recv_command() {
                Some(UsbCommand::Shutdown) => {
                    info!("USB worker shutting down");
                    break;
                }
                Some(cmd) => self.handle_command(cmd),
                None => {}
            }
            if self.worker.is_disconnected() {
                info!("Runtime gone, USB worker stopping");
                break;
            }

            for event in self.manager.process_hotplug() {
                self.publish(event);
            }

            if !self.read_once() {
                match self.manager.context().handle_events(Some(IDLE_WAIT)) {
                    Ok(()) => {}
                    Err(rusb::Error::Interrupted) => {
                        debug!("USB event handling interrupted");
                    }
                    Err(e) => {
                        warn!("Error handling USB events: {}", e);
                        std::thread::sleep(IDLE_WAIT);
                    }
                }
            }

            self.report_throughput();
        }

        if let Some(event) = self.manager.detach() {
            self.publish(event);
        }
        info!("USB worker thread stopped");
        Ok(())
    }

    /// One transfer on the attached device; false when nothing is attached
    fn read_once(&mut self) -> bool {
        let (Some(ingestion), Some(session)) = (self.ingestion.as_ref(), self.manager.active_mut())
        else {
            return false;
        };

        let (status, n) = session.read(&mut self.buf, self.transfer_timeout);
        match ingestion.on_transfer_complete(status, &self.buf[..n]) {
            Resubmit::Again => match status {
                TransferStatus::Stalled => {
                    debug!("Bulk-IN endpoint stalled, clearing halt");
                    session.clear_halt();
                }
                TransferStatus::Overflow | TransferStatus::Error => {
                    debug!("Bulk-IN transfer failed: {:?}", status);
                }
                _ => {}
            },
            Resubmit::Stop => {
                info!("Bulk-IN transfer not resubmitted, device gone");
                if let Some(event) = self.manager.detach() {
                    self.publish(event);
                }
            }
        }
        true
    }

    fn report_throughput(&mut self) {
        if self.last_report.elapsed() < self.report_interval {
            return;
        }
        self.last_report = Instant::now();

        let Some(ingestion) = &self.ingestion else {
            return;
        };
        let snapshot = ingestion.counters().take_interval();
        if snapshot.dropped_bytes > 0 {
            warn!(
                "Ingestion buffer full, {} bytes dropped in the last {}s",
                snapshot.dropped_bytes,
                self.report_interval.as_secs()
            );
        }
        if self.manager.active().is_some() {
            info!(
                "USB throughput: {} bytes in {} transfers ({} errors) over {}s",
                snapshot.bytes,
                snapshot.transfers,
                snapshot.errors,
                self.report_interval.as_secs()
            );
        }
        self.publish(UsbEvent::Throughput(snapshot));
    }

    /// Never blocks the read loop; events are dropped if the runtime lags
    fn publish(&self, event: UsbEvent) {
        if !self.worker.try_send_event(event) {
            debug!("Event channel full or closed, event dropped");
        }
    }

    fn handle_command(&mut self, cmd: UsbCommand) {
        // Keep the USB thread alive if a handler panics
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in USB command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&mut self, cmd: UsbCommand) {
        match cmd {
            UsbCommand::ListDevices { response } => {
                let devices = self.manager.list_devices();
                debug!("Listing {} devices", devices.len());
                let _ = response.send(devices);
            }
            UsbCommand::Shutdown => {}
        }
    }
}

/// Running USB worker thread
pub struct WorkerHandle {
    pub thread: JoinHandle<Result<(), rusb::Error>>,
    started: Option<oneshot::Receiver<Result<(), rusb::Error>>>,
}

impl WorkerHandle {
    /// Wait until the worker has created its USB context
    pub async fn wait_started(&mut self) -> Result<(), rusb::Error> {
        match self.started.take() {
            Some(rx) => rx.await.unwrap_or(Err(rusb::Error::Other)),
            None => Ok(()),
        }
    }
}

/// Spawn the USB worker thread
///
/// Passing `None` for `ingestion` starts a worker that only lists devices.
pub fn spawn_usb_worker(
    worker: UsbWorker,
    options: WorkerOptions,
    ingestion: Option<IngestionStage>,
) -> std::io::Result<WorkerHandle> {
    let (started_tx, started_rx) = oneshot::channel();
    let thread = std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || {
            let worker_thread = match UsbWorkerThread::new(worker, options, ingestion) {
                Ok(thread) => {
                    let _ = started_tx.send(Ok(()));
                    thread
                }
                Err(e) => {
                    error!("Failed to initialize USB: {}", e);
                    let _ = started_tx.send(Err(e));
                    return Err(e);
                }
            };
            worker_thread.run()
        })?;

    Ok(WorkerHandle {
        thread,
        started: Some(started_rx),
    })
}
