//! Async channel bridge between Tokio runtime and USB thread

use crate::usb_types::DeviceSummary;
use async_channel::{Receiver, Sender, TrySendError, bounded};
use capture::{ResolvedEndpoint, ThroughputSnapshot};

/// Commands from Tokio runtime to USB thread
#[derive(Debug)]
pub enum UsbCommand {
    /// List all connected USB devices
    ListDevices {
        /// Channel to send response back
        response: tokio::sync::oneshot::Sender<Vec<DeviceSummary>>,
    },

    /// Shutdown the USB thread gracefully
    Shutdown,
}

/// Events from the USB thread
#[derive(Debug, Clone)]
pub enum UsbEvent {
    /// A device was opened and its bulk-IN endpoint is being read
    DeviceAttached {
        device: DeviceSummary,
        endpoint: ResolvedEndpoint,
    },

    /// The device being read went away
    DeviceDetached { bus_number: u8, device_address: u8 },

    /// A candidate device could not be set up for reading
    AttachFailed {
        bus_number: u8,
        device_address: u8,
        reason: String,
    },

    /// Periodic throughput report
    Throughput(ThroughputSnapshot),
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct UsbBridge {
    cmd_tx: Sender<UsbCommand>,
    event_rx: Receiver<UsbEvent>,
}

impl UsbBridge {
    /// Send a command to the USB thread
    pub async fn send_command(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event from the USB thread
    pub async fn recv_event(&self) -> crate::Result<UsbEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for USB thread (blocking)
pub struct UsbWorker {
    pub(crate) cmd_rx: Receiver<UsbCommand>,
    /// Event sender (public for USB worker thread to access)
    pub event_tx: Sender<UsbEvent>,
}

impl UsbWorker {
    /// Receive a command from Tokio runtime (blocking)
    pub fn recv_command(&self) -> crate::Result<UsbCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<UsbCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Whether the runtime side has gone away
    pub fn is_disconnected(&self) -> bool {
        self.cmd_rx.is_closed()
    }

    /// Send an event to Tokio runtime (blocking)
    pub fn send_event(&self, event: UsbEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Send an event without blocking the read loop
    ///
    /// Returns false if the event was dropped because the channel is full or
    /// closed.
    pub fn try_send_event(&self, event: UsbEvent) -> bool {
        match self.event_tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Create the channel bridge between Tokio and USB thread
///
/// Returns (UsbBridge for Tokio, UsbWorker for USB thread)
pub fn create_usb_bridge() -> (UsbBridge, UsbWorker) {
    let (cmd_tx, cmd_rx) = bounded(256);
    let (event_tx, event_rx) = bounded(256);

    (
        UsbBridge { cmd_tx, event_rx },
        UsbWorker { cmd_rx, event_tx },
    )
}
