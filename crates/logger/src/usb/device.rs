//! Capture device session
//!
//! Wraps one opened `rusb` device: reads the raw configuration descriptor,
//! resolves the bulk-IN endpoint, claims its interface and performs the
//! bulk reads for the worker loop.

use capture::descriptor::{CONFIG_HEADER_LEN, DESC_TYPE_CONFIGURATION, total_length};
use capture::{CaptureError, ResolvedEndpoint, TransferStatus, resolve_bulk_in};
use common::DeviceSummary;
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Timeout for descriptor control requests
const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

/// bmRequestType: device-to-host, standard, device
const REQUEST_TYPE_GET_DESCRIPTOR: u8 = 0x80;
const REQUEST_GET_DESCRIPTOR: u8 = 0x06;

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("Failed to open device: {0}")]
    Open(rusb::Error),

    #[error("Failed to read configuration descriptor: {0}")]
    Descriptor(rusb::Error),

    #[error("Endpoint resolution failed: {0}")]
    Resolve(#[from] CaptureError),

    #[error("Failed to claim interface {interface}: {source}")]
    Claim { interface: u8, source: rusb::Error },
}

/// Map a blocking bulk read result to a completion status and byte count
pub fn map_read_result(result: Result<usize, rusb::Error>) -> (TransferStatus, usize) {
    match result {
        Ok(n) => (TransferStatus::Completed, n),
        Err(rusb::Error::Timeout) => (TransferStatus::TimedOut, 0),
        Err(rusb::Error::Pipe) => (TransferStatus::Stalled, 0),
        Err(rusb::Error::NoDevice) => (TransferStatus::NoDevice, 0),
        Err(rusb::Error::Overflow) => (TransferStatus::Overflow, 0),
        Err(_) => (TransferStatus::Error, 0),
    }
}

/// Fetch the active configuration descriptor as raw bytes
///
/// Reads the 9-byte header first to learn `wTotalLength`, then the whole
/// descriptor.
pub fn read_config_descriptor(
    device: &Device<Context>,
    handle: &DeviceHandle<Context>,
) -> Result<Vec<u8>, rusb::Error> {
    let active = device.active_config_descriptor()?.number();
    let count = device.device_descriptor()?.num_configurations();
    let index = (0..count)
        .find(|i| {
            device
                .config_descriptor(*i)
                .map(|c| c.number() == active)
                .unwrap_or(false)
        })
        .unwrap_or(0);

    let value = (u16::from(DESC_TYPE_CONFIGURATION) << 8) | u16::from(index);
    let mut header = [0u8; CONFIG_HEADER_LEN];
    let n = handle.read_control(
        REQUEST_TYPE_GET_DESCRIPTOR,
        REQUEST_GET_DESCRIPTOR,
        value,
        0,
        &mut header,
        CONTROL_TIMEOUT,
    )?;
    let total = total_length(&header[..n]).ok_or(rusb::Error::Other)? as usize;

    let mut buf = vec![0u8; total.max(CONFIG_HEADER_LEN)];
    let n = handle.read_control(
        REQUEST_TYPE_GET_DESCRIPTOR,
        REQUEST_GET_DESCRIPTOR,
        value,
        0,
        &mut buf,
        CONTROL_TIMEOUT,
    )?;
    buf.truncate(n);
    Ok(buf)
}

fn read_strings(
    descriptor: &DeviceDescriptor,
    handle: &DeviceHandle<Context>,
) -> (Option<String>, Option<String>) {
    let manufacturer = descriptor
        .manufacturer_string_index()
        .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());
    let product = descriptor
        .product_string_index()
        .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());
    (manufacturer, product)
}

/// Describe a device for listing, opening it briefly if permissions allow
pub fn summarize(device: &Device<Context>, forced_interface: Option<u8>) -> Option<DeviceSummary> {
    let descriptor = device.device_descriptor().ok()?;
    let mut summary = DeviceSummary {
        bus_number: device.bus_number(),
        device_address: device.address(),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        manufacturer: None,
        product: None,
        bulk_in: None,
    };

    if let Ok(handle) = device.open() {
        let (manufacturer, product) = read_strings(&descriptor, &handle);
        summary.manufacturer = manufacturer;
        summary.product = product;
        summary.bulk_in = read_config_descriptor(device, &handle)
            .ok()
            .and_then(|raw| resolve_bulk_in(&raw, forced_interface).ok());
    }

    Some(summary)
}

/// An opened device whose bulk-IN endpoint is being read
pub struct CaptureDevice {
    device: Device<Context>,
    handle: DeviceHandle<Context>,
    summary: DeviceSummary,
    endpoint: ResolvedEndpoint,
    kernel_driver_detached: bool,
}

impl CaptureDevice {
    /// Open, resolve and claim
    ///
    /// Nothing is left claimed when this fails.
    pub fn open(
        device: Device<Context>,
        forced_interface: Option<u8>,
        detach_kernel_driver: bool,
    ) -> Result<Self, AttachError> {
        let descriptor = device.device_descriptor().map_err(AttachError::Open)?;
        let mut handle = device.open().map_err(AttachError::Open)?;

        let raw = read_config_descriptor(&device, &handle).map_err(AttachError::Descriptor)?;
        let endpoint = resolve_bulk_in(&raw, forced_interface)?;
        info!(
            "Resolved bulk-IN endpoint {:#04x} on interface {} (class {:#04x}, {} bytes)",
            endpoint.address, endpoint.interface, endpoint.interface_class, endpoint.max_packet_size
        );

        let mut kernel_driver_detached = false;
        if detach_kernel_driver {
            match handle.kernel_driver_active(endpoint.interface) {
                Ok(true) => match handle.detach_kernel_driver(endpoint.interface) {
                    Ok(()) => {
                        debug!("Detached kernel driver from interface {}", endpoint.interface);
                        kernel_driver_detached = true;
                    }
                    Err(e) => warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        endpoint.interface, e
                    ),
                },
                Ok(false) => {}
                Err(e) => debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    endpoint.interface, e
                ),
            }
        }

        if let Err(source) = handle.claim_interface(endpoint.interface) {
            if kernel_driver_detached {
                let _ = handle.attach_kernel_driver(endpoint.interface);
            }
            return Err(AttachError::Claim {
                interface: endpoint.interface,
                source,
            });
        }

        if endpoint.alt_setting != 0
            && let Err(e) = handle.set_alternate_setting(endpoint.interface, endpoint.alt_setting)
        {
            warn!(
                "Failed to select alternate setting {} on interface {}: {}",
                endpoint.alt_setting, endpoint.interface, e
            );
        }

        let (manufacturer, product) = read_strings(&descriptor, &handle);
        let summary = DeviceSummary {
            bus_number: device.bus_number(),
            device_address: device.address(),
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            manufacturer,
            product,
            bulk_in: Some(endpoint),
        };

        Ok(Self {
            device,
            handle,
            summary,
            endpoint,
            kernel_driver_detached,
        })
    }

    pub fn summary(&self) -> &DeviceSummary {
        &self.summary
    }

    pub fn endpoint(&self) -> ResolvedEndpoint {
        self.endpoint
    }

    /// Bus number and address identifying this device
    pub fn location(&self) -> (u8, u8) {
        (self.device.bus_number(), self.device.address())
    }

    /// One bulk-IN transfer into `buf`
    pub fn read(&self, buf: &mut [u8], timeout: Duration) -> (TransferStatus, usize) {
        map_read_result(self.handle.read_bulk(self.endpoint.address, buf, timeout))
    }

    /// Clear a stall on the bulk-IN endpoint
    pub fn clear_halt(&mut self) {
        if let Err(e) = self.handle.clear_halt(self.endpoint.address) {
            warn!("Failed to clear halt on {:#04x}: {}", self.endpoint.address, e);
        }
    }
}

impl Drop for CaptureDevice {
    fn drop(&mut self) {
        let interface = self.endpoint.interface;
        if let Err(e) = self.handle.release_interface(interface) {
            debug!("Failed to release interface {}: {}", interface, e);
        }
        if self.kernel_driver_detached
            && let Err(e) = self.handle.attach_kernel_driver(interface)
        {
            debug!("Could not reattach kernel driver to interface {}: {}", interface, e);
        }
        debug!(
            "Closed device bus={} addr={}",
            self.summary.bus_number, self.summary.device_address
        );
    }
}
