//! USB device manager
//!
//! Picks the capture device, follows hot-plug arrival and removal, and owns
//! the open [`CaptureDevice`]. Runs in the USB thread.

use crate::usb::device::{CaptureDevice, summarize};
use capture::DeviceGate;
use common::usb_types::is_root_hub;
use common::{DeviceFilter, DeviceSummary, UsbEvent};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Device list polling period when libusb has no hot-plug support
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How the manager selects and opens devices
#[derive(Debug, Clone, Default)]
pub struct ManagerOptions {
    pub filters: Vec<DeviceFilter>,
    pub forced_interface: Option<u8>,
    pub detach_kernel_driver: bool,
    /// Open the first eligible device; off for listing only
    pub auto_attach: bool,
}

/// Whether a device may be selected for capture
pub fn is_eligible(filters: &[DeviceFilter], vendor_id: u16, product_id: u16, class: u8) -> bool {
    !is_root_hub(vendor_id, class) && DeviceFilter::allows(filters, vendor_id, product_id)
}

#[derive(Debug)]
enum HotplugEvent {
    Arrived(Device<Context>),
    Left { bus: u8, address: u8 },
}

/// Forwards libusb hot-plug callbacks into the worker loop
struct HotplugCallback {
    tx: async_channel::Sender<HotplugEvent>,
}

impl Hotplug<Context> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.tx.try_send(HotplugEvent::Arrived(device));
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.tx.try_send(HotplugEvent::Left {
            bus: device.bus_number(),
            address: device.address(),
        });
    }
}

pub struct DeviceManager {
    context: Context,
    options: ManagerOptions,
    gate: DeviceGate,
    active: Option<CaptureDevice>,
    /// Devices that failed to attach, skipped until they go away
    rejected: HashSet<(u8, u8)>,
    hotplug_rx: async_channel::Receiver<HotplugEvent>,
    hotplug_tx: async_channel::Sender<HotplugEvent>,
    _hotplug_registration: Option<Registration<Context>>,
    last_poll: Instant,
}

impl DeviceManager {
    pub fn new(options: ManagerOptions, gate: DeviceGate) -> Result<Self, rusb::Error> {
        let context = Context::new()?;
        let (hotplug_tx, hotplug_rx) = async_channel::unbounded();

        Ok(Self {
            context,
            options,
            gate,
            active: None,
            rejected: HashSet::new(),
            hotplug_rx,
            hotplug_tx,
            _hotplug_registration: None,
            last_poll: Instant::now(),
        })
    }

    /// Register for hot-plug and attach to a device already present
    pub fn initialize(&mut self) -> Vec<UsbEvent> {
        if !self.options.auto_attach {
            return Vec::new();
        }

        if rusb::has_hotplug() {
            let callback = HotplugCallback {
                tx: self.hotplug_tx.clone(),
            };
            match HotplugBuilder::new()
                .enumerate(false)
                .register(&self.context, Box::new(callback))
            {
                Ok(registration) => {
                    self._hotplug_registration = Some(registration);
                    debug!("Hot-plug callbacks registered");
                }
                Err(e) => warn!("Hot-plug registration failed, polling instead: {}", e),
            }
        } else {
            info!(
                "libusb has no hot-plug support, polling every {}s",
                POLL_INTERVAL.as_secs()
            );
        }

        self.scan()
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn active(&self) -> Option<&CaptureDevice> {
        self.active.as_ref()
    }

    pub fn active_mut(&mut self) -> Option<&mut CaptureDevice> {
        self.active.as_mut()
    }

    fn is_candidate(&self, device: &Device<Context>) -> bool {
        if self.rejected.contains(&(device.bus_number(), device.address())) {
            return false;
        }
        match device.device_descriptor() {
            Ok(desc) => is_eligible(
                &self.options.filters,
                desc.vendor_id(),
                desc.product_id(),
                desc.class_code(),
            ),
            Err(_) => false,
        }
    }

    /// Attach to the first eligible device if none is attached
    fn scan(&mut self) -> Vec<UsbEvent> {
        if self.active.is_some() {
            return Vec::new();
        }

        let devices = match self.context.devices() {
            Ok(list) => list,
            Err(e) => {
                warn!("Failed to enumerate USB devices: {}", e);
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        for device in devices.iter() {
            if !self.is_candidate(&device) {
                continue;
            }
            let event = self.attach(device);
            let attached = matches!(event, UsbEvent::DeviceAttached { .. });
            events.push(event);
            if attached {
                break;
            }
        }
        events
    }

    fn attach(&mut self, device: Device<Context>) -> UsbEvent {
        let bus_number = device.bus_number();
        let device_address = device.address();

        match CaptureDevice::open(
            device,
            self.options.forced_interface,
            self.options.detach_kernel_driver,
        ) {
            Ok(session) => {
                let summary = session.summary().clone();
                let endpoint = session.endpoint();
                self.active = Some(session);
                self.gate.open();
                info!("Attached {}", summary);
                UsbEvent::DeviceAttached {
                    device: summary,
                    endpoint,
                }
            }
            Err(e) => {
                warn!(
                    "Not reading device bus={} addr={}: {}",
                    bus_number, device_address, e
                );
                self.rejected.insert((bus_number, device_address));
                UsbEvent::AttachFailed {
                    bus_number,
                    device_address,
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Drop the active device, closing the gate before the handle is released
    pub fn detach(&mut self) -> Option<UsbEvent> {
        self.gate.close();
        let session = self.active.take()?;
        let (bus_number, device_address) = session.location();
        drop(session);

        info!("Device detached: bus={} addr={}", bus_number, device_address);
        Some(UsbEvent::DeviceDetached {
            bus_number,
            device_address,
        })
    }

    /// Apply pending hot-plug notifications, or poll when hot-plug is absent
    pub fn process_hotplug(&mut self) -> Vec<UsbEvent> {
        if !self.options.auto_attach {
            return Vec::new();
        }

        let mut events = Vec::new();
        while let Ok(event) = self.hotplug_rx.try_recv() {
            match event {
                HotplugEvent::Left { bus, address } => {
                    self.rejected.remove(&(bus, address));
                    if self
                        .active
                        .as_ref()
                        .is_some_and(|s| s.location() == (bus, address))
                    {
                        events.extend(self.detach());
                    }
                }
                HotplugEvent::Arrived(device) => {
                    if self.active.is_none() && self.is_candidate(&device) {
                        events.push(self.attach(device));
                    }
                }
            }
        }

        if self._hotplug_registration.is_none() && self.last_poll.elapsed() >= POLL_INTERVAL {
            self.last_poll = Instant::now();
            events.extend(self.poll());
        }

        events
    }

    fn poll(&mut self) -> Vec<UsbEvent> {
        let present: HashSet<(u8, u8)> = match self.context.devices() {
            Ok(list) => list.iter().map(|d| (d.bus_number(), d.address())).collect(),
            Err(e) => {
                warn!("Failed to enumerate USB devices: {}", e);
                return Vec::new();
            }
        };

        self.rejected.retain(|loc| present.contains(loc));

        let mut events = Vec::new();
        if self
            .active
            .as_ref()
            .is_some_and(|s| !present.contains(&s.location()))
        {
            events.extend(self.detach());
        }
        events.extend(self.scan());
        events
    }

    /// All attached devices except root hubs
    pub fn list_devices(&self) -> Vec<DeviceSummary> {
        let devices = match self.context.devices() {
            Ok(list) => list,
            Err(e) => {
                warn!("Failed to enumerate USB devices: {}", e);
                return Vec::new();
            }
        };

        devices
            .iter()
            .filter_map(|device| {
                if let Some(session) = &self.active
                    && session.location() == (device.bus_number(), device.address())
                {
                    return Some(session.summary().clone());
                }
                let desc = device.device_descriptor().ok()?;
                if is_root_hub(desc.vendor_id(), desc.class_code()) {
                    return None;
                }
                summarize(&device, self.options.forced_interface)
            })
            .collect()
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.gate.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eligibility() {
        let filters = vec![
            "0x2e8a:*".parse::<DeviceFilter>().unwrap(),
            "0x0403:0x6001".parse::<DeviceFilter>().unwrap(),
        ];

        assert!(is_eligible(&filters, 0x2e8a, 0x000a, 0x02));
        assert!(is_eligible(&filters, 0x0403, 0x6001, 0x00));
        assert!(!is_eligible(&filters, 0x0403, 0x6010, 0x00));

        // Root hubs never qualify, even with an open filter
        assert!(!is_eligible(&[], 0x1d6b, 0x0002, 0x09));
        assert!(is_eligible(&[], 0x1d6b, 0x0104, 0xef));
        assert!(is_eligible(&[], 0x1234, 0x5678, 0x00));
    }

    #[test]
    fn test_manager_creation() {
        let gate = DeviceGate::new();
        // May fail without a USB stack
        if let Ok(mut manager) = DeviceManager::new(ManagerOptions::default(), gate.clone()) {
            assert!(manager.initialize().is_empty());
            assert!(manager.active().is_none());
            assert!(manager.detach().is_none());
            assert!(!gate.is_open());
        }
    }
}
