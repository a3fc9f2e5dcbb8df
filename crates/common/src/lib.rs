//! Common utilities for the USB line logger
//!
//! This crate provides the pieces shared by the logger binary and the
//! integration tests: the async channel bridge to the USB thread, USB device
//! summaries and filters, error handling, logging setup and test fakes.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;
pub mod usb_types;

pub use channel::{UsbBridge, UsbCommand, UsbEvent, UsbWorker, create_usb_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{DeviceFilter, DeviceSummary};
