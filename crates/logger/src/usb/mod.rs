//! USB subsystem
//!
//! Device selection, hot-plug handling and the bulk-IN read loop. Everything
//! here runs on the dedicated USB worker thread and talks to the Tokio runtime
//! only through the channel bridge.

pub mod device;
pub mod manager;
pub mod worker;

pub use manager::{DeviceManager, ManagerOptions};
pub use worker::{WorkerHandle, WorkerOptions, spawn_usb_worker};
