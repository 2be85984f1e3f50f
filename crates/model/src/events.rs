//! Canonical and public event types
//!
//! Raw notifications from every source are normalized into two canonical
//! events, [`DriveEvent`] and [`DeviceEvent`]. The registry turns those into
//! the four public [`WatcherEvent`] notifications.

use crate::device::UsbDevice;
use serde::{Deserialize, Serialize};

/// Direction of a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Change {
    Inserted,
    Removed,
}

/// Where a device notification came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOrigin {
    /// Device was already present when the watcher started
    Startup,
    /// Live hot-plug notification
    Live,
}

/// A removable volume appeared or disappeared
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveEvent {
    pub path: String,
    pub change: Change,
}

/// A USB device was inserted or removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEvent {
    /// Identity plus whatever metadata the source surfaced
    pub device: UsbDevice,
    pub change: Change,
    pub origin: EventOrigin,
}

/// Notification delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum WatcherEvent {
    DeviceAdded(UsbDevice),
    DeviceRemoved(UsbDevice),
    DriveMounted(String),
    DriveEjected(String),
}

impl WatcherEvent {
    /// Short label used in logs and text output
    pub fn label(&self) -> &'static str {
        match self {
            WatcherEvent::DeviceAdded(_) => "Added",
            WatcherEvent::DeviceRemoved(_) => "Removed",
            WatcherEvent::DriveMounted(_) => "Mounted",
            WatcherEvent::DriveEjected(_) => "Ejected",
        }
    }
}
