//! Mount resolution
//!
//! A storage device becomes visible on the bus well before the OS finishes
//! mounting its volume. [`MountResolver::resolve`] bridges that gap with a
//! bounded retry loop over a platform [`MountLookup`]. Exhausting the attempts
//! is not a failure: the device simply stays unmounted and a later poll tick
//! or volume event may still pick the mount up.

use crate::bus::DeviceDatabase;
use common::{Result, ShutdownListener};
use model::{Platform, UsbDevice};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Attempts for devices that arrive while the watcher runs
pub const DEFAULT_LIVE_ATTEMPTS: u32 = 9000;

/// Attempts for devices already present at startup
pub const DEFAULT_STARTUP_ATTEMPTS: u32 = 1;

/// Pause between attempts
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Platform query for a device's mount directory
///
/// Both calls are blocking and may touch the OS; they are only ever made
/// from blocking threads.
pub trait MountLookup: Send + Sync {
    /// Whether the device exposes a disk-class child at all
    fn has_storage(&self, device: &UsbDevice) -> bool;

    /// Current mount directory of the device's volume
    ///
    /// `Ok(None)` means the volume is known to be unmounted. An `Err` means
    /// the mount state could not be read and says nothing about the device.
    fn mount_point(&self, device: &UsbDevice) -> Result<Option<String>>;
}

/// Bounded-retry mount poller
#[derive(Clone)]
pub struct MountResolver {
    lookup: Arc<dyn MountLookup>,
    platform: Platform,
    retry_interval: Duration,
}

impl MountResolver {
    pub fn new(lookup: Arc<dyn MountLookup>, platform: Platform) -> Self {
        Self {
            lookup,
            platform,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Resolve the device's mount directory, or `""`
    ///
    /// Devices without storage return immediately without a single mount
    /// query. Otherwise the lookup runs up to `max_attempts` times (at least
    /// once), sleeping the retry interval between attempts, and stops early
    /// when `shutdown` fires.
    pub fn resolve(
        &self,
        device: &UsbDevice,
        max_attempts: u32,
        shutdown: &ShutdownListener,
    ) -> String {
        if !self.lookup.has_storage(device) {
            trace!("{} has no storage child, skipping mount lookup", device);
            return String::new();
        }

        let max_attempts = max_attempts.max(1);
        for attempt in 1..=max_attempts {
            if shutdown.is_triggered() {
                debug!("Mount resolution for {} cancelled", device.serial_number);
                break;
            }

            match self.lookup.mount_point(device) {
                Ok(Some(path)) => {
                    let path = self.platform.normalize_drive_path(&path);
                    if !path.is_empty() {
                        debug!(
                            "Resolved mount {} for {} after {} attempt(s)",
                            path, device.serial_number, attempt
                        );
                        return path;
                    }
                }
                Ok(None) => {}
                Err(e) => trace!("Mount lookup for {} failed: {}", device.serial_number, e),
            }

            if attempt < max_attempts {
                std::thread::sleep(self.retry_interval);
            }
        }

        debug!(
            "No mount for {} after {} attempt(s)",
            device.serial_number, max_attempts
        );
        String::new()
    }

    /// Single observation for the mount poller
    ///
    /// `None` when there is nothing to observe: the device has no storage,
    /// or the lookup failed. Otherwise the current mount directory, empty
    /// when unmounted.
    pub fn probe(&self, device: &UsbDevice) -> Option<String> {
        if !self.lookup.has_storage(device) {
            return None;
        }
        match self.lookup.mount_point(device) {
            Ok(path) => Some(
                path.map(|path| self.platform.normalize_drive_path(&path))
                    .unwrap_or_default(),
            ),
            Err(e) => {
                debug!("Skipping mount probe of {}: {}", device.serial_number, e);
                None
            }
        }
    }
}

/// Mount lookup backed by the OS device database
///
/// Storage is detected through hub-class entries sharing the serial. The
/// volume is chased disk drive → partition → logical disk by serial first;
/// when that finds nothing, the controller device list is walked for the
/// disk entry enumerated right after the device's own entry and the chase is
/// repeated from there.
pub struct DatabaseMountLookup {
    database: Arc<dyn DeviceDatabase>,
}

impl DatabaseMountLookup {
    pub fn new(database: Arc<dyn DeviceDatabase>) -> Self {
        Self { database }
    }

    /// Last logical disk reached from the disk drives matching `fragment`
    fn chase(&self, fragment: &str) -> Result<Option<String>> {
        let mut found = None;
        for disk in self.database.disk_drives(fragment)? {
            for partition in self.database.partitions(&disk)? {
                if let Some(logical) = self.database.logical_disks(&partition)?.pop() {
                    found = Some(logical);
                }
            }
        }
        Ok(found)
    }

    /// Disk entry following the device's own entry on the controller
    fn sibling_disk(&self, serial: &str) -> Result<Option<String>> {
        let devices = self.database.controller_devices()?;
        let sibling = devices
            .iter()
            .position(|id| id.contains(serial))
            .and_then(|index| devices.get(index + 1))
            .filter(|id| is_disk_entry(id))
            .cloned();
        Ok(sibling)
    }

    fn resolve_once(&self, serial: &str) -> Result<Option<String>> {
        if let Some(path) = self.chase(serial)? {
            return Ok(Some(path));
        }

        match self.sibling_disk(serial)? {
            Some(disk) => {
                trace!("Chasing sibling disk entry {}", disk);
                self.chase(&disk)
            }
            None => Ok(None),
        }
    }
}

fn is_disk_entry(device_id: &str) -> bool {
    device_id.to_ascii_uppercase().starts_with("USBSTOR\\")
}

impl MountLookup for DatabaseMountLookup {
    fn has_storage(&self, device: &UsbDevice) -> bool {
        if device.serial_number.is_empty() {
            return false;
        }
        match self.database.hub_entries(&device.serial_number) {
            Ok(count) => count > 0,
            Err(e) => {
                debug!("Hub query for {} failed: {}", device.serial_number, e);
                false
            }
        }
    }

    fn mount_point(&self, device: &UsbDevice) -> Result<Option<String>> {
        self.resolve_once(&device.serial_number)
    }
}

/// Mount lookup for hosts without a usable mount query
pub struct UnsupportedMountLookup;

impl MountLookup for UnsupportedMountLookup {
    fn has_storage(&self, _device: &UsbDevice) -> bool {
        false
    }

    fn mount_point(&self, _device: &UsbDevice) -> Result<Option<String>> {
        Ok(None)
    }
}
