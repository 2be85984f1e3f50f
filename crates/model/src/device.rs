//! USB device records
//!
//! A [`UsbDevice`] is the mutable registry record for one physically present
//! device instance: its identity, best-effort descriptive metadata, and the
//! mount state of its storage volume (if any).

use crate::identity::DeviceIdentity;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Registry-assigned device identifier
///
/// Stable for as long as the device stays in the registry. Mount resolution
/// and poll ticks address devices by this id so that updates racing with a
/// removal land on nothing rather than on a different device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

/// Descriptive metadata surfaced by a lookup or a native monitor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    pub device_name: String,
    pub product: String,
    pub product_description: String,
    pub vendor: String,
    pub vendor_description: String,
}

/// A USB device known to the watcher
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbDevice {
    /// Device node or caption (`/dev/bus/usb/001/004`, `Kingston DT 101 II`)
    pub device_name: String,
    /// Platform system path (sysfs path, PnP instance path, IORegistry location)
    pub system_path: String,
    pub product: String,
    pub product_description: String,
    pub product_id: String,
    pub serial_number: String,
    pub vendor: String,
    pub vendor_description: String,
    pub vendor_id: String,
    /// Resolved mount directory, empty while unmounted
    pub mounted_directory_path: String,
    pub is_mounted: bool,
    pub is_ejected: bool,
}

impl UsbDevice {
    /// Build a device from a parsed identity, with no metadata yet
    pub fn from_identity(identity: &DeviceIdentity) -> Self {
        Self {
            system_path: identity.system_path.clone(),
            product_id: identity.product_id.clone(),
            serial_number: identity.serial.clone(),
            vendor_id: identity.vendor_id.clone(),
            ..Default::default()
        }
    }

    /// Identity view of this record
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            vendor_id: self.vendor_id.clone(),
            product_id: self.product_id.clone(),
            serial: self.serial_number.clone(),
            system_path: self.system_path.clone(),
        }
    }

    /// Copy descriptive metadata into this record
    pub fn apply_metadata(&mut self, metadata: DeviceMetadata) {
        self.device_name = metadata.device_name;
        self.product = metadata.product;
        self.product_description = metadata.product_description;
        self.vendor = metadata.vendor;
        self.vendor_description = metadata.vendor_description;
    }

    /// Record a resolved mount directory
    pub fn mark_mounted(&mut self, path: &str) {
        self.mounted_directory_path = path.to_string();
        self.is_mounted = true;
        self.is_ejected = false;
    }

    /// Record loss of the mount
    pub fn mark_ejected(&mut self) {
        self.mounted_directory_path.clear();
        self.is_mounted = false;
        self.is_ejected = true;
    }
}

impl fmt::Display for UsbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} {} \"{}\" ({} {})",
            self.vendor_id,
            self.product_id,
            self.serial_number,
            self.device_name,
            self.vendor,
            self.product
        )?;
        if self.is_mounted {
            write!(f, " mounted at {}", self.mounted_directory_path)?;
        }
        Ok(())
    }
}
