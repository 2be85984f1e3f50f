//! Raw event normalization
//!
//! Turns every [`RawEvent`] into at most one canonical event. Volume changes
//! become [`DriveEvent`]s; instance notifications and native callbacks
//! become [`DeviceEvent`]s. Anything that does not parse as a USB device is
//! dropped here without complaint: most bus traffic is not USB.

use crate::bus::{DeviceDatabase, VOLUME_ARRIVAL, VOLUME_REMOVAL};
use crate::metadata::lookup_metadata;
use common::{InstancePayload, RawEvent};
use model::{Change, DeviceEvent, DeviceIdentity, DriveEvent, Platform, UsbDevice};
use std::sync::Arc;
use tracing::{debug, trace};

/// Output of [`Normalizer::normalize`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonicalEvent {
    Drive(DriveEvent),
    Device(DeviceEvent),
}

/// Source adapter from raw notifications to canonical events
#[derive(Clone)]
pub struct Normalizer {
    platform: Platform,
    database: Option<Arc<dyn DeviceDatabase>>,
}

impl Normalizer {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            database: None,
        }
    }

    /// Enable metadata lookup for bus-sourced insertions
    pub fn with_database(mut self, database: Arc<dyn DeviceDatabase>) -> Self {
        self.database = Some(database);
        self
    }

    /// Normalize one raw notification
    ///
    /// May block on a metadata query; callers on the async side run it on a
    /// blocking thread.
    pub fn normalize(&self, raw: RawEvent) -> Option<CanonicalEvent> {
        match raw {
            RawEvent::VolumeChange {
                drive_name,
                event_type,
            } => self.normalize_volume(&drive_name, event_type),

            RawEvent::Instance {
                change,
                payload,
                origin,
            } => {
                let device_id = instance_device_id(&payload)?;
                let Some(identity) = DeviceIdentity::parse(&device_id) else {
                    trace!("Dropping non-USB instance {}", device_id);
                    return None;
                };

                let mut device = UsbDevice::from_identity(&identity);
                if change == Change::Inserted {
                    self.fill_metadata(&mut device);
                }

                Some(CanonicalEvent::Device(DeviceEvent {
                    device,
                    change,
                    origin,
                }))
            }

            RawEvent::Native {
                change,
                device,
                origin,
            } => Some(CanonicalEvent::Device(DeviceEvent {
                device,
                change,
                origin,
            })),
        }
    }

    fn normalize_volume(&self, drive_name: &str, event_type: u16) -> Option<CanonicalEvent> {
        let change = match event_type {
            VOLUME_ARRIVAL => Change::Inserted,
            VOLUME_REMOVAL => Change::Removed,
            other => {
                trace!("Ignoring volume event type {} for {}", other, drive_name);
                return None;
            }
        };

        let path = self.platform.normalize_drive_path(drive_name);
        if path.is_empty() {
            return None;
        }

        Some(CanonicalEvent::Drive(DriveEvent { path, change }))
    }

    fn fill_metadata(&self, device: &mut UsbDevice) {
        let Some(database) = &self.database else {
            return;
        };

        match lookup_metadata(database.as_ref(), &device.serial_number) {
            Ok(metadata) => device.apply_metadata(metadata),
            Err(e) => debug!(
                "Metadata lookup for {} failed: {}",
                device.serial_number, e
            ),
        }
    }
}

/// Raw device path carried by an instance notification
fn instance_device_id(payload: &InstancePayload) -> Option<String> {
    match payload {
        InstancePayload::Dependent(dependent) => dependent_device_id(dependent),
        InstancePayload::DeviceId(id) => Some(id.clone()),
    }
}

/// Unwrap the device id from a controller association reference
///
/// The id is the text between the first pair of double quotes, with doubled
/// backslashes collapsed: `...DeviceID="USB\\VID_0951&PID_1625\\S1"` gives
/// `USB\VID_0951&PID_1625\S1`.
pub fn dependent_device_id(dependent: &str) -> Option<String> {
    let quoted = dependent.split('"').nth(1)?;
    Some(quoted.replace(r"\\", r"\"))
}
