//! OS device/volume event bus and device database interfaces
//!
//! The management event bus and the device database are external
//! collaborators. This module fixes the boundary the engine talks to: which
//! subscriptions it opens ([`BusQuery`]), how notifications come back (as
//! [`RawEvent`]s pushed into an [`EventSink`]), and the point-in-time queries
//! the metadata lookup and mount resolver need ([`DeviceDatabase`]).

use common::{EventSink, InstancePayload, Result};
use model::Change;

/// Class GUID of portable devices (WPD)
///
/// Flash drives expose several PnP entities sharing their serial; only the
/// entry of this class carries the user-facing volume caption.
pub const PORTABLE_DEVICES_CLASS_GUID: &str = "{eec5ad98-8080-425f-922a-dabf3de3f69a}";

/// Volume change event type: device arrival
pub const VOLUME_ARRIVAL: u16 = 2;

/// Volume change event type: device removal
pub const VOLUME_REMOVAL: u16 = 3;

/// Subscriptions the engine opens on the event bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusQuery {
    VolumeChange,
    ControllerDeviceCreation,
    ControllerDeviceDeletion,
    PnpEntityCreation,
    PnpEntityDeletion,
}

impl BusQuery {
    /// Instance creation/deletion pair for the configured breadth
    ///
    /// The broad pair sees every PnP entity (complete, costlier); the narrow
    /// pair only sees controller associations.
    pub fn instance_queries(broad: bool) -> [BusQuery; 2] {
        if broad {
            [BusQuery::PnpEntityCreation, BusQuery::PnpEntityDeletion]
        } else {
            [
                BusQuery::ControllerDeviceCreation,
                BusQuery::ControllerDeviceDeletion,
            ]
        }
    }

    /// Query text handed to the bus
    pub fn query_text(self) -> &'static str {
        match self {
            BusQuery::VolumeChange => {
                "SELECT * FROM Win32_VolumeChangeEvent WHERE EventType = 2 or EventType = 3"
            }
            BusQuery::ControllerDeviceCreation => {
                "SELECT * FROM __InstanceCreationEvent WITHIN 2 WHERE TargetInstance ISA 'Win32_USBControllerDevice'"
            }
            BusQuery::ControllerDeviceDeletion => {
                "SELECT * FROM __InstanceDeletionEvent WITHIN 2 WHERE TargetInstance ISA 'Win32_USBControllerDevice'"
            }
            BusQuery::PnpEntityCreation => {
                "SELECT * FROM __InstanceCreationEvent WITHIN 2 WHERE TargetInstance ISA 'Win32_PnPEntity'"
            }
            BusQuery::PnpEntityDeletion => {
                "SELECT * FROM __InstanceDeletionEvent WITHIN 2 WHERE TargetInstance ISA 'Win32_PnPEntity'"
            }
        }
    }

    /// Facility name used in logs and setup errors
    pub fn source_name(self) -> &'static str {
        match self {
            BusQuery::VolumeChange => "bus:volume-change",
            BusQuery::ControllerDeviceCreation => "bus:controller-creation",
            BusQuery::ControllerDeviceDeletion => "bus:controller-deletion",
            BusQuery::PnpEntityCreation => "bus:pnp-creation",
            BusQuery::PnpEntityDeletion => "bus:pnp-deletion",
        }
    }

    /// Change reported by an instance query, `None` for the volume query
    pub fn instance_change(self) -> Option<Change> {
        match self {
            BusQuery::VolumeChange => None,
            BusQuery::ControllerDeviceCreation | BusQuery::PnpEntityCreation => {
                Some(Change::Inserted)
            }
            BusQuery::ControllerDeviceDeletion | BusQuery::PnpEntityDeletion => {
                Some(Change::Removed)
            }
        }
    }

    /// Wrap an instance handle the way this query delivers it
    pub fn payload(self, raw: String) -> InstancePayload {
        match self {
            BusQuery::PnpEntityCreation | BusQuery::PnpEntityDeletion => {
                InstancePayload::DeviceId(raw)
            }
            _ => InstancePayload::Dependent(raw),
        }
    }
}

/// A live bus subscription
pub trait BusSubscription: Send + Sync {
    /// Stop delivery. Must be safe to call more than once.
    fn cancel(&mut self);
}

/// OS device/volume event bus
///
/// Implementations deliver every notification for `query` into `sink`:
/// volume queries as [`common::RawEvent::VolumeChange`], instance queries as
/// [`common::RawEvent::Instance`] with [`BusQuery::instance_change`] and
/// [`BusQuery::payload`].
pub trait DeviceBus: Send + Sync {
    fn subscribe(&self, query: BusQuery, sink: EventSink) -> Result<Box<dyn BusSubscription>>;

    /// Instance handles currently present for an instance query
    fn present_instances(&self, query: BusQuery) -> Result<Vec<InstancePayload>>;

    /// Removable volumes mounted right now
    fn removable_volumes(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Descriptive entry from the device database
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PnpEntity {
    pub device_id: String,
    pub class_guid: String,
    pub caption: Option<String>,
    pub description: Option<String>,
    pub manufacturer: Option<String>,
}

/// Point-in-time device database queries
///
/// Every `fragment` argument is a substring match on the entry's device
/// path. Empty results are normal and are not errors.
pub trait DeviceDatabase: Send + Sync {
    /// Entities whose device id contains `fragment`
    fn entities(&self, fragment: &str) -> Result<Vec<PnpEntity>>;

    /// Number of hub-class entries whose device id contains `fragment`
    fn hub_entries(&self, fragment: &str) -> Result<usize>;

    /// Disk drive ids whose PnP id contains `fragment`
    fn disk_drives(&self, fragment: &str) -> Result<Vec<String>>;

    /// Partitions associated with a disk drive
    fn partitions(&self, disk_id: &str) -> Result<Vec<String>>;

    /// Logical disks associated with a partition
    fn logical_disks(&self, partition_id: &str) -> Result<Vec<String>>;

    /// Every device on the USB controllers, in enumeration order
    fn controller_devices(&self) -> Result<Vec<String>>;
}
