//! Descriptive metadata lookup against the device database

use crate::bus::{DeviceDatabase, PORTABLE_DEVICES_CLASS_GUID, PnpEntity};
use common::Result;
use model::DeviceMetadata;
use tracing::{debug, trace};

/// Look up name, product and vendor strings for a serial number
///
/// Every entity whose device id contains the serial is visited in order and
/// overwrites all five fields; absent values become empty. A portable-device
/// entry wins outright: the walk stops as soon as one is seen. An empty
/// serial or an empty result gives empty metadata.
pub fn lookup_metadata(database: &dyn DeviceDatabase, serial: &str) -> Result<DeviceMetadata> {
    let mut metadata = DeviceMetadata::default();
    if serial.is_empty() {
        return Ok(metadata);
    }

    let entities = database.entities(serial)?;
    trace!("{} database entities match serial {}", entities.len(), serial);

    for entity in &entities {
        apply_entity(&mut metadata, entity);
        if is_portable_device(entity) {
            debug!("Portable device entry {} is authoritative", entity.device_id);
            break;
        }
    }

    Ok(metadata)
}

fn apply_entity(metadata: &mut DeviceMetadata, entity: &PnpEntity) {
    let description = field(&entity.description);
    let manufacturer = field(&entity.manufacturer);

    metadata.device_name = field(&entity.caption);
    metadata.product = description.clone();
    metadata.product_description = description;
    metadata.vendor = manufacturer.clone();
    metadata.vendor_description = manufacturer;
}

fn field(value: &Option<String>) -> String {
    value.as_deref().map(str::trim).unwrap_or_default().to_string()
}

fn is_portable_device(entity: &PnpEntity) -> bool {
    entity
        .class_guid
        .eq_ignore_ascii_case(PORTABLE_DEVICES_CLASS_GUID)
}
