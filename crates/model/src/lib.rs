//! Data model for usb-events
//!
//! This crate defines the types shared by every part of the watcher:
//! parsed device identities, registry records, canonical and public events,
//! and the per-platform policies (match key, mount strategy, drive-path
//! spelling).
//!
//! # Example
//!
//! ```
//! use model::{DeviceIdentity, UsbDevice};
//!
//! let id = DeviceIdentity::parse(r"USB\VID_0951&PID_1625\0019E06B9C85F9A0F7550C20").unwrap();
//! assert_eq!(id.vendor_id, "0951");
//!
//! let device = UsbDevice::from_identity(&id);
//! assert!(!device.is_mounted);
//! ```

pub mod device;
pub mod error;
pub mod events;
pub mod identity;
pub mod platform;

pub use device::{DeviceId, DeviceMetadata, UsbDevice};
pub use error::ModelError;
pub use events::{Change, DeviceEvent, DriveEvent, EventOrigin, WatcherEvent};
pub use identity::{DeviceIdentity, INSTANCE_PATH_SEPARATOR, parse_device_id};
pub use platform::{MatchKey, MountStrategy, Platform};
