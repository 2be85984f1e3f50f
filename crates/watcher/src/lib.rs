//! USB attach/detach and removable-volume mount watcher
//!
//! The watcher merges raw notifications from a native USB monitor or an OS
//! event bus into one consistent [`DeviceRegistry`], resolves the mount
//! directory of storage devices, and publishes four events to subscribers:
//! device added, device removed, drive mounted and drive ejected.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use watcher::{Backend, UsbEventWatcher, WatcherOptions};
//! use watcher::mount::UnsupportedMountLookup;
//! use watcher::native::libusb::LibusbMonitor;
//!
//! # async fn run() -> common::Result<()> {
//! let backend = Backend::Native {
//!     monitor: Arc::new(LibusbMonitor),
//!     mounts: Arc::new(UnsupportedMountLookup),
//! };
//! let mut watcher = UsbEventWatcher::new(WatcherOptions::default(), backend);
//! let events = watcher.subscribe();
//! watcher.start().await?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{}", event.label());
//! }
//! watcher.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod coordinator;
pub mod metadata;
pub mod mount;
pub mod native;
pub mod normalizer;
pub mod registry;
pub mod test_utils;

pub use config::{MonitorKind, WatcherConfig};
pub use coordinator::{Backend, UsbEventWatcher, WatcherOptions};
pub use mount::{MountLookup, MountResolver};
pub use normalizer::{CanonicalEvent, Normalizer};
pub use registry::DeviceRegistry;
