//! Device registry and reconciliation
//!
//! The registry owns the two lists the watcher exposes: known devices (in
//! insertion order) and mounted drive paths (in discovery order). Every
//! mutation runs under one lock and public events are emitted from inside
//! that critical section, so subscribers see events in the same order the
//! lists changed.
//!
//! Device state machine:
//!
//! ```text
//! Unknown ──insert──▶ Present(unmounted) ──mount──▶ Present(mounted)
//!                           ▲    │                      │
//!                           └────┼──────eject───────────┤
//!                                ▼                      ▼
//!                             Removed ◀────remove───────┘
//! ```

use async_channel::{Receiver, Sender, unbounded};
use model::{Change, DeviceId, DriveEvent, MatchKey, UsbDevice, WatcherEvent};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, trace};

/// Authoritative in-memory device state
pub struct DeviceRegistry {
    match_key: MatchKey,
    state: Mutex<RegistryState>,
}

/// Registered device plus the last directory it was seen mounted at
///
/// `last_mount` survives a volume removal so the same volume arriving again
/// can be correlated back to the device.
struct Entry {
    id: DeviceId,
    device: UsbDevice,
    last_mount: String,
}

#[derive(Default)]
struct RegistryState {
    devices: Vec<Entry>,
    drive_paths: Vec<String>,
    next_id: u32,
    subscribers: Vec<Sender<WatcherEvent>>,
}

impl RegistryState {
    fn emit(&mut self, event: WatcherEvent) {
        info!("{}: {}", event.label(), describe(&event));
        self.subscribers
            .retain(|tx| tx.try_send(event.clone()).is_ok());
    }

    fn entry_mut(&mut self, id: DeviceId) -> Option<&mut Entry> {
        self.devices.iter_mut().find(|entry| entry.id == id)
    }

    /// Add a drive path, emitting only if it was not listed yet
    fn list_drive(&mut self, path: &str) {
        if !self.drive_paths.iter().any(|p| p == path) {
            self.drive_paths.push(path.to_string());
            self.emit(WatcherEvent::DriveMounted(path.to_string()));
        }
    }

    /// Remove a drive path, emitting only if it was listed
    fn unlist_drive(&mut self, path: &str) {
        if let Some(index) = self.drive_paths.iter().position(|p| p == path) {
            self.drive_paths.remove(index);
            self.emit(WatcherEvent::DriveEjected(path.to_string()));
        }
    }
}

fn describe(event: &WatcherEvent) -> String {
    match event {
        WatcherEvent::DeviceAdded(device) | WatcherEvent::DeviceRemoved(device) => {
            device.to_string()
        }
        WatcherEvent::DriveMounted(path) | WatcherEvent::DriveEjected(path) => path.clone(),
    }
}

impl DeviceRegistry {
    pub fn new(match_key: MatchKey) -> Self {
        Self {
            match_key,
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn match_key(&self) -> MatchKey {
        self.match_key
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // A panicking subscriber must not wedge every event source.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Receive every public event emitted from now on
    ///
    /// Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<WatcherEvent> {
        let (tx, rx) = unbounded();
        self.lock().subscribers.push(tx);
        rx
    }

    /// Snapshot of known devices, in insertion order
    pub fn devices(&self) -> Vec<UsbDevice> {
        self.lock()
            .devices
            .iter()
            .map(|entry| entry.device.clone())
            .collect()
    }

    /// Snapshot of mounted drive paths, in discovery order
    pub fn drive_paths(&self) -> Vec<String> {
        self.lock().drive_paths.clone()
    }

    pub fn device(&self, id: DeviceId) -> Option<UsbDevice> {
        self.lock()
            .devices
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.device.clone())
    }

    /// Devices the mount poller can query (non-empty system path)
    pub fn pollable_devices(&self) -> Vec<(DeviceId, UsbDevice)> {
        self.lock()
            .devices
            .iter()
            .filter(|entry| !entry.device.system_path.is_empty())
            .map(|entry| (entry.id, entry.device.clone()))
            .collect()
    }

    /// Register a newly inserted device
    ///
    /// Returns `None` when a device with the same match key is already
    /// registered; nothing is emitted in that case.
    pub fn insert_device(&self, device: UsbDevice) -> Option<DeviceId> {
        let mut state = self.lock();

        if state
            .devices
            .iter()
            .any(|entry| self.match_key.matches(&entry.device, &device))
        {
            trace!("Duplicate insertion of {} ignored", device);
            return None;
        }

        let id = DeviceId(state.next_id);
        state.next_id = state.next_id.wrapping_add(1);
        state.devices.push(Entry {
            id,
            device: device.clone(),
            last_mount: String::new(),
        });
        state.emit(WatcherEvent::DeviceAdded(device));
        Some(id)
    }

    /// Remove the device matching `removed` under the match key
    ///
    /// If the registered device's mount path is still listed it is ejected
    /// first. Unmatched removals are ignored and return `None`.
    pub fn remove_device(&self, removed: &UsbDevice) -> Option<UsbDevice> {
        let mut state = self.lock();

        let Some(index) = state
            .devices
            .iter()
            .position(|entry| self.match_key.matches(&entry.device, removed))
        else {
            trace!("Removal of unknown device {} ignored", removed);
            return None;
        };

        let device = state.devices.remove(index).device;
        if !device.mounted_directory_path.is_empty() {
            state.unlist_drive(&device.mounted_directory_path);
        }
        state.emit(WatcherEvent::DeviceRemoved(device.clone()));
        Some(device)
    }

    /// Apply a volume mount/unmount seen directly on the event bus
    ///
    /// A removal ejects devices mounted at the event path. An arrival
    /// re-mounts devices last seen at that path, including ones ejected by an
    /// earlier removal. The drive list changes whether or not any device
    /// correlates.
    pub fn apply_drive_event(&self, event: &DriveEvent) {
        let mut state = self.lock();

        for entry in state.devices.iter_mut() {
            match event.change {
                Change::Inserted if entry.last_mount == event.path => {
                    if !entry.device.is_mounted {
                        debug!("Volume {} is back for {:?}", event.path, entry.id);
                    }
                    entry.device.mark_mounted(&event.path);
                }
                Change::Removed if entry.device.mounted_directory_path == event.path => {
                    entry.device.mark_ejected();
                }
                _ => {}
            }
        }

        match event.change {
            Change::Inserted => state.list_drive(&event.path),
            Change::Removed => state.unlist_drive(&event.path),
        }
    }

    /// Record the outcome of mount resolution for a device
    ///
    /// An empty path means resolution gave up; it never clears a mount
    /// that is already known.
    pub fn record_mount(&self, id: DeviceId, path: &str) {
        if path.is_empty() {
            return;
        }
        self.observe_mount(id, path);
    }

    /// Apply an observed mount state from a poll tick
    ///
    /// Empty means the device's volume is gone: a mounted device is ejected.
    /// A new path mounts the device, ejecting any previous path first.
    pub fn observe_mount(&self, id: DeviceId, path: &str) {
        let mut state = self.lock();

        let Some(entry) = state.entry_mut(id) else {
            trace!("Mount update for removed device {:?} ignored", id);
            return;
        };
        if !path.is_empty() {
            entry.last_mount = path.to_string();
        }

        let device = &mut entry.device;
        let previous = device.mounted_directory_path.clone();
        if previous == path {
            if !path.is_empty() && !device.is_mounted {
                device.mark_mounted(path);
            }
            if !path.is_empty() {
                state.list_drive(path);
            }
            return;
        }

        if path.is_empty() {
            device.mark_ejected();
        } else {
            device.mark_mounted(path);
        }
        debug!(
            "Device {:?} mount changed from {:?} to {:?}",
            id, previous, path
        );

        if !previous.is_empty() {
            state.unlist_drive(&previous);
        }
        if !path.is_empty() {
            state.list_drive(path);
        }
    }

    /// Add drive paths that were already mounted at startup, without events
    pub fn seed_drive_paths<I>(&self, paths: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut state = self.lock();
        for path in paths {
            if !path.is_empty() && !state.drive_paths.contains(&path) {
                state.drive_paths.push(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{create_kingston_device, create_mock_native_device};

    fn drain(rx: &Receiver<WatcherEvent>) -> Vec<WatcherEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_insert_assigns_distinct_ids() {
        let registry = DeviceRegistry::new(MatchKey::NameAndSystemPath);
        let a = registry.insert_device(create_mock_native_device(1)).unwrap();
        let b = registry.insert_device(create_mock_native_device(2)).unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.device(b).unwrap().serial_number, "SN000002");
    }

    #[test]
    fn test_record_mount_ignores_empty_resolution() {
        let registry = DeviceRegistry::new(MatchKey::NameAndSystemPath);
        let rx = registry.subscribe();
        let id = registry.insert_device(create_kingston_device()).unwrap();

        registry.record_mount(id, "/media/user/KINGSTON");
        registry.record_mount(id, "");

        let device = registry.device(id).unwrap();
        assert!(device.is_mounted);
        assert_eq!(device.mounted_directory_path, "/media/user/KINGSTON");
        assert_eq!(
            drain(&rx),
            vec![
                WatcherEvent::DeviceAdded(create_kingston_device()),
                WatcherEvent::DriveMounted("/media/user/KINGSTON".to_string()),
            ]
        );
    }

    #[test]
    fn test_observe_mount_path_change() {
        let registry = DeviceRegistry::new(MatchKey::NameAndSystemPath);
        let id = registry.insert_device(create_kingston_device()).unwrap();
        let rx = registry.subscribe();

        registry.observe_mount(id, "/media/a");
        registry.observe_mount(id, "/media/a");
        registry.observe_mount(id, "/media/b");

        assert_eq!(
            drain(&rx),
            vec![
                WatcherEvent::DriveMounted("/media/a".to_string()),
                WatcherEvent::DriveEjected("/media/a".to_string()),
                WatcherEvent::DriveMounted("/media/b".to_string()),
            ]
        );
        assert_eq!(registry.drive_paths(), vec!["/media/b".to_string()]);
    }

    #[test]
    fn test_updates_for_removed_device_are_ignored() {
        let registry = DeviceRegistry::new(MatchKey::NameAndSystemPath);
        let device = create_kingston_device();
        let id = registry.insert_device(device.clone()).unwrap();
        registry.remove_device(&device).unwrap();

        let rx = registry.subscribe();
        registry.record_mount(id, "/media/late");

        assert!(drain(&rx).is_empty());
        assert!(registry.drive_paths().is_empty());
    }

    #[test]
    fn test_closed_subscribers_are_pruned() {
        let registry = DeviceRegistry::new(MatchKey::Serial);
        let kept = registry.subscribe();
        drop(registry.subscribe());

        registry.seed_drive_paths(vec!["E:\\".to_string()]);
        registry.insert_device(create_kingston_device());

        assert_eq!(drain(&kept).len(), 1);
        assert_eq!(registry.lock().subscribers.len(), 1);
        assert_eq!(registry.drive_paths(), vec!["E:\\".to_string()]);
    }
}
