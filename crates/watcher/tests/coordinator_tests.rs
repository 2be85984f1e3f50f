//! Watcher Lifecycle Integration Tests
//!
//! Drives a complete [`UsbEventWatcher`] through the in-memory fakes.
//!
//! # Test Scenarios
//! - Native monitor insert/remove, startup enumeration, setup failure
//! - Event bus subscriptions, metadata, volume events, mount resolution
//! - Mount polling and eject detection
//! - Start/stop idempotence and cancellation
//!
//! Run with: `cargo test -p watcher --test coordinator_tests`

use async_channel::Receiver;
use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, KINGSTON_INSTANCE, KINGSTON_SERIAL, create_kingston_device,
    create_mock_device_list, with_timeout,
};
use common::Error;
use model::{Platform, WatcherEvent};
use std::sync::Arc;
use std::time::Duration;
use watcher::bus::{BusQuery, PnpEntity, VOLUME_ARRIVAL, VOLUME_REMOVAL};
use watcher::test_utils::{FakeBus, FakeDatabase, FakeMonitor, ScriptedMountLookup};
use watcher::{Backend, UsbEventWatcher, WatcherOptions};

fn fast_options(platform: Platform) -> WatcherOptions {
    WatcherOptions {
        platform,
        live_attempts: 50,
        retry_interval: Duration::from_millis(1),
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

fn native(monitor: &Arc<FakeMonitor>, mounts: &Arc<ScriptedMountLookup>) -> Backend {
    Backend::Native {
        monitor: monitor.clone(),
        mounts: mounts.clone(),
    }
}

fn bus_backend(bus: &Arc<FakeBus>, database: &Arc<FakeDatabase>) -> Backend {
    Backend::Bus {
        bus: bus.clone(),
        database: database.clone(),
    }
}

async fn next_event(rx: &Receiver<WatcherEvent>) -> WatcherEvent {
    with_timeout(DEFAULT_TEST_TIMEOUT, rx.recv())
        .await
        .expect("Timed out waiting for watcher event")
        .expect("Event stream closed")
}

async fn assert_quiet(rx: &Receiver<WatcherEvent>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "unexpected event");
}

fn kingston_entity() -> PnpEntity {
    PnpEntity {
        device_id: KINGSTON_INSTANCE.to_string(),
        class_guid: "{36fc9e60-c465-11cf-8056-444553540000}".to_string(),
        caption: Some("Kingston DT 101 II USB Device".to_string()),
        description: Some("USB Mass Storage Device".to_string()),
        manufacturer: Some("Kingston".to_string()),
    }
}

// ============================================================================
// Native Monitor Tests
// ============================================================================

#[tokio::test]
async fn test_native_insert_and_remove() {
    let monitor = Arc::new(FakeMonitor::new());
    let mounts = Arc::new(ScriptedMountLookup::without_storage());
    let mut watcher = UsbEventWatcher::new(fast_options(Platform::Linux), native(&monitor, &mounts));
    let events = watcher.subscribe();

    watcher.start().await.unwrap();
    assert!(watcher.is_running());

    let kingston = create_kingston_device();
    assert!(monitor.insert(kingston.clone()));
    assert_eq!(
        next_event(&events).await,
        WatcherEvent::DeviceAdded(kingston.clone())
    );

    // Duplicate callback for the same device.
    assert!(monitor.insert(kingston.clone()));
    assert_quiet(&events).await;
    assert_eq!(watcher.devices().len(), 1);

    assert!(monitor.remove(kingston.clone()));
    assert_eq!(
        next_event(&events).await,
        WatcherEvent::DeviceRemoved(kingston)
    );
    assert!(watcher.devices().is_empty());
    assert_eq!(mounts.mount_calls(), 0);

    watcher.stop().await;
    assert!(!watcher.is_running());
}

#[tokio::test]
async fn test_include_present_enumerates_at_start() {
    let present = create_mock_device_list(2);
    let monitor = Arc::new(FakeMonitor::with_present(present.clone()));
    let mounts = Arc::new(ScriptedMountLookup::without_storage());
    let options = WatcherOptions {
        include_present: true,
        include_tty: true,
        ..fast_options(Platform::Linux)
    };
    let mut watcher = UsbEventWatcher::new(options, native(&monitor, &mounts));
    let events = watcher.subscribe();

    watcher.start().await.unwrap();

    for device in present {
        assert_eq!(next_event(&events).await, WatcherEvent::DeviceAdded(device));
    }
    assert_eq!(monitor.last_options().map(|o| o.include_tty), Some(true));

    watcher.stop().await;
}

#[tokio::test]
async fn test_present_devices_not_reported_by_default() {
    let monitor = Arc::new(FakeMonitor::with_present(create_mock_device_list(2)));
    let mounts = Arc::new(ScriptedMountLookup::without_storage());
    let mut watcher = UsbEventWatcher::new(fast_options(Platform::Linux), native(&monitor, &mounts));
    let events = watcher.subscribe();

    watcher.start().await.unwrap();
    assert_quiet(&events).await;
    assert!(watcher.devices().is_empty());

    watcher.stop().await;
}

#[tokio::test]
async fn test_monitor_setup_failure_is_reported() {
    let monitor = Arc::new(FakeMonitor::failing("Operation not permitted"));
    let mounts = Arc::new(ScriptedMountLookup::without_storage());
    let mut watcher = UsbEventWatcher::new(fast_options(Platform::Linux), native(&monitor, &mounts));

    let err = watcher.start().await.unwrap_err();
    assert_eq!(err.failed_sources(), vec!["fake-monitor"]);
    assert!(err.to_string().contains("Operation not permitted"));

    watcher.stop().await;
}

// ============================================================================
// Mount Tests
// ============================================================================

#[tokio::test]
async fn test_live_insert_resolves_mount() {
    let monitor = Arc::new(FakeMonitor::new());
    let mounts = Arc::new(ScriptedMountLookup::mounted_after(3, "/media/user/KINGSTON/"));
    let mut watcher = UsbEventWatcher::new(fast_options(Platform::Linux), native(&monitor, &mounts));
    let events = watcher.subscribe();
    watcher.start().await.unwrap();

    monitor.insert(create_kingston_device());

    assert!(matches!(
        next_event(&events).await,
        WatcherEvent::DeviceAdded(_)
    ));
    assert_eq!(
        next_event(&events).await,
        WatcherEvent::DriveMounted("/media/user/KINGSTON".to_string())
    );
    assert_quiet(&events).await;

    let device = &watcher.devices()[0];
    assert!(device.is_mounted);
    assert_eq!(device.mounted_directory_path, "/media/user/KINGSTON");

    watcher.stop().await;
}

#[tokio::test]
async fn test_poll_detects_eject_and_remount() {
    let monitor = Arc::new(FakeMonitor::new());
    let mounts = Arc::new(ScriptedMountLookup::mounted_after(0, "/media/usb"));
    let mut watcher = UsbEventWatcher::new(fast_options(Platform::MacOs), native(&monitor, &mounts));
    let events = watcher.subscribe();
    watcher.start().await.unwrap();

    monitor.insert(create_kingston_device());
    assert!(matches!(
        next_event(&events).await,
        WatcherEvent::DeviceAdded(_)
    ));
    assert_eq!(
        next_event(&events).await,
        WatcherEvent::DriveMounted("/media/usb".to_string())
    );
    // Let the insert-time resolution settle before the volume goes away.
    tokio::time::sleep(Duration::from_millis(100)).await;

    mounts.set_mount(None);
    assert_eq!(
        next_event(&events).await,
        WatcherEvent::DriveEjected("/media/usb".to_string())
    );
    assert!(watcher.devices()[0].is_ejected);

    mounts.set_mount(Some("/media/usb2"));
    assert_eq!(
        next_event(&events).await,
        WatcherEvent::DriveMounted("/media/usb2".to_string())
    );

    watcher.stop().await;
}

#[tokio::test]
async fn test_failed_poll_lookup_keeps_mount() {
    let monitor = Arc::new(FakeMonitor::new());
    let mounts = Arc::new(ScriptedMountLookup::mounted_after(0, "/media/usb"));
    let mut watcher = UsbEventWatcher::new(fast_options(Platform::MacOs), native(&monitor, &mounts));
    let events = watcher.subscribe();
    watcher.start().await.unwrap();

    monitor.insert(create_kingston_device());
    next_event(&events).await;
    assert_eq!(
        next_event(&events).await,
        WatcherEvent::DriveMounted("/media/usb".to_string())
    );

    // Several poll ticks run while the mount table is unreadable.
    mounts.fail_lookups(true);
    let calls = mounts.mount_calls();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(mounts.mount_calls() > calls);
    assert!(events.try_recv().is_err());

    let device = &watcher.devices()[0];
    assert!(device.is_mounted);
    assert_eq!(device.mounted_directory_path, "/media/usb");
    assert_eq!(watcher.drive_paths(), vec!["/media/usb".to_string()]);

    watcher.stop().await;
}

#[tokio::test]
async fn test_mount_point_disabled_skips_lookups() {
    let monitor = Arc::new(FakeMonitor::new());
    let mounts = Arc::new(ScriptedMountLookup::mounted_after(0, "/media/usb"));
    let options = WatcherOptions {
        use_mount_point: false,
        ..fast_options(Platform::Linux)
    };
    let mut watcher = UsbEventWatcher::new(options, native(&monitor, &mounts));
    let events = watcher.subscribe();
    watcher.start().await.unwrap();

    monitor.insert(create_kingston_device());
    assert!(matches!(
        next_event(&events).await,
        WatcherEvent::DeviceAdded(_)
    ));
    assert_quiet(&events).await;
    assert_eq!(mounts.mount_calls(), 0);

    watcher.stop().await;
}

// ============================================================================
// Event Bus Tests
// ============================================================================

#[tokio::test]
async fn test_bus_device_lifecycle_with_metadata_and_volume() {
    let bus = Arc::new(FakeBus::new());
    let db = Arc::new(FakeDatabase::new());
    db.add_entity(kingston_entity());
    db.add_hub(KINGSTON_INSTANCE);
    db.add_disk_chain(
        &format!(r"USBSTOR\DISK&VEN_KINGSTON&PROD_DT_101_II\{}&0", KINGSTON_SERIAL),
        "Disk #1, Partition #0",
        "E:",
    );

    let mut watcher = UsbEventWatcher::new(fast_options(Platform::Windows), bus_backend(&bus, &db));
    let events = watcher.subscribe();
    watcher.start().await.unwrap();

    assert_eq!(
        bus.active_queries(),
        vec![
            BusQuery::VolumeChange,
            BusQuery::ControllerDeviceCreation,
            BusQuery::ControllerDeviceDeletion,
        ]
    );

    assert_eq!(bus.instance_created(KINGSTON_INSTANCE), 1);
    let WatcherEvent::DeviceAdded(added) = next_event(&events).await else {
        panic!("expected device added");
    };
    assert_eq!(added.vendor_id, "0951");
    assert_eq!(added.product_id, "1625");
    assert_eq!(added.serial_number, KINGSTON_SERIAL);
    assert_eq!(added.device_name, "Kingston DT 101 II USB Device");
    assert_eq!(added.vendor, "Kingston");

    assert_eq!(
        next_event(&events).await,
        WatcherEvent::DriveMounted("E:\\".to_string())
    );

    // The OS reports the same volume; it must not be listed twice.
    bus.volume_change("E:", VOLUME_ARRIVAL);
    assert_quiet(&events).await;
    assert_eq!(watcher.drive_paths(), vec!["E:\\".to_string()]);

    bus.volume_change("E:", VOLUME_REMOVAL);
    assert_eq!(
        next_event(&events).await,
        WatcherEvent::DriveEjected("E:\\".to_string())
    );

    bus.instance_deleted(KINGSTON_INSTANCE);
    let WatcherEvent::DeviceRemoved(removed) = next_event(&events).await else {
        panic!("expected device removed");
    };
    assert_eq!(removed.serial_number, KINGSTON_SERIAL);
    assert!(watcher.devices().is_empty());

    watcher.stop().await;
}

#[tokio::test]
async fn test_bus_non_usb_volume_is_listed() {
    let bus = Arc::new(FakeBus::new());
    let db = Arc::new(FakeDatabase::new());
    let mut watcher = UsbEventWatcher::new(fast_options(Platform::Windows), bus_backend(&bus, &db));
    let events = watcher.subscribe();
    watcher.start().await.unwrap();

    bus.volume_change("F:", VOLUME_ARRIVAL);
    assert_eq!(
        next_event(&events).await,
        WatcherEvent::DriveMounted("F:\\".to_string())
    );

    // Other volume event types (configuration change, docking) are dropped.
    bus.volume_change("G:", 1);
    assert_quiet(&events).await;
    assert_eq!(watcher.drive_paths(), vec!["F:\\".to_string()]);

    watcher.stop().await;
}

#[tokio::test]
async fn test_bus_broad_query_and_present_instances() {
    let bus = Arc::new(FakeBus::new());
    bus.set_present(&[KINGSTON_INSTANCE, r"ROOT\LEGACY_BEEP\0000"]);
    bus.set_removable_volumes(&["D:"]);
    let db = Arc::new(FakeDatabase::new());
    let options = WatcherOptions {
        include_present: true,
        use_broad_query: true,
        ..fast_options(Platform::Windows)
    };
    let mut watcher = UsbEventWatcher::new(options, bus_backend(&bus, &db));
    let events = watcher.subscribe();
    watcher.start().await.unwrap();

    assert_eq!(watcher.drive_paths(), vec!["D:\\".to_string()]);
    assert!(bus.active_queries().contains(&BusQuery::PnpEntityCreation));
    assert!(!bus.active_queries().contains(&BusQuery::ControllerDeviceCreation));

    let WatcherEvent::DeviceAdded(added) = next_event(&events).await else {
        panic!("expected device added");
    };
    assert_eq!(added.serial_number, KINGSTON_SERIAL);
    assert_quiet(&events).await;

    watcher.stop().await;
}

#[tokio::test]
async fn test_bus_subscription_failures_are_listed() {
    let bus = Arc::new(FakeBus::new());
    bus.fail_query(BusQuery::VolumeChange);
    bus.fail_query(BusQuery::ControllerDeviceDeletion);
    let db = Arc::new(FakeDatabase::new());
    let mut watcher = UsbEventWatcher::new(fast_options(Platform::Windows), bus_backend(&bus, &db));
    let events = watcher.subscribe();

    let err = watcher.start().await.unwrap_err();
    assert!(matches!(err, Error::SourceSetup(_)));
    assert_eq!(
        err.failed_sources(),
        vec!["bus:volume-change", "bus:controller-deletion"]
    );

    // The facility that did start keeps delivering.
    assert_eq!(bus.active_queries(), vec![BusQuery::ControllerDeviceCreation]);
    bus.instance_created(KINGSTON_INSTANCE);
    assert!(matches!(
        next_event(&events).await,
        WatcherEvent::DeviceAdded(_)
    ));

    watcher.stop().await;
    assert!(bus.active_queries().is_empty());
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_start_is_idempotent() {
    let monitor = Arc::new(FakeMonitor::new());
    let mounts = Arc::new(ScriptedMountLookup::without_storage());
    let mut watcher = UsbEventWatcher::new(fast_options(Platform::Linux), native(&monitor, &mounts));

    watcher.start().await.unwrap();
    watcher.start().await.unwrap();
    assert_eq!(monitor.start_count(), 1);

    watcher.stop().await;
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let bus = Arc::new(FakeBus::new());
    let db = Arc::new(FakeDatabase::new());
    let mut watcher = UsbEventWatcher::new(fast_options(Platform::Windows), bus_backend(&bus, &db));

    // Stopping a watcher that never started is fine.
    with_timeout(DEFAULT_TEST_TIMEOUT, watcher.stop())
        .await
        .expect("stop hung");

    watcher.start().await.unwrap();
    with_timeout(DEFAULT_TEST_TIMEOUT, watcher.stop())
        .await
        .expect("stop hung");
    with_timeout(DEFAULT_TEST_TIMEOUT, watcher.stop())
        .await
        .expect("second stop hung");

    assert!(!watcher.is_running());
    assert!(bus.active_queries().is_empty());
    assert_eq!(bus.instance_created(KINGSTON_INSTANCE), 0);
}

#[tokio::test]
async fn test_restart_after_stop_delivers_again() {
    let monitor = Arc::new(FakeMonitor::new());
    let mounts = Arc::new(ScriptedMountLookup::without_storage());
    let mut watcher = UsbEventWatcher::new(fast_options(Platform::Linux), native(&monitor, &mounts));
    let events = watcher.subscribe();
    let kingston = create_kingston_device();

    watcher.start().await.unwrap();
    watcher.stop().await;
    assert!(!monitor.insert(kingston.clone()));

    watcher.start().await.unwrap();
    assert!(watcher.is_running());
    assert_eq!(monitor.start_count(), 2);

    assert!(monitor.insert(kingston.clone()));
    assert_eq!(next_event(&events).await, WatcherEvent::DeviceAdded(kingston.clone()));
    assert!(monitor.remove(kingston.clone()));
    assert_eq!(next_event(&events).await, WatcherEvent::DeviceRemoved(kingston));

    watcher.stop().await;
}

#[tokio::test]
async fn test_failed_source_recovers_on_restart() {
    let bus = Arc::new(FakeBus::new());
    bus.fail_query(BusQuery::VolumeChange);
    let db = Arc::new(FakeDatabase::new());
    let mut watcher = UsbEventWatcher::new(fast_options(Platform::Windows), bus_backend(&bus, &db));
    let events = watcher.subscribe();

    let err = watcher.start().await.unwrap_err();
    assert_eq!(err.failed_sources(), vec!["bus:volume-change"]);

    bus.restore_query(BusQuery::VolumeChange);
    watcher.stop().await;
    watcher.start().await.unwrap();

    let active = bus.active_queries();
    assert!(active.contains(&BusQuery::VolumeChange));
    assert_eq!(active.len(), 3);

    assert_eq!(bus.volume_change("E:", VOLUME_ARRIVAL), 1);
    assert_eq!(
        next_event(&events).await,
        WatcherEvent::DriveMounted("E:\\".to_string())
    );

    watcher.stop().await;
}

#[tokio::test]
async fn test_stop_interrupts_pending_mount_resolution() {
    let monitor = Arc::new(FakeMonitor::new());
    let mounts = Arc::new(ScriptedMountLookup::unmounted());
    let options = WatcherOptions {
        live_attempts: 1_000_000,
        retry_interval: Duration::from_millis(5),
        ..fast_options(Platform::Linux)
    };
    let mut watcher = UsbEventWatcher::new(options, native(&monitor, &mounts));
    let events = watcher.subscribe();
    watcher.start().await.unwrap();

    monitor.insert(create_kingston_device());
    next_event(&events).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    with_timeout(DEFAULT_TEST_TIMEOUT, watcher.stop())
        .await
        .expect("stop waited for the whole retry budget");
    assert!(mounts.mount_calls() > 0);
}

#[tokio::test]
async fn test_monitor_stops_delivering_after_stop() {
    let monitor = Arc::new(FakeMonitor::new());
    let mounts = Arc::new(ScriptedMountLookup::without_storage());
    let mut watcher = UsbEventWatcher::new(fast_options(Platform::Linux), native(&monitor, &mounts));
    watcher.start().await.unwrap();
    watcher.stop().await;

    assert!(!monitor.insert(create_kingston_device()));
    assert!(watcher.devices().is_empty());
}
