//! In-memory stand-ins for the watcher's external collaborators
//!
//! Used by unit tests, the integration tests in `tests/`, and anyone
//! embedding the watcher who wants to drive it without hardware.

use crate::bus::{BusQuery, BusSubscription, DeviceBus, DeviceDatabase, PnpEntity};
use crate::mount::MountLookup;
use crate::native::{MonitorOptions, UsbMonitor};
use common::test_utils::controller_dependent;
use common::{Error, EventSink, InstancePayload, MonitorCommand, RawEvent, Result};
use model::{Change, EventOrigin, UsbDevice};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

// ============================================================================
// Native monitor
// ============================================================================

/// Native monitor driven by the test
///
/// `start` captures the event sink and spawns a thread that answers
/// `Enumerate` from the present list and exits on `Shutdown`.
#[derive(Default)]
pub struct FakeMonitor {
    present: Mutex<Vec<UsbDevice>>,
    sink: Mutex<Option<EventSink>>,
    failure: Option<String>,
    starts: AtomicUsize,
    options: Mutex<Option<MonitorOptions>>,
}

impl FakeMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monitor whose setup always fails with `reason`
    pub fn failing(reason: &str) -> Self {
        Self {
            failure: Some(reason.to_string()),
            ..Self::default()
        }
    }

    /// Monitor reporting `devices` as already attached
    pub fn with_present(devices: Vec<UsbDevice>) -> Self {
        Self {
            present: Mutex::new(devices),
            ..Self::default()
        }
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn last_options(&self) -> Option<MonitorOptions> {
        *lock(&self.options)
    }

    /// Deliver a live insertion callback
    pub fn insert(&self, device: UsbDevice) -> bool {
        self.emit(Change::Inserted, device)
    }

    /// Deliver a live removal callback
    pub fn remove(&self, device: UsbDevice) -> bool {
        self.emit(Change::Removed, device)
    }

    fn emit(&self, change: Change, device: UsbDevice) -> bool {
        let sink = lock(&self.sink).clone();
        match sink {
            Some(sink) => sink
                .send_blocking(RawEvent::Native {
                    change,
                    device,
                    origin: EventOrigin::Live,
                })
                .is_ok(),
            None => false,
        }
    }
}

impl UsbMonitor for FakeMonitor {
    fn name(&self) -> &'static str {
        "fake-monitor"
    }

    fn start(
        &self,
        worker: common::MonitorWorker,
        options: MonitorOptions,
    ) -> Result<JoinHandle<()>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        *lock(&self.options) = Some(options);
        if let Some(reason) = &self.failure {
            return Err(Error::setup(self.name(), reason.clone()));
        }

        *lock(&self.sink) = Some(worker.event_sink());
        let present = lock(&self.present).clone();

        std::thread::Builder::new()
            .name("fake-monitor".to_string())
            .spawn(move || {
                while let Ok(cmd) = worker.recv_command() {
                    match cmd {
                        MonitorCommand::Enumerate { response } => {
                            for device in &present {
                                let _ = worker.send_event(RawEvent::Native {
                                    change: Change::Inserted,
                                    device: device.clone(),
                                    origin: EventOrigin::Startup,
                                });
                            }
                            let _ = response.send(present.len());
                        }
                        MonitorCommand::Shutdown => break,
                    }
                }
            })
            .map_err(Error::Io)
    }
}

// ============================================================================
// Event bus
// ============================================================================

struct FakeSubscription {
    cancelled: Arc<AtomicBool>,
}

impl BusSubscription for FakeSubscription {
    fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

struct Subscriber {
    query: BusQuery,
    sink: EventSink,
    cancelled: Arc<AtomicBool>,
}

/// Event bus driven by the test
#[derive(Default)]
pub struct FakeBus {
    subscribers: Mutex<Vec<Subscriber>>,
    failing: Mutex<Vec<BusQuery>>,
    present: Mutex<Vec<String>>,
    volumes: Mutex<Vec<String>>,
}

impl FakeBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `subscribe` fail for one query
    pub fn fail_query(&self, query: BusQuery) {
        lock(&self.failing).push(query);
    }

    /// Let `subscribe` succeed again for a query
    pub fn restore_query(&self, query: BusQuery) {
        lock(&self.failing).retain(|q| *q != query);
    }

    /// Instance paths reported as present at startup
    pub fn set_present(&self, instance_paths: &[&str]) {
        *lock(&self.present) = instance_paths.iter().map(|s| s.to_string()).collect();
    }

    /// Volumes reported as mounted at startup
    pub fn set_removable_volumes(&self, volumes: &[&str]) {
        *lock(&self.volumes) = volumes.iter().map(|s| s.to_string()).collect();
    }

    /// Queries with a live (not cancelled) subscription
    pub fn active_queries(&self) -> Vec<BusQuery> {
        lock(&self.subscribers)
            .iter()
            .filter(|s| !s.cancelled.load(Ordering::SeqCst))
            .map(|s| s.query)
            .collect()
    }

    /// Deliver a volume change notification
    pub fn volume_change(&self, drive_name: &str, event_type: u16) -> usize {
        self.deliver(|query| {
            (query == BusQuery::VolumeChange).then(|| RawEvent::VolumeChange {
                drive_name: drive_name.to_string(),
                event_type,
            })
        })
    }

    /// Deliver an instance creation for a PnP instance path
    pub fn instance_created(&self, instance_path: &str) -> usize {
        self.deliver_instance(Change::Inserted, instance_path)
    }

    /// Deliver an instance deletion for a PnP instance path
    pub fn instance_deleted(&self, instance_path: &str) -> usize {
        self.deliver_instance(Change::Removed, instance_path)
    }

    fn deliver_instance(&self, change: Change, instance_path: &str) -> usize {
        self.deliver(|query| {
            (query.instance_change() == Some(change)).then(|| RawEvent::Instance {
                change,
                payload: payload_for(query, instance_path),
                origin: EventOrigin::Live,
            })
        })
    }

    /// Send to every live subscriber whose query produces an event
    fn deliver<F>(&self, event_for: F) -> usize
    where
        F: Fn(BusQuery) -> Option<RawEvent>,
    {
        let targets: Vec<(EventSink, RawEvent)> = lock(&self.subscribers)
            .iter()
            .filter(|s| !s.cancelled.load(Ordering::SeqCst))
            .filter_map(|s| event_for(s.query).map(|event| (s.sink.clone(), event)))
            .collect();

        targets
            .into_iter()
            .filter(|(sink, event)| sink.send_blocking(event.clone()).is_ok())
            .count()
    }
}

fn payload_for(query: BusQuery, instance_path: &str) -> InstancePayload {
    match query.payload(String::new()) {
        InstancePayload::Dependent(_) => controller_dependent(instance_path),
        InstancePayload::DeviceId(_) => InstancePayload::DeviceId(instance_path.to_string()),
    }
}

impl DeviceBus for FakeBus {
    fn subscribe(&self, query: BusQuery, sink: EventSink) -> Result<Box<dyn BusSubscription>> {
        if lock(&self.failing).contains(&query) {
            return Err(Error::Other(format!("access denied: {}", query.query_text())));
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        lock(&self.subscribers).push(Subscriber {
            query,
            sink,
            cancelled: cancelled.clone(),
        });
        Ok(Box::new(FakeSubscription { cancelled }))
    }

    fn present_instances(&self, query: BusQuery) -> Result<Vec<InstancePayload>> {
        Ok(lock(&self.present)
            .iter()
            .map(|path| payload_for(query, path))
            .collect())
    }

    fn removable_volumes(&self) -> Result<Vec<String>> {
        Ok(lock(&self.volumes).clone())
    }
}

// ============================================================================
// Device database
// ============================================================================

struct DiskChain {
    pnp_id: String,
    drive_id: String,
    partition: String,
    logical: String,
}

/// Device database with canned rows
#[derive(Default)]
pub struct FakeDatabase {
    entities: Mutex<Vec<PnpEntity>>,
    hubs: Mutex<Vec<String>>,
    disks: Mutex<Vec<DiskChain>>,
    controller: Mutex<Vec<String>>,
    fail: AtomicBool,
    entity_queries: AtomicUsize,
}

impl FakeDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entity(&self, entity: PnpEntity) {
        lock(&self.entities).push(entity);
    }

    /// Hub-class entry; makes devices sharing the serial storage-capable
    pub fn add_hub(&self, device_id: &str) {
        lock(&self.hubs).push(device_id.to_string());
    }

    /// Disk drive (by PnP id) → partition → logical disk
    pub fn add_disk_chain(&self, pnp_id: &str, partition: &str, logical: &str) {
        let mut disks = lock(&self.disks);
        let drive_id = format!(r"\\.\PHYSICALDRIVE{}", disks.len() + 1);
        disks.push(DiskChain {
            pnp_id: pnp_id.to_string(),
            drive_id,
            partition: partition.to_string(),
            logical: logical.to_string(),
        });
    }

    /// Drop every disk chain (volume went away)
    pub fn clear_disks(&self) {
        lock(&self.disks).clear();
    }

    pub fn set_controller_devices(&self, device_ids: &[&str]) {
        *lock(&self.controller) = device_ids.iter().map(|s| s.to_string()).collect();
    }

    /// Make every query fail from now on
    pub fn fail_queries(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Number of metadata queries served
    pub fn entity_queries(&self) -> usize {
        self.entity_queries.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(Error::Other("device database unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

impl DeviceDatabase for FakeDatabase {
    fn entities(&self, fragment: &str) -> Result<Vec<PnpEntity>> {
        self.check()?;
        self.entity_queries.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.entities)
            .iter()
            .filter(|e| e.device_id.contains(fragment))
            .cloned()
            .collect())
    }

    fn hub_entries(&self, fragment: &str) -> Result<usize> {
        self.check()?;
        Ok(lock(&self.hubs)
            .iter()
            .filter(|id| id.contains(fragment))
            .count())
    }

    fn disk_drives(&self, fragment: &str) -> Result<Vec<String>> {
        self.check()?;
        Ok(lock(&self.disks)
            .iter()
            .filter(|d| d.pnp_id.contains(fragment))
            .map(|d| d.drive_id.clone())
            .collect())
    }

    fn partitions(&self, disk_id: &str) -> Result<Vec<String>> {
        self.check()?;
        Ok(lock(&self.disks)
            .iter()
            .filter(|d| d.drive_id == disk_id)
            .map(|d| d.partition.clone())
            .collect())
    }

    fn logical_disks(&self, partition_id: &str) -> Result<Vec<String>> {
        self.check()?;
        Ok(lock(&self.disks)
            .iter()
            .filter(|d| d.partition == partition_id)
            .map(|d| d.logical.clone())
            .collect())
    }

    fn controller_devices(&self) -> Result<Vec<String>> {
        self.check()?;
        Ok(lock(&self.controller).clone())
    }
}

// ============================================================================
// Mount lookup
// ============================================================================

struct Script {
    storage: bool,
    misses: u32,
    path: Option<String>,
    failing: bool,
}

/// Mount lookup answering from a script
///
/// Reports no mount for the first `misses` queries, then `path`.
pub struct ScriptedMountLookup {
    script: Mutex<Script>,
    calls: AtomicU32,
}

impl ScriptedMountLookup {
    pub fn without_storage() -> Self {
        Self::scripted(false, 0, None)
    }

    pub fn mounted_after(misses: u32, path: &str) -> Self {
        Self::scripted(true, misses, Some(path.to_string()))
    }

    /// Storage device that is not mounted
    pub fn unmounted() -> Self {
        Self::scripted(true, 0, None)
    }

    fn scripted(storage: bool, misses: u32, path: Option<String>) -> Self {
        Self {
            script: Mutex::new(Script {
                storage,
                misses,
                path,
                failing: false,
            }),
            calls: AtomicU32::new(0),
        }
    }

    /// Change the mount from now on (`None` = unmounted)
    pub fn set_mount(&self, path: Option<&str>) {
        let mut script = lock(&self.script);
        script.misses = 0;
        script.path = path.map(str::to_string);
    }

    /// Make every `mount_point` query fail until switched back
    pub fn fail_lookups(&self, failing: bool) {
        lock(&self.script).failing = failing;
    }

    /// Number of `mount_point` queries made
    pub fn mount_calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MountLookup for ScriptedMountLookup {
    fn has_storage(&self, _device: &UsbDevice) -> bool {
        lock(&self.script).storage
    }

    fn mount_point(&self, _device: &UsbDevice) -> Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = lock(&self.script);
        if script.failing {
            return Err(Error::Other("scripted mount lookup failure".to_string()));
        }
        if script.misses > 0 {
            script.misses -= 1;
            return Ok(None);
        }
        Ok(script.path.clone())
    }
}
