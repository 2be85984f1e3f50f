//! Watcher lifecycle
//!
//! [`UsbEventWatcher`] wires one backend's raw sources into the normalizer
//! and the registry and owns every background task:
//!
//! ```text
//! native thread / bus callbacks ──RawEvent──▶ event loop ──▶ DeviceRegistry
//!                                               │                 ▲
//!                                               └─▶ mount resolution (blocking pool)
//!                                  poll ticker ─────────────────────┘
//! ```
//!
//! Each run gets its own [`ShutdownSignal`] that stops all of it; `stop`
//! cancels, then joins, and a stopped watcher can be started again.

use crate::bus::{BusQuery, BusSubscription, DeviceBus, DeviceDatabase};
use crate::mount::{
    DEFAULT_LIVE_ATTEMPTS, DEFAULT_RETRY_INTERVAL, DEFAULT_STARTUP_ATTEMPTS, DatabaseMountLookup,
    MountLookup, MountResolver,
};
use crate::native::{MonitorOptions, UsbMonitor};
use crate::normalizer::{CanonicalEvent, Normalizer};
use crate::registry::DeviceRegistry;
use common::{
    Error, MonitorBridge, MonitorCommand, RawEvent, Result, SetupFailure, ShutdownListener,
    ShutdownSignal, create_monitor_bridge,
};
use model::{Change, EventOrigin, MatchKey, MountStrategy, Platform, UsbDevice, WatcherEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default interval between mount poll ticks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Start-time configuration of a watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherOptions {
    pub platform: Platform,
    /// Removal correlation policy; the platform default when `None`
    pub match_key: Option<MatchKey>,
    /// Report devices already attached at start as insertions
    pub include_present: bool,
    /// Watch every PnP entity instead of controller associations only
    pub use_broad_query: bool,
    /// Include USB serial consoles (native Linux monitor)
    pub include_tty: bool,
    /// Resolve and track mount directories
    pub use_mount_point: bool,
    pub live_attempts: u32,
    pub startup_attempts: u32,
    pub retry_interval: Duration,
    pub poll_interval: Duration,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            platform: Platform::current(),
            match_key: None,
            include_present: false,
            use_broad_query: false,
            include_tty: false,
            use_mount_point: true,
            live_attempts: DEFAULT_LIVE_ATTEMPTS,
            startup_attempts: DEFAULT_STARTUP_ATTEMPTS,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl WatcherOptions {
    pub fn match_key(&self) -> MatchKey {
        self.match_key
            .unwrap_or_else(|| self.platform.default_match_key())
    }
}

/// Raw event sources for one watcher
pub enum Backend {
    /// Native monitor thread plus a platform mount query
    Native {
        monitor: Arc<dyn UsbMonitor>,
        mounts: Arc<dyn MountLookup>,
    },
    /// OS event bus plus device database
    Bus {
        bus: Arc<dyn DeviceBus>,
        database: Arc<dyn DeviceDatabase>,
    },
}

/// Handles owned while the watcher runs
struct Running {
    shutdown: ShutdownSignal,
    bridge: MonitorBridge,
    tasks: Vec<JoinHandle<()>>,
    monitor_thread: Option<std::thread::JoinHandle<()>>,
    subscriptions: Vec<Box<dyn BusSubscription>>,
}

impl Running {
    fn cancel(&mut self) {
        self.shutdown.trigger();
        for subscription in &mut self.subscriptions {
            subscription.cancel();
        }
        let _ = self.bridge.try_send_command(MonitorCommand::Shutdown);
    }
}

/// USB attach/detach and volume mount watcher
pub struct UsbEventWatcher {
    options: WatcherOptions,
    backend: Backend,
    registry: Arc<DeviceRegistry>,
    running: Option<Running>,
}

impl UsbEventWatcher {
    pub fn new(options: WatcherOptions, backend: Backend) -> Self {
        let registry = Arc::new(DeviceRegistry::new(options.match_key()));
        Self {
            options,
            backend,
            registry,
            running: None,
        }
    }

    pub fn options(&self) -> &WatcherOptions {
        &self.options
    }

    /// Receive public events; subscribe before `start` to see startup devices
    pub fn subscribe(&self) -> async_channel::Receiver<WatcherEvent> {
        self.registry.subscribe()
    }

    pub fn devices(&self) -> Vec<UsbDevice> {
        self.registry.devices()
    }

    pub fn drive_paths(&self) -> Vec<String> {
        self.registry.drive_paths()
    }

    pub fn registry(&self) -> Arc<DeviceRegistry> {
        self.registry.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start every source of the configured backend
    ///
    /// Calling `start` on a running watcher does nothing. When some sources
    /// fail to initialize, the rest keep running and the error lists every
    /// failed facility; the caller decides whether to `stop` and retry.
    /// Known devices and drive paths are kept across a stop and restart.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }

        info!(
            "Starting USB event watcher ({}, match key {})",
            self.options.platform,
            self.options.match_key()
        );

        let (bridge, worker) = create_monitor_bridge();
        let mut running = Running {
            shutdown: ShutdownSignal::new(),
            bridge: bridge.clone(),
            tasks: Vec::new(),
            monitor_thread: None,
            subscriptions: Vec::new(),
        };
        let mut failures = Vec::new();

        let (normalizer, lookup): (Normalizer, Arc<dyn MountLookup>) = match &self.backend {
            Backend::Native { mounts, .. } => {
                (Normalizer::new(self.options.platform), mounts.clone())
            }
            Backend::Bus { database, .. } => (
                Normalizer::new(self.options.platform).with_database(database.clone()),
                Arc::new(DatabaseMountLookup::new(database.clone())),
            ),
        };
        let resolver = MountResolver::new(lookup, self.options.platform)
            .with_retry_interval(self.options.retry_interval);

        let context = EventContext {
            normalizer,
            registry: self.registry.clone(),
            resolver: self
                .options
                .use_mount_point
                .then(|| resolver.clone()),
            live_attempts: self.options.live_attempts,
            startup_attempts: self.options.startup_attempts,
            shutdown: running.shutdown.listener(),
        };
        running.tasks.push(tokio::spawn(event_loop(
            context,
            bridge.clone(),
            running.shutdown.listener(),
        )));

        match &self.backend {
            Backend::Native { monitor, .. } => {
                let options = MonitorOptions {
                    include_tty: self.options.include_tty,
                };
                match monitor.start(worker, options) {
                    Ok(thread) => {
                        running.monitor_thread = Some(thread);
                        if self.options.include_present {
                            if let Err(e) = enumerate_present(&bridge).await {
                                failures.extend(setup_failures(monitor.name(), e));
                            }
                        }
                    }
                    Err(e) => failures.extend(setup_failures(monitor.name(), e)),
                }
            }
            Backend::Bus { bus, .. } => {
                drop(worker);
                self.start_bus(bus.as_ref(), &bridge, &mut running, &mut failures)
                    .await;
            }
        }

        let polls = self.options.platform.mount_strategy() == MountStrategy::Poll;
        if self.options.use_mount_point && polls {
            running.tasks.push(tokio::spawn(poll_loop(
                self.registry.clone(),
                resolver,
                self.options.poll_interval,
                running.shutdown.listener(),
            )));
        }

        self.running = Some(running);

        if failures.is_empty() {
            info!("USB event watcher started");
            Ok(())
        } else {
            for failure in &failures {
                warn!("Source failed to start: {}", failure);
            }
            Err(Error::SourceSetup(failures))
        }
    }

    async fn start_bus(
        &self,
        bus: &dyn DeviceBus,
        bridge: &MonitorBridge,
        running: &mut Running,
        failures: &mut Vec<SetupFailure>,
    ) {
        let mut queries = Vec::new();
        if self.options.use_mount_point {
            match bus.removable_volumes() {
                Ok(volumes) => self.registry.seed_drive_paths(
                    volumes
                        .iter()
                        .map(|v| self.options.platform.normalize_drive_path(v)),
                ),
                Err(e) => warn!("Could not list mounted removable volumes: {}", e),
            }
            queries.push(BusQuery::VolumeChange);
        }
        queries.extend(BusQuery::instance_queries(self.options.use_broad_query));

        for query in queries {
            match bus.subscribe(query, bridge.event_sink()) {
                Ok(subscription) => {
                    debug!("Subscribed {}", query.source_name());
                    running.subscriptions.push(subscription);
                }
                Err(e) => failures.extend(setup_failures(query.source_name(), e)),
            }
        }

        if self.options.include_present {
            let [creation, _] = BusQuery::instance_queries(self.options.use_broad_query);
            match bus.present_instances(creation) {
                Ok(instances) => {
                    let sink = bridge.event_sink();
                    for payload in instances {
                        let event = RawEvent::Instance {
                            change: Change::Inserted,
                            payload,
                            origin: EventOrigin::Startup,
                        };
                        if let Err(e) = sink.send(event).await {
                            warn!("Could not queue present device: {}", e);
                            break;
                        }
                    }
                }
                Err(e) => failures.extend(setup_failures("bus:present-devices", e)),
            }
        }
    }

    /// Stop every source and wait for background work to finish
    ///
    /// Safe to call more than once, and on a watcher that never started.
    pub async fn stop(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };

        info!("Stopping USB event watcher");
        running.cancel();

        let Running {
            bridge,
            tasks,
            monitor_thread,
            ..
        } = running;
        // The monitor thread may be blocked on a full event channel; it
        // unblocks once every receiver is gone.
        drop(bridge);

        for task in tasks {
            if let Err(e) = task.await {
                warn!("Watcher task failed: {}", e);
            }
        }

        if let Some(thread) = monitor_thread {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => warn!("Monitor thread panicked"),
                Err(e) => warn!("Could not join monitor thread: {}", e),
            }
        }

        info!("USB event watcher stopped");
    }
}

impl Drop for UsbEventWatcher {
    fn drop(&mut self) {
        if let Some(running) = &mut self.running {
            running.cancel();
        }
    }
}

fn setup_failures(source: &str, error: Error) -> Vec<SetupFailure> {
    match error {
        Error::SourceSetup(failures) => failures,
        other => vec![SetupFailure::new(source, other.to_string())],
    }
}

async fn enumerate_present(bridge: &MonitorBridge) -> Result<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(MonitorCommand::Enumerate { response: tx })
        .await?;
    let count = rx
        .await
        .map_err(|_| Error::Channel("monitor dropped enumeration request".to_string()))?;
    info!("{} device(s) present at startup", count);
    Ok(())
}

/// Everything the event loop needs to apply a raw event
struct EventContext {
    normalizer: Normalizer,
    registry: Arc<DeviceRegistry>,
    resolver: Option<MountResolver>,
    live_attempts: u32,
    startup_attempts: u32,
    shutdown: ShutdownListener,
}

impl EventContext {
    async fn dispatch(&self, raw: RawEvent, resolutions: &mut JoinSet<()>) {
        // Metadata lookups may block on the device database.
        let normalizer = self.normalizer.clone();
        let canonical = match tokio::task::spawn_blocking(move || normalizer.normalize(raw)).await
        {
            Ok(Some(canonical)) => canonical,
            Ok(None) => return,
            Err(e) => {
                warn!("Normalization failed: {}", e);
                return;
            }
        };

        match canonical {
            CanonicalEvent::Drive(event) => self.registry.apply_drive_event(&event),
            CanonicalEvent::Device(event) => match event.change {
                Change::Inserted => {
                    let Some(id) = self.registry.insert_device(event.device.clone()) else {
                        return;
                    };
                    let Some(resolver) = self.resolver.clone() else {
                        return;
                    };

                    let attempts = match event.origin {
                        EventOrigin::Startup => self.startup_attempts,
                        EventOrigin::Live => self.live_attempts,
                    };
                    let registry = self.registry.clone();
                    let shutdown = self.shutdown.clone();
                    let device = event.device;
                    resolutions.spawn_blocking(move || {
                        let path = resolver.resolve(&device, attempts, &shutdown);
                        registry.record_mount(id, &path);
                    });
                }
                Change::Removed => {
                    self.registry.remove_device(&event.device);
                }
            },
        }
    }
}

async fn event_loop(context: EventContext, bridge: MonitorBridge, mut shutdown: ShutdownListener) {
    let mut resolutions = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,

            event = bridge.recv_event() => match event {
                Ok(raw) => context.dispatch(raw, &mut resolutions).await,
                Err(e) => {
                    debug!("Event bridge closed: {}", e);
                    break;
                }
            },

            Some(result) = resolutions.join_next(), if !resolutions.is_empty() => {
                if let Err(e) = result {
                    warn!("Mount resolution failed: {}", e);
                }
            }
        }
    }

    // Resolvers watch the shutdown signal and return within one retry interval.
    while let Some(result) = resolutions.join_next().await {
        if let Err(e) = result {
            warn!("Mount resolution failed: {}", e);
        }
    }
    debug!("Event loop stopped");
}

async fn poll_loop(
    registry: Arc<DeviceRegistry>,
    resolver: MountResolver,
    interval: Duration,
    mut shutdown: ShutdownListener,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,

            _ = ticker.tick() => {
                let registry = registry.clone();
                let resolver = resolver.clone();
                let listener = shutdown.clone();
                let tick = tokio::task::spawn_blocking(move || {
                    poll_tick(&registry, &resolver, &listener);
                });
                if let Err(e) = tick.await {
                    warn!("Mount poll tick failed: {}", e);
                }
            }
        }
    }
    debug!("Mount poller stopped");
}

/// One pass over every pollable device
fn poll_tick(registry: &DeviceRegistry, resolver: &MountResolver, shutdown: &ShutdownListener) {
    for (id, device) in registry.pollable_devices() {
        if shutdown.is_triggered() {
            return;
        }
        if let Some(path) = resolver.probe(&device) {
            registry.observe_mount(id, &path);
        }
    }
}
