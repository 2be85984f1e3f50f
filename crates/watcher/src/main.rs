//! usb-events
//!
//! Watches USB attach/detach and removable-volume mounts and prints every
//! event until interrupted.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::setup_logging;
use model::{UsbDevice, WatcherEvent};
use tokio::signal;
use tracing::{error, info};
use watcher::config::{self, MonitorKind, WatcherConfig};
use watcher::{Backend, UsbEventWatcher};

#[derive(Parser, Debug)]
#[command(name = "usb-events")]
#[command(author, version, about = "Watch USB devices and removable drives")]
#[command(long_about = "
Reports USB devices as they are attached and detached, and removable
volumes as they are mounted and ejected.

EXAMPLES:
    # Watch with default config
    usb-events

    # Also report devices attached before start, as JSON lines
    usb-events --include-present --json

    # Use libusb hotplug instead of kernel uevents
    usb-events --monitor libusb

CONFIGURATION:
    The watcher looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-events/watcher.toml
    3. /etc/usb-events/watcher.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Report devices already attached at start
    #[arg(long)]
    include_present: bool,

    /// Watch every PnP entity instead of controller associations only
    #[arg(long)]
    broad_query: bool,

    /// Include USB serial consoles
    #[arg(long)]
    include_tty: bool,

    /// Do not resolve mount directories
    #[arg(long)]
    no_mount_point: bool,

    /// Native event source (uevent, libusb)
    #[arg(long, value_name = "SOURCE")]
    monitor: Option<MonitorKind>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Print one JSON object per event
    #[arg(long)]
    json: bool,
}

impl Args {
    /// Fold command-line flags over file values
    fn apply(&self, config: &mut WatcherConfig) {
        config.watcher.include_present |= self.include_present;
        config.watcher.use_broad_query |= self.broad_query;
        config.watcher.include_tty |= self.include_tty;
        if self.no_mount_point {
            config.watcher.use_mount_point = false;
        }
        if let Some(monitor) = self.monitor {
            config.watcher.monitor = monitor;
        }
        if let Some(level) = &self.log_level {
            config.logging.log_level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = WatcherConfig::default();
        let path = WatcherConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        WatcherConfig::load_or_default()
    };
    args.apply(&mut config);

    setup_logging(&config.logging.log_level).context("Failed to setup logging")?;

    info!("usb-events v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", config.logging.log_level);

    let backend = native_backend(config.watcher.monitor)?;
    let mut watcher = UsbEventWatcher::new(config.options(), backend);
    let events = watcher.subscribe();

    if let Err(e) = watcher.start().await {
        watcher.stop().await;
        return Err(anyhow!(e)).context("Failed to start watcher");
    }

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event, args.json),
                Err(_) => {
                    error!("Event stream closed");
                    break;
                }
            }
        }
    }

    watcher.stop().await;
    print_snapshot(&watcher.devices(), &watcher.drive_paths(), args.json)?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn native_backend(kind: MonitorKind) -> Result<Backend> {
    use std::sync::Arc;
    use watcher::native::UsbMonitor;
    use watcher::native::libusb::LibusbMonitor;
    use watcher::native::sysfs::SysfsMountLookup;
    use watcher::native::uevent::UeventMonitor;

    let monitor: Arc<dyn UsbMonitor> = match kind {
        MonitorKind::Uevent => Arc::new(UeventMonitor::default()),
        MonitorKind::Libusb => Arc::new(LibusbMonitor),
    };
    info!("Native source: {}", monitor.name());

    Ok(Backend::Native {
        monitor,
        mounts: Arc::new(SysfsMountLookup::default()),
    })
}

#[cfg(target_os = "macos")]
fn native_backend(kind: MonitorKind) -> Result<Backend> {
    use std::sync::Arc;
    use watcher::mount::UnsupportedMountLookup;
    use watcher::native::libusb::LibusbMonitor;

    if kind == MonitorKind::Uevent {
        info!("Kernel uevents are Linux-only, using libusb hotplug");
    }
    // No DiskArbitration binding: devices are reported, mounts are not.
    tracing::warn!("Mount points are not resolved on macOS");
    Ok(Backend::Native {
        monitor: Arc::new(LibusbMonitor),
        mounts: Arc::new(UnsupportedMountLookup),
    })
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn native_backend(_kind: MonitorKind) -> Result<Backend> {
    Err(anyhow!(
        "No built-in event source for this host; embed the watcher library with a DeviceBus implementation"
    ))
}

fn print_event(event: &WatcherEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => error!("Failed to encode event: {}", e),
        }
        return;
    }

    match event {
        WatcherEvent::DeviceAdded(device) | WatcherEvent::DeviceRemoved(device) => {
            println!("{:<8} {}", event.label(), device);
            if !device.device_name.is_empty() {
                println!("         {}", device.device_name);
            }
        }
        WatcherEvent::DriveMounted(path) | WatcherEvent::DriveEjected(path) => {
            println!("{:<8} {}", event.label(), path);
        }
    }
}

fn print_snapshot(devices: &[UsbDevice], drive_paths: &[String], json: bool) -> Result<()> {
    if json {
        let snapshot = serde_json::json!({
            "devices": devices,
            "drive_paths": drive_paths,
        });
        println!(
            "{}",
            serde_json::to_string(&snapshot).context("Failed to encode snapshot")?
        );
        return Ok(());
    }

    if devices.is_empty() {
        println!("No USB devices present.");
    } else {
        println!("{} USB device(s) present:\n", devices.len());
        for device in devices {
            println!("  {}", device);
            if device.is_mounted {
                println!("      Mounted at: {}", device.mounted_directory_path);
            }
        }
    }

    if !drive_paths.is_empty() {
        println!("\nMounted drives: {}", drive_paths.join(", "));
    }
    Ok(())
}
