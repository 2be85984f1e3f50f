//! libusb hotplug monitor
//!
//! libusb delivers hotplug callbacks from inside `handle_events` and forbids
//! most device I/O there, so the callback only queues the device. The
//! monitor thread drains the queue after `handle_events` returns, reads the
//! string descriptors and forwards the record.

use super::{Control, MonitorOptions, UsbMonitor, handle_commands, send};
use common::{Error, MonitorWorker, Result};
use model::{Change, EventOrigin, UsbDevice};
use rusb::{Context, Device, Hotplug, HotplugBuilder, UsbContext};
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

const SOURCE: &str = "libusb-hotplug";

/// Upper bound on one `handle_events` call, so commands are seen promptly
const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

type PendingQueue = Arc<Mutex<VecDeque<(Change, Device<Context>)>>>;

/// Native monitor built on libusb hotplug notifications
#[derive(Debug, Clone, Copy, Default)]
pub struct LibusbMonitor;

impl UsbMonitor for LibusbMonitor {
    fn name(&self) -> &'static str {
        SOURCE
    }

    fn start(&self, worker: MonitorWorker, _options: MonitorOptions) -> Result<JoinHandle<()>> {
        if !rusb::has_hotplug() {
            return Err(Error::Usb("libusb built without hotplug support".to_string()));
        }

        // libusb objects stay on the monitor thread; only the setup outcome
        // crosses back.
        let (ready_tx, ready_rx) = mpsc::sync_channel::<std::result::Result<(), rusb::Error>>(1);

        let handle = std::thread::Builder::new()
            .name("libusb-monitor".to_string())
            .spawn(move || {
                let pending: PendingQueue = Arc::new(Mutex::new(VecDeque::new()));
                let setup = Context::new().and_then(|context| {
                    HotplugBuilder::new()
                        .enumerate(false)
                        .register(
                            &context,
                            Box::new(HotplugQueue {
                                pending: pending.clone(),
                            }),
                        )
                        .map(|registration| (context, registration))
                });

                match setup {
                    Ok((context, _registration)) => {
                        let _ = ready_tx.send(Ok(()));
                        run(context, pending, worker);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| Error::setup(SOURCE, format!("spawn: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(Error::Usb(e.to_string()))
            }
            Err(_) => {
                let _ = handle.join();
                Err(Error::setup(SOURCE, "monitor thread exited during setup"))
            }
        }
    }
}

/// Hotplug callback: queue only, no I/O
struct HotplugQueue {
    pending: PendingQueue,
}

impl HotplugQueue {
    fn push(&self, change: Change, device: Device<Context>) {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        pending.push_back((change, device));
    }
}

impl Hotplug<Context> for HotplugQueue {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        self.push(Change::Inserted, device);
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        self.push(Change::Removed, device);
    }
}

fn run(context: Context, pending: PendingQueue, worker: MonitorWorker) {
    info!("libusb monitor started");
    // Records by (bus, address); departed devices can no longer be opened,
    // so removals reuse what was read on arrival.
    let mut known: HashMap<(u8, u8), UsbDevice> = HashMap::new();

    loop {
        let control = handle_commands(&worker, || {
            let devices = present_devices(&context);
            for (key, record) in &devices {
                known.insert(*key, record.clone());
            }
            devices.into_iter().map(|(_, record)| record).collect()
        });
        if let Control::Stop = control {
            break;
        }

        match context.handle_events(Some(EVENT_TIMEOUT)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => debug!("USB event handling interrupted"),
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(EVENT_TIMEOUT);
            }
        }

        let drained: Vec<_> = {
            let mut queue = pending.lock().unwrap_or_else(|p| p.into_inner());
            queue.drain(..).collect()
        };

        for (change, device) in drained {
            let key = (device.bus_number(), device.address());
            let record = match change {
                Change::Inserted => {
                    let record = device_record(&device, true);
                    known.insert(key, record.clone());
                    record
                }
                Change::Removed => known
                    .remove(&key)
                    .unwrap_or_else(|| device_record(&device, false)),
            };

            if !send(&worker, change, record, EventOrigin::Live) {
                info!("libusb monitor stopped");
                return;
            }
        }
    }

    info!("libusb monitor stopped");
}

fn present_devices(context: &Context) -> Vec<((u8, u8), UsbDevice)> {
    match context.devices() {
        Ok(list) => list
            .iter()
            .map(|device| {
                let key = (device.bus_number(), device.address());
                (key, device_record(&device, true))
            })
            .collect(),
        Err(e) => {
            warn!("Failed to enumerate USB devices: {}", e);
            Vec::new()
        }
    }
}

/// Build a record for a libusb device
///
/// String descriptors need an open handle; devices we may not open (or that
/// are already gone) keep empty strings.
fn device_record<T: UsbContext>(device: &Device<T>, read_strings: bool) -> UsbDevice {
    let bus = device.bus_number();
    let address = device.address();

    let mut record = UsbDevice {
        device_name: format!("/dev/bus/usb/{:03}/{:03}", bus, address),
        system_path: system_path(bus, device.port_numbers().unwrap_or_default()),
        ..Default::default()
    };

    let Ok(descriptor) = device.device_descriptor() else {
        return record;
    };
    record.vendor_id = format!("{:04x}", descriptor.vendor_id());
    record.product_id = format!("{:04x}", descriptor.product_id());

    if read_strings {
        match device.open() {
            Ok(handle) => {
                let read = |index: Option<u8>| {
                    index
                        .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
                        .map(|s| s.trim().to_string())
                        .unwrap_or_default()
                };
                record.vendor = read(descriptor.manufacturer_string_index());
                record.vendor_description = record.vendor.clone();
                record.product = read(descriptor.product_string_index());
                record.product_description = record.product.clone();
                record.serial_number = read(descriptor.serial_number_string_index());
            }
            Err(e) => debug!("Cannot open {}: {}", record.device_name, e),
        }
    }

    record
}

/// Port-chain location of a device, in sysfs naming (`/sys/bus/usb/devices/1-2.4`)
///
/// Root hubs have no ports and are named after their bus (`usb1`).
fn system_path(bus: u8, ports: Vec<u8>) -> String {
    let name = if ports.is_empty() {
        format!("usb{}", bus)
    } else {
        let chain: Vec<String> = ports.iter().map(u8::to_string).collect();
        format!("{}-{}", bus, chain.join("."))
    };
    format!("/sys/bus/usb/devices/{}", name)
}
