//! Kernel uevent monitor (Linux)
//!
//! Listens on the `NETLINK_KOBJECT_UEVENT` multicast group for device
//! add/remove messages. A message is `action@devpath` followed by
//! NUL-separated `KEY=VALUE` pairs.

use super::sysfs::{Sysfs, usb_device_devpath};
use super::{Control, MonitorOptions, UsbMonitor, handle_commands, send};
use common::{Error, MonitorWorker, Result};
use model::{Change, EventOrigin, UsbDevice};
use nix::errno::Errno;
use nix::sys::socket::{
    AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType, bind, recv, socket,
};
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Kernel broadcast group for uevents
const KERNEL_GROUP: u32 = 1;

/// How long the thread sleeps when no message is pending
const IDLE_INTERVAL: Duration = Duration::from_millis(100);

const RECV_BUFFER: usize = 8192;

/// A parsed kernel uevent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uevent {
    pub action: String,
    pub devpath: String,
    pub properties: HashMap<String, String>,
}

impl Uevent {
    /// Parse a raw netlink message
    ///
    /// Messages relayed by udev (`libudev` header) and anything without an
    /// `action@devpath` header are rejected.
    pub fn parse(message: &[u8]) -> Option<Self> {
        let mut fields = message
            .split(|b| *b == 0)
            .filter(|field| !field.is_empty())
            .map(String::from_utf8_lossy);

        let header = fields.next()?;
        let (action, devpath) = header.split_once('@')?;
        if action.is_empty() || devpath.is_empty() {
            return None;
        }

        let properties = fields
            .filter_map(|field| {
                let (key, value) = field.split_once('=')?;
                Some((key.to_string(), value.to_string()))
            })
            .collect();

        Some(Self {
            action: action.to_string(),
            devpath: devpath.to_string(),
            properties,
        })
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Direction of a uevent action, `None` for actions that are not
/// attach/detach (`change`, `move`)
pub fn action_change(action: &str) -> Option<Change> {
    match action {
        "add" | "bind" | "online" => Some(Change::Inserted),
        "remove" | "unbind" | "offline" => Some(Change::Removed),
        _ => None,
    }
}

/// Turn a uevent into a device notification, or drop it
pub fn classify(
    event: &Uevent,
    sysfs: &Sysfs,
    options: MonitorOptions,
) -> Option<(Change, UsbDevice)> {
    let change = action_change(&event.action)?;

    match event.property("SUBSYSTEM")? {
        "usb" => {}
        "tty" if options.include_tty => {
            if usb_device_devpath(&event.devpath).is_none() {
                trace!("Skipping non-USB tty {}", event.devpath);
                return None;
            }
        }
        _ => return None,
    }

    // Interfaces and endpoints carry no device node.
    let devname = event.property("DEVNAME").filter(|name| !name.is_empty())?;
    let device = sysfs.device_record(&event.devpath, devname, event.property("PRODUCT"));
    Some((change, device))
}

/// Native monitor reading kernel uevents
#[derive(Debug, Clone, Default)]
pub struct UeventMonitor {
    sysfs: Sysfs,
}

impl UeventMonitor {
    pub fn new(sysfs: Sysfs) -> Self {
        Self { sysfs }
    }

    fn open_socket() -> Result<OwnedFd> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkKObjectUEvent,
        )
        .map_err(|e| Error::setup("uevent-netlink", format!("socket: {}", e)))?;

        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, KERNEL_GROUP))
            .map_err(|e| Error::setup("uevent-netlink", format!("bind: {}", e)))?;

        Ok(fd)
    }
}

impl UsbMonitor for UeventMonitor {
    fn name(&self) -> &'static str {
        "uevent-netlink"
    }

    fn start(&self, worker: MonitorWorker, options: MonitorOptions) -> Result<JoinHandle<()>> {
        let fd = Self::open_socket()?;
        let sysfs = self.sysfs.clone();

        std::thread::Builder::new()
            .name("uevent-monitor".to_string())
            .spawn(move || run(fd, sysfs, worker, options))
            .map_err(|e| Error::setup("uevent-netlink", format!("spawn: {}", e)))
    }
}

fn run(fd: OwnedFd, sysfs: Sysfs, worker: MonitorWorker, options: MonitorOptions) {
    info!("uevent monitor started");
    let mut buf = vec![0u8; RECV_BUFFER];

    loop {
        if let Control::Stop = handle_commands(&worker, || sysfs.enumerate(options.include_tty)) {
            break;
        }

        match recv(fd.as_raw_fd(), &mut buf, MsgFlags::empty()) {
            Ok(0) => {}
            Ok(len) => {
                let Some(event) = Uevent::parse(&buf[..len]) else {
                    continue;
                };
                if let Some((change, device)) = classify(&event, &sysfs, options) {
                    debug!("uevent {} {}", event.action, event.devpath);
                    if !send(&worker, change, device, EventOrigin::Live) {
                        break;
                    }
                }
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => std::thread::sleep(IDLE_INTERVAL),
            Err(Errno::ENOBUFS) => warn!("uevent socket overrun, events were lost"),
            Err(e) => {
                warn!("uevent receive failed: {}", e);
                std::thread::sleep(IDLE_INTERVAL);
            }
        }
    }

    info!("uevent monitor stopped");
}
