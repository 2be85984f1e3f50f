//! Native USB monitors
//!
//! A native monitor watches attach/detach on its own OS thread and reports
//! already-parsed device records through a [`MonitorWorker`]. The async side
//! drives it with [`MonitorCommand`]s: `Enumerate` replays present devices
//! as startup insertions, `Shutdown` ends the thread.

pub mod libusb;
#[cfg(target_os = "linux")]
pub mod sysfs;
#[cfg(target_os = "linux")]
pub mod uevent;

use common::{MonitorCommand, MonitorWorker, RawEvent, Result};
use model::{Change, EventOrigin, UsbDevice};
use std::thread::JoinHandle;
use tracing::debug;

/// Per-start monitor settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorOptions {
    /// Also report serial console (tty) nodes backed by USB devices
    pub include_tty: bool,
}

/// Native attach/detach source
pub trait UsbMonitor: Send + Sync {
    /// Facility name used in logs and setup errors
    fn name(&self) -> &'static str;

    /// Open the OS facility and spawn the monitor thread
    ///
    /// Setup failures are returned here, before any thread is spawned.
    fn start(&self, worker: MonitorWorker, options: MonitorOptions) -> Result<JoinHandle<()>>;
}

/// What the monitor thread should do after handling pending commands
pub(crate) enum Control {
    Continue,
    Stop,
}

/// Drain pending commands
///
/// `enumerate` lists present devices; they are sent as startup insertions
/// and the count is returned to the requester.
pub(crate) fn handle_commands<F>(worker: &MonitorWorker, mut enumerate: F) -> Control
where
    F: FnMut() -> Vec<UsbDevice>,
{
    while let Some(cmd) = worker.try_recv_command() {
        match cmd {
            MonitorCommand::Shutdown => return Control::Stop,
            MonitorCommand::Enumerate { response } => {
                let devices = enumerate();
                let count = devices.len();
                for device in devices {
                    if !send(worker, Change::Inserted, device, EventOrigin::Startup) {
                        return Control::Stop;
                    }
                }
                debug!("Enumerated {} present devices", count);
                let _ = response.send(count);
            }
        }
    }
    Control::Continue
}

/// Forward one record; false once the async side is gone
pub(crate) fn send(
    worker: &MonitorWorker,
    change: Change,
    device: UsbDevice,
    origin: EventOrigin,
) -> bool {
    worker
        .send_event(RawEvent::Native {
            change,
            device,
            origin,
        })
        .is_ok()
}
