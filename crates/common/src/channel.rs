//! Async channel bridge between event sources and the Tokio runtime
//!
//! Native monitors run on their own threads and OS event buses deliver on
//! contexts we don't control. Neither calls into the engine directly: every
//! notification becomes a [`RawEvent`] message pushed through an
//! [`EventSink`] and drained, in order, by the async side.

use async_channel::{Receiver, Sender, bounded};
use model::{Change, EventOrigin, UsbDevice};

/// Capacity of both bridge channels
pub const BRIDGE_CAPACITY: usize = 256;

/// Commands from the Tokio runtime to a native monitor thread
#[derive(Debug)]
pub enum MonitorCommand {
    /// Emit every present device as a startup insertion
    Enumerate {
        /// Number of devices emitted
        response: tokio::sync::oneshot::Sender<usize>,
    },

    /// Stop the monitor thread
    Shutdown,
}

/// Instance handle delivered by a bus creation/deletion notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstancePayload {
    /// Controller association reference, e.g.
    /// `\\HOST\root\cimv2:Win32_PnPEntity.DeviceID="USB\\VID_0951&PID_1625\\0019E0"`
    Dependent(String),
    /// Plain PnP device id, e.g. `USB\VID_0951&PID_1625\0019E0`
    DeviceId(String),
}

/// Raw notification from any source, before normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    /// Native monitor callback; the record is already parsed
    Native {
        change: Change,
        device: UsbDevice,
        origin: EventOrigin,
    },

    /// Volume change from the event bus
    VolumeChange {
        drive_name: String,
        /// 2 = arrival, 3 = removal
        event_type: u16,
    },

    /// Device instance creation/deletion from the event bus
    Instance {
        change: Change,
        payload: InstancePayload,
        origin: EventOrigin,
    },
}

/// Producer handle for raw events
///
/// Cloneable and usable from any thread.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<RawEvent>,
}

impl EventSink {
    /// Send from a blocking context (native thread, bus callback)
    pub fn send_blocking(&self, event: RawEvent) -> crate::Result<()> {
        self.tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Send from async code
    pub async fn send(&self, event: RawEvent) -> crate::Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// True once the async side has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct MonitorBridge {
    cmd_tx: Sender<MonitorCommand>,
    event_rx: Receiver<RawEvent>,
    sink: EventSink,
}

impl MonitorBridge {
    /// Send a command to the monitor thread
    pub async fn send_command(&self, cmd: MonitorCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Send a command without waiting for channel capacity
    pub fn try_send_command(&self, cmd: MonitorCommand) -> crate::Result<()> {
        self.cmd_tx
            .try_send(cmd)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive the next raw event
    pub async fn recv_event(&self) -> crate::Result<RawEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Sink for additional producers (bus subscriptions)
    pub fn event_sink(&self) -> EventSink {
        self.sink.clone()
    }
}

/// Handle for a native monitor thread (blocking)
pub struct MonitorWorker {
    pub(crate) cmd_rx: Receiver<MonitorCommand>,
    sink: EventSink,
}

impl MonitorWorker {
    /// Receive a command (blocking)
    pub fn recv_command(&self) -> crate::Result<MonitorCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    ///
    /// A closed command channel is reported as [`MonitorCommand::Shutdown`].
    pub fn try_recv_command(&self) -> Option<MonitorCommand> {
        match self.cmd_rx.try_recv() {
            Ok(cmd) => Some(cmd),
            Err(async_channel::TryRecvError::Closed) => Some(MonitorCommand::Shutdown),
            Err(async_channel::TryRecvError::Empty) => None,
        }
    }

    /// Send a raw event (blocking)
    pub fn send_event(&self, event: RawEvent) -> crate::Result<()> {
        self.sink.send_blocking(event)
    }

    pub fn event_sink(&self) -> EventSink {
        self.sink.clone()
    }
}

/// Create the channel bridge between a monitor thread and Tokio
///
/// Returns (MonitorBridge for Tokio, MonitorWorker for the monitor thread)
pub fn create_monitor_bridge() -> (MonitorBridge, MonitorWorker) {
    let (cmd_tx, cmd_rx) = bounded(BRIDGE_CAPACITY);
    let (event_tx, event_rx) = bounded(BRIDGE_CAPACITY);
    let sink = EventSink { tx: event_tx };

    (
        MonitorBridge {
            cmd_tx,
            event_rx,
            sink: sink.clone(),
        },
        MonitorWorker { cmd_rx, sink },
    )
}
