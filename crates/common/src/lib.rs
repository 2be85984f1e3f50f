//! Common utilities for usb-events
//!
//! This crate provides the plumbing shared by the watcher and its event
//! sources: error handling, logging setup, the channel bridge that turns
//! foreign-thread callbacks into messages, and the shutdown signal.

pub mod channel;
pub mod error;
pub mod logging;
pub mod shutdown;
pub mod test_utils;

pub use channel::{
    EventSink, InstancePayload, MonitorBridge, MonitorCommand, MonitorWorker, RawEvent,
    create_monitor_bridge,
};
pub use error::{Error, Result, SetupFailure};
pub use logging::setup_logging;
pub use shutdown::{ShutdownListener, ShutdownSignal};
