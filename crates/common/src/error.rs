//! Common error types

use std::fmt;
use thiserror::Error;

/// A platform facility that could not be started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupFailure {
    /// Facility name, e.g. `uevent-netlink` or `bus:volume-change`
    pub source: String,
    pub reason: String,
}

impl SetupFailure {
    pub fn new(source: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for SetupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source, self.reason)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to start event sources: {}", join_failures(.0))]
    SourceSetup(Vec<SetupFailure>),

    #[error("USB error: {0}")]
    Usb(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a single failed facility
    pub fn setup(source: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::SourceSetup(vec![SetupFailure::new(source, reason)])
    }

    /// Facilities named by a setup error
    pub fn failed_sources(&self) -> Vec<&str> {
        match self {
            Error::SourceSetup(failures) => failures.iter().map(|f| f.source.as_str()).collect(),
            _ => Vec::new(),
        }
    }
}

fn join_failures(failures: &[SetupFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, Error>;
