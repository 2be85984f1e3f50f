//! Per-platform behaviour
//!
//! Platform differences are selected once at startup through [`Platform`]
//! rather than scattered through the engine: each variant supplies the
//! default removal [`MatchKey`], the way mounts are learned about
//! ([`MountStrategy`]), and how drive paths are spelled.

use crate::device::UsbDevice;
use crate::error::ModelError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Host platform family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
}

/// How a platform learns about volume mounts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStrategy {
    /// Mount/unmount notifications arrive on the OS event bus
    VolumeEvents,
    /// No notification channel; mount state is polled per device
    Poll,
}

impl Platform {
    /// Platform this binary was compiled for
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }

    /// Field combination that reliably pairs an insert with its removal
    pub fn default_match_key(self) -> MatchKey {
        match self {
            Platform::Windows => MatchKey::Serial,
            Platform::MacOs => MatchKey::VendorProductSerial,
            Platform::Linux => MatchKey::NameAndSystemPath,
        }
    }

    pub fn mount_strategy(self) -> MountStrategy {
        match self {
            Platform::Windows => MountStrategy::VolumeEvents,
            Platform::MacOs | Platform::Linux => MountStrategy::Poll,
        }
    }

    pub fn path_separator(self) -> char {
        match self {
            Platform::Windows => '\\',
            Platform::MacOs | Platform::Linux => '/',
        }
    }

    /// Canonical spelling of a drive or mount path
    ///
    /// Windows drive names always carry a trailing separator (`E:` becomes
    /// `E:\`). Unix mount directories drop trailing separators except for
    /// the root itself.
    pub fn normalize_drive_path(self, path: &str) -> String {
        let path = path.trim();
        if path.is_empty() {
            return String::new();
        }

        match self {
            Platform::Windows => {
                let path = path.replace('/', "\\");
                if path.ends_with('\\') {
                    path
                } else {
                    format!("{}\\", path)
                }
            }
            Platform::MacOs | Platform::Linux => {
                let trimmed = path.trim_end_matches('/');
                if trimmed.is_empty() {
                    "/".to_string()
                } else {
                    trimmed.to_string()
                }
            }
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::Windows => "windows",
            Platform::MacOs => "macos",
            Platform::Linux => "linux",
        };
        f.write_str(name)
    }
}

impl FromStr for Platform {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "windows" => Ok(Platform::Windows),
            "macos" | "osx" => Ok(Platform::MacOs),
            "linux" => Ok(Platform::Linux),
            other => Err(ModelError::UnknownPlatform(other.to_string())),
        }
    }
}

/// Policy used to correlate an insertion record with its removal record
///
/// Every field in the key must match (conjunction); matching on any single
/// field would remove unrelated devices that happen to share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchKey {
    /// Serial number equality
    Serial,
    /// Product id, vendor id and serial number all equal
    VendorProductSerial,
    /// Device name and system path both equal
    NameAndSystemPath,
}

impl MatchKey {
    pub fn matches(self, a: &UsbDevice, b: &UsbDevice) -> bool {
        match self {
            MatchKey::Serial => a.serial_number == b.serial_number,
            MatchKey::VendorProductSerial => {
                a.product_id == b.product_id
                    && a.vendor_id == b.vendor_id
                    && a.serial_number == b.serial_number
            }
            MatchKey::NameAndSystemPath => {
                a.device_name == b.device_name && a.system_path == b.system_path
            }
        }
    }
}

impl fmt::Display for MatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MatchKey::Serial => "serial",
            MatchKey::VendorProductSerial => "vendor-product-serial",
            MatchKey::NameAndSystemPath => "name-and-system-path",
        };
        f.write_str(name)
    }
}

impl FromStr for MatchKey {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serial" => Ok(MatchKey::Serial),
            "vendor-product-serial" => Ok(MatchKey::VendorProductSerial),
            "name-and-system-path" => Ok(MatchKey::NameAndSystemPath),
            other => Err(ModelError::UnknownMatchKey(other.to_string())),
        }
    }
}
