//! Watcher configuration management

use crate::coordinator::WatcherOptions;
use anyhow::{Context, Result, anyhow};
use model::{MatchKey, Platform};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WatcherConfig {
    #[serde(default)]
    pub watcher: WatcherSettings,
    #[serde(default)]
    pub mount: MountSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Native Linux event source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MonitorKind {
    /// Kernel uevents over netlink
    #[default]
    Uevent,
    /// libusb hotplug callbacks
    Libusb,
}

impl fmt::Display for MonitorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorKind::Uevent => f.write_str("uevent"),
            MonitorKind::Libusb => f.write_str("libusb"),
        }
    }
}

impl FromStr for MonitorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uevent" => Ok(MonitorKind::Uevent),
            "libusb" => Ok(MonitorKind::Libusb),
            other => Err(format!(
                "Unknown monitor '{}', expected one of: uevent, libusb",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherSettings {
    /// Report devices attached before start
    #[serde(default)]
    pub include_present: bool,
    /// Subscribe to every PnP entity rather than controller associations
    #[serde(default)]
    pub use_broad_query: bool,
    /// Include USB serial consoles
    #[serde(default)]
    pub include_tty: bool,
    #[serde(default = "WatcherSettings::default_use_mount_point")]
    pub use_mount_point: bool,
    /// Platform override (windows, macos, linux)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    /// Removal match key override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_key: Option<MatchKey>,
    #[serde(default)]
    pub monitor: MonitorKind,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            include_present: false,
            use_broad_query: false,
            include_tty: false,
            use_mount_point: Self::default_use_mount_point(),
            platform: None,
            match_key: None,
            monitor: MonitorKind::default(),
        }
    }
}

impl WatcherSettings {
    fn default_use_mount_point() -> bool {
        true
    }
}

/// Mount resolution tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSettings {
    /// Resolver attempts for live insertions
    #[serde(default = "MountSettings::default_live_attempts")]
    pub live_attempts: u32,
    /// Resolver attempts for devices present at startup
    #[serde(default = "MountSettings::default_startup_attempts")]
    pub startup_attempts: u32,
    #[serde(default = "MountSettings::default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "MountSettings::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for MountSettings {
    fn default() -> Self {
        Self {
            live_attempts: Self::default_live_attempts(),
            startup_attempts: Self::default_startup_attempts(),
            retry_interval_ms: Self::default_retry_interval_ms(),
            poll_interval_ms: Self::default_poll_interval_ms(),
        }
    }
}

impl MountSettings {
    fn default_live_attempts() -> u32 {
        crate::mount::DEFAULT_LIVE_ATTEMPTS
    }

    fn default_startup_attempts() -> u32 {
        crate::mount::DEFAULT_STARTUP_ATTEMPTS
    }

    fn default_retry_interval_ms() -> u64 {
        1
    }

    fn default_poll_interval_ms() -> u64 {
        500
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "LoggingSettings::default_log_level")]
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl LoggingSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl WatcherConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-events/watcher.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: WatcherConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-events").join("watcher.toml")
        } else {
            PathBuf::from(".config/usb-events/watcher.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.mount.live_attempts == 0 || self.mount.startup_attempts == 0 {
            return Err(anyhow!("Mount attempt counts must be greater than 0"));
        }

        if self.mount.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be greater than 0"));
        }

        Ok(())
    }

    /// Watcher start options described by this configuration
    pub fn options(&self) -> WatcherOptions {
        WatcherOptions {
            platform: self.watcher.platform.unwrap_or_else(Platform::current),
            match_key: self.watcher.match_key,
            include_present: self.watcher.include_present,
            use_broad_query: self.watcher.use_broad_query,
            include_tty: self.watcher.include_tty,
            use_mount_point: self.watcher.use_mount_point,
            live_attempts: self.mount.live_attempts,
            startup_attempts: self.mount.startup_attempts,
            retry_interval: Duration::from_millis(self.mount.retry_interval_ms),
            poll_interval: Duration::from_millis(self.mount.poll_interval_ms),
        }
    }
}

/// Expand `~` and environment variables in a user-supplied path
pub fn expand_path(path: &str) -> PathBuf {
    match shellexpand::full(path) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(path).as_ref()),
    }
}

/// Load a configuration file named on the command line
pub fn load_config(path: &str) -> Result<WatcherConfig> {
    WatcherConfig::load(Some(expand_path(path)))
}
