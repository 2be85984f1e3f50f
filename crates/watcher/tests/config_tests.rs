//! Integration tests for configuration parsing
//!
//! Tests watcher configuration files, including:
//! - Minimal and full files
//! - Platform and match-key overrides
//! - Save/load through the filesystem
//! - Invalid configuration handling

use model::{MatchKey, Platform};
use std::time::Duration;
use tempfile::TempDir;
use watcher::config::{MonitorKind, WatcherConfig, load_config};

const FULL_CONFIG: &str = r#"
[watcher]
include_present = true
use_broad_query = true
include_tty = true
use_mount_point = false
platform = "macos"
match_key = "name-and-system-path"
monitor = "libusb"

[mount]
live_attempts = 1000
startup_attempts = 2
retry_interval_ms = 5
poll_interval_ms = 250

[logging]
log_level = "debug"
"#;

fn write_config(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("watcher.toml");
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_full_config_parses() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, FULL_CONFIG);

    let config = WatcherConfig::load(Some(path)).unwrap();
    assert!(config.watcher.include_present);
    assert!(config.watcher.use_broad_query);
    assert!(!config.watcher.use_mount_point);
    assert_eq!(config.watcher.platform, Some(Platform::MacOs));
    assert_eq!(config.watcher.monitor, MonitorKind::Libusb);
    assert_eq!(config.logging.log_level, "debug");

    let options = config.options();
    assert_eq!(options.platform, Platform::MacOs);
    assert_eq!(options.match_key(), MatchKey::NameAndSystemPath);
    assert_eq!(options.live_attempts, 1000);
    assert_eq!(options.startup_attempts, 2);
    assert_eq!(options.retry_interval, Duration::from_millis(5));
    assert_eq!(options.poll_interval, Duration::from_millis(250));
}

#[test]
fn test_partial_config_fills_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[watcher]\ninclude_present = true\n");

    let config = WatcherConfig::load(Some(path)).unwrap();
    assert!(config.watcher.include_present);
    assert!(config.watcher.use_mount_point);
    assert_eq!(config.watcher.monitor, MonitorKind::Uevent);
    assert_eq!(config.mount.live_attempts, 9000);
    assert_eq!(config.mount.poll_interval_ms, 500);
    assert_eq!(config.logging.log_level, "info");
    assert_eq!(config.options().match_key, None);
}

#[test]
fn test_save_then_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("usb-events").join("watcher.toml");

    let mut config = WatcherConfig::default();
    config.watcher.match_key = Some(MatchKey::VendorProductSerial);
    config.mount.poll_interval_ms = 100;
    config.save(&path).unwrap();

    assert!(path.exists());
    let loaded = WatcherConfig::load(Some(path)).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_load_config_by_string_path() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, FULL_CONFIG);

    let config = load_config(path.to_str().unwrap()).unwrap();
    assert_eq!(config.mount.live_attempts, 1000);
}

#[test]
fn test_invalid_configs_are_rejected() {
    let dir = TempDir::new().unwrap();
    let cases = [
        "[logging]\nlog_level = \"verbose\"\n",
        "[mount]\nstartup_attempts = 0\n",
        "[mount]\npoll_interval_ms = 0\n",
        "[watcher]\nplatform = \"beos\"\n",
        "[watcher]\nmatch_key = \"serial-or-name\"\n",
        "[watcher]\nmonitor = \"udev\"\n",
        "[watcher\n",
    ];

    for content in cases {
        let path = write_config(&dir, content);
        assert!(
            WatcherConfig::load(Some(path)).is_err(),
            "accepted: {}",
            content
        );
    }
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let result = WatcherConfig::load(Some(dir.path().join("absent.toml")));
    assert!(result.is_err());
}
