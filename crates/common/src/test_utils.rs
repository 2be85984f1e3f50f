//! Test utilities for usb-events
//!
//! Provides mock device records and helper functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_native_device;
//!
//! let device = create_mock_native_device(1);
//! assert_eq!(device.device_name, "/dev/bus/usb/001/001");
//! ```

use model::{Change, EventOrigin, UsbDevice};
use std::future::Future;
use std::time::Duration;

use crate::channel::{InstancePayload, RawEvent};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Serial number of the Kingston DT 101 II used across scenarios
pub const KINGSTON_SERIAL: &str = "0019E06B9C85F9A0F7550C20";

/// PnP instance path of the Kingston DT 101 II
pub const KINGSTON_INSTANCE: &str = r"USB\VID_0951&PID_1625\0019E06B9C85F9A0F7550C20";

/// Create the Kingston flash drive as a native monitor would report it
pub fn create_kingston_device() -> UsbDevice {
    UsbDevice {
        device_name: "/dev/bus/usb/001/004".to_string(),
        system_path: "/sys/devices/pci0000:00/0000:00:14.0/usb1/1-2".to_string(),
        product: "DataTraveler 101 II".to_string(),
        product_description: "DataTraveler 101 II".to_string(),
        product_id: "1625".to_string(),
        serial_number: KINGSTON_SERIAL.to_string(),
        vendor: "Kingston".to_string(),
        vendor_description: "Kingston Technology".to_string(),
        vendor_id: "0951".to_string(),
        ..Default::default()
    }
}

/// Create a native device record with fields derived from `id`
///
/// # Arguments
/// * `id` - Device number; drives the address, sysfs port and serial
pub fn create_mock_native_device(id: u32) -> UsbDevice {
    UsbDevice {
        device_name: format!("/dev/bus/usb/001/{:03}", id),
        system_path: format!("/sys/devices/pci0000:00/0000:00:14.0/usb1/1-{}", id),
        product: format!("Test Product {}", id),
        product_description: format!("Test Product {}", id),
        product_id: format!("{:04x}", 0x2000 + id),
        serial_number: format!("SN{:06}", id),
        vendor: format!("Test Manufacturer {}", id),
        vendor_description: format!("Test Manufacturer {}", id),
        vendor_id: format!("{:04x}", 0x1000 + id),
        ..Default::default()
    }
}

/// Create a list of native device records for testing
pub fn create_mock_device_list(count: u32) -> Vec<UsbDevice> {
    (1..=count).map(create_mock_native_device).collect()
}

/// Native insertion event for a device
pub fn native_inserted(device: UsbDevice) -> RawEvent {
    RawEvent::Native {
        change: Change::Inserted,
        device,
        origin: EventOrigin::Live,
    }
}

/// Native removal event for a device
pub fn native_removed(device: UsbDevice) -> RawEvent {
    RawEvent::Native {
        change: Change::Removed,
        device,
        origin: EventOrigin::Live,
    }
}

/// Controller association reference for an instance path, as the bus
/// reports it (backslashes doubled, value quoted)
pub fn controller_dependent(instance_path: &str) -> InstancePayload {
    InstancePayload::Dependent(format!(
        r#"\\DESKTOP-TEST\root\cimv2:Win32_PnPEntity.DeviceID="{}""#,
        instance_path.replace('\\', r"\\")
    ))
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
