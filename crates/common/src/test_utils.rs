//! Test utilities shared by the workspace crates
//!
//! Descriptor builders and timeout helpers for unit and integration tests.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_cdc_config;
//!
//! let config = create_cdc_config();
//! assert_eq!(config.interface_numbers(), vec![0, 1]);
//! ```

use protocol::{
    ConfigDescriptor, DeviceAddress, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor,
    InterfaceSummary, PnpCommand, PnpDeviceInfo, PnpEvent, RemoveScope,
};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Device descriptor with the given ids and a composite (class 0) layout
pub fn create_mock_device_descriptor(vendor_id: u16, product_id: u16) -> DeviceDescriptor {
    DeviceDescriptor {
        vendor_id,
        product_id,
        bcd_device: 0x0100,
        class: 0x00,
        subclass: 0x00,
        protocol: 0x00,
        num_configurations: 1,
    }
}

/// Endpoint descriptor; `attributes` selects the transfer type
pub fn create_endpoint(address: u8, attributes: u8, max_packet_size: u16) -> EndpointDescriptor {
    EndpointDescriptor {
        address,
        attributes,
        max_packet_size,
        interval: if attributes & 0x03 == 0x03 { 8 } else { 0 },
    }
}

/// Interface descriptor for alt setting `alt_setting`
pub fn create_interface(
    number: u8,
    alt_setting: u8,
    class: u8,
    endpoints: Vec<EndpointDescriptor>,
) -> InterfaceDescriptor {
    InterfaceDescriptor {
        number,
        alt_setting,
        class,
        subclass: 0x00,
        protocol: 0x00,
        endpoints,
    }
}

/// CDC-ACM style configuration
///
/// Interface 0 (class 0x02): interrupt IN 0x83.
/// Interface 1 (class 0x0A): alt 0 without endpoints, alt 1 with bulk IN 0x81
/// and bulk OUT 0x02.
pub fn create_cdc_config() -> ConfigDescriptor {
    ConfigDescriptor {
        value: 1,
        interfaces: vec![
            create_interface(0, 0, 0x02, vec![create_endpoint(0x83, 0x03, 16)]),
            create_interface(1, 0, 0x0A, Vec::new()),
            create_interface(
                1,
                1,
                0x0A,
                vec![
                    create_endpoint(0x81, 0x02, 512),
                    create_endpoint(0x02, 0x02, 512),
                ],
            ),
        ],
    }
}

/// PnP info for a device whose interfaces have the given classes, numbered from 0
pub fn create_pnp_device_info(
    address: DeviceAddress,
    device: DeviceDescriptor,
    interface_classes: &[u8],
) -> PnpDeviceInfo {
    PnpDeviceInfo {
        address,
        device,
        interfaces: interface_classes
            .iter()
            .enumerate()
            .map(|(i, class)| InterfaceSummary {
                number: i as u8,
                class: *class,
                subclass: 0x00,
                protocol: 0x00,
            })
            .collect(),
    }
}

/// Wrap `info` in an event for `command`
pub fn create_pnp_event(command: PnpCommand, info: PnpDeviceInfo) -> PnpEvent {
    PnpEvent {
        command,
        info,
        remove_scope: RemoveScope::Device,
    }
}

/// Timeout wrapper for async tests
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
