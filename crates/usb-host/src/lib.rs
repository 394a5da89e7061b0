//! USB host object pool and PnP loader
//!
//! [`UsbSession`] tracks every opened device as an [`InterfacePool`] holding
//! one [`UsbInterface`] per (interface, alternate setting) and their pipes.
//! Claims are reference counted: the first claim of an interface performs
//! the hardware claim, the last release undoes it, and the last claim on a
//! device closes it. Opened interfaces run requests through per-device IO
//! queues.
//!
//! [`PnpLoader`] matches enumerated devices against driver rules and binds
//! the matching drivers through a [`DeviceRegistrar`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use common::test_utils::{create_cdc_config, create_mock_device_descriptor};
//! use protocol::DeviceAddress;
//! use usb_host::config::SessionSettings;
//! use usb_host::test_utils::MockTransport;
//! use usb_host::UsbSession;
//!
//! let transport = Arc::new(MockTransport::new());
//! let address = DeviceAddress::new(1, 4);
//! transport.add_device(address, create_mock_device_descriptor(0x1234, 0x0001), create_cdc_config());
//!
//! let session = UsbSession::new(transport, &SessionSettings::default());
//! let claimed = session.claim_interface(address, 0).unwrap();
//! assert!(claimed.first_claim());
//! session.release_interface(&claimed).unwrap();
//! assert_eq!(session.pool_count(), 0);
//! ```

pub mod config;
pub mod error;
pub mod ids;
pub mod io;
pub mod pnp;
pub mod pool;
pub mod rusb_transport;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;

pub use config::{HostConfig, SessionSettings};
pub use ids::{IdAllocator, ObjectKind};
pub use io::{
    Completion, CompletionStatus, RequestData, RequestParams, RequestState, UsbRequest,
};
pub use pnp::{
    ChannelRegistrar, DeviceListEntry, DeviceRegistrar, DeviceStatus, InterfaceList, MatchFlags,
    MatchRule, PnpLoader, PnpMatcher, spawn_loader,
};
pub use pool::{
    CONTROL_PIPE_ID, ClaimedInterface, InterfaceHandle, InterfaceKey, InterfacePool,
    InterfaceStatus, PipeInfo, PoolKey, UsbInterface, UsbSession,
};
pub use rusb_transport::RusbTransport;
pub use transport::{RawTransport, Transfer};
