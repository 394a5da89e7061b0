//! Shared USB descriptor and PnP message types
//!
//! This crate defines the data exchanged between the USB host object pool,
//! the PnP loader and the driver host: descriptor snapshots, PnP events,
//! driver bindings, control setup packets, and a versioned postcard codec.
//!
//! # Example
//!
//! ```
//! use protocol::{DeviceAddress, DeviceDescriptor, PnpCommand, PnpDeviceInfo, PnpEvent, RemoveScope};
//! use protocol::{decode_event, encode_event};
//!
//! let event = PnpEvent {
//!     command: PnpCommand::AddDevice,
//!     info: PnpDeviceInfo {
//!         address: DeviceAddress::new(1, 5),
//!         device: DeviceDescriptor::default(),
//!         interfaces: Vec::new(),
//!     },
//!     remove_scope: RemoveScope::Device,
//! };
//!
//! let bytes = encode_event(&event).unwrap();
//! let decoded = decode_event(&bytes).unwrap();
//! assert_eq!(decoded.info.address, DeviceAddress::new(1, 5));
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod setup;
pub mod types;
pub mod version;

pub use codec::{
    MAX_PAYLOAD_SIZE, decode_event, decode_message, encode_binding, encode_event, encode_message,
    validate_version,
};
pub use error::{ProtocolError, Result};
pub use messages::{Message, MessagePayload};
pub use setup::{CONTROL_SETUP_SIZE, ControlSetup, Recipient, RequestKind};
pub use types::{
    ConfigDescriptor, DeviceAddress, DeviceDescriptor, DriverBinding, EndpointDescriptor,
    InterfaceDescriptor, InterfaceSummary, PipeDirection, PipeType, PnpCommand, PnpDeviceInfo,
    PnpEvent, RemoveScope, USB_CLASS_VENDOR_SPEC, USB_CTRL_INTERFACE_ID,
    USB_PNP_INFO_MAX_INTERFACES,
};
pub use version::{CURRENT_VERSION, ProtocolVersion};
