//! USB descriptor and plug-and-play type definitions
//!
//! This module defines the USB-related types shared between the host object
//! pool, the PnP loader and whatever sits on the other side of the driver
//! notification channel.

use serde::{Deserialize, Serialize};

/// Interface index reserved for the default control interface
pub const USB_CTRL_INTERFACE_ID: u8 = 0xFF;

/// Maximum number of interface values carried by a PnP match rule or notification
pub const USB_PNP_INFO_MAX_INTERFACES: usize = 32;

/// Device class code for vendor-specific devices
pub const USB_CLASS_VENDOR_SPEC: u8 = 0xFF;

/// Physical location of a device on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress {
    /// Bus number
    pub bus: u8,
    /// Device address on the bus
    pub device: u8,
}

impl DeviceAddress {
    pub fn new(bus: u8, device: u8) -> Self {
        Self { bus, device }
    }
}

impl std::fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:03}-{:03}", self.bus, self.device)
    }
}

/// Data direction of a pipe, relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipeDirection {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl PipeDirection {
    /// Direction encoded in bit 7 of an endpoint address
    pub fn from_endpoint_address(address: u8) -> Self {
        if address & 0x80 != 0 {
            PipeDirection::In
        } else {
            PipeDirection::Out
        }
    }

    /// Value of the direction bit (0 or 1)
    pub fn bit(self) -> u8 {
        match self {
            PipeDirection::Out => 0,
            PipeDirection::In => 1,
        }
    }
}

/// USB transfer type of a pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipeType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl PipeType {
    /// Decode the transfer type from endpoint `bmAttributes`
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => PipeType::Control,
            1 => PipeType::Isochronous,
            2 => PipeType::Bulk,
            _ => PipeType::Interrupt,
        }
    }
}

/// Endpoint descriptor as reported by the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// `bEndpointAddress` (direction bit included)
    pub address: u8,
    /// `bmAttributes`
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    /// Endpoint number without the direction bit
    pub fn number(&self) -> u8 {
        self.address & 0x0F
    }

    pub fn direction(&self) -> PipeDirection {
        PipeDirection::from_endpoint_address(self.address)
    }

    pub fn transfer_type(&self) -> PipeType {
        PipeType::from_attributes(self.attributes)
    }
}

/// One alternate setting of one interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    /// `bInterfaceNumber`
    pub number: u8,
    /// `bAlternateSetting`
    pub alt_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// Active configuration, flattened to every (interface, alt setting) pair
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDescriptor {
    /// `bConfigurationValue`
    pub value: u8,
    pub interfaces: Vec<InterfaceDescriptor>,
}

impl ConfigDescriptor {
    /// Interface numbers in discovery order, without duplicates
    pub fn interface_numbers(&self) -> Vec<u8> {
        let mut numbers: Vec<u8> = Vec::new();
        for iface in &self.interfaces {
            if !numbers.contains(&iface.number) {
                numbers.push(iface.number);
            }
        }
        numbers
    }
}

/// Device-level descriptor fields used for matching
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    /// `bcdDevice` release number
    pub bcd_device: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub num_configurations: u8,
}

/// Interface attributes reported to the PnP loader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSummary {
    pub number: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl From<&InterfaceDescriptor> for InterfaceSummary {
    fn from(desc: &InterfaceDescriptor) -> Self {
        Self {
            number: desc.number,
            class: desc.class,
            subclass: desc.subclass,
            protocol: desc.protocol,
        }
    }
}

/// Everything the PnP loader knows about one enumerated device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnpDeviceInfo {
    pub address: DeviceAddress,
    pub device: DeviceDescriptor,
    /// Interfaces in the order they were reported
    pub interfaces: Vec<InterfaceSummary>,
}

impl PnpDeviceInfo {
    /// Build the info from a device descriptor and its active configuration
    ///
    /// Only alternate setting 0 of each interface is reported.
    pub fn from_descriptors(
        address: DeviceAddress,
        device: DeviceDescriptor,
        config: &ConfigDescriptor,
    ) -> Self {
        let interfaces = config
            .interfaces
            .iter()
            .filter(|iface| iface.alt_setting == 0)
            .map(InterfaceSummary::from)
            .collect();
        Self {
            address,
            device,
            interfaces,
        }
    }
}

/// PnP notification command identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PnpCommand {
    AddInterface,
    AddDevice,
    ReportInterface,
    RemoveInterface,
    RemoveDevice,
}

impl PnpCommand {
    /// Commands that trigger a matching pass
    pub fn is_add(self) -> bool {
        matches!(
            self,
            PnpCommand::AddInterface | PnpCommand::AddDevice | PnpCommand::ReportInterface
        )
    }

    /// Commands that trigger a removal
    pub fn is_remove(self) -> bool {
        matches!(self, PnpCommand::RemoveInterface | PnpCommand::RemoveDevice)
    }
}

/// What a removal applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoveScope {
    /// Every binding of the device
    Device,
    /// Only bindings that include this interface number
    Interface(u8),
}

/// A PnP event as delivered to the loader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnpEvent {
    pub command: PnpCommand,
    pub info: PnpDeviceInfo,
    pub remove_scope: RemoveScope,
}

/// Driver binding carried by a register or unregister request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverBinding {
    pub module_name: String,
    pub service_name: String,
    pub match_attr: String,
    pub address: DeviceAddress,
    /// Interface numbers that satisfied the rule
    #[serde(with = "serde_bytes")]
    pub interface_numbers: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_type_from_attributes() {
        assert_eq!(PipeType::from_attributes(0x00), PipeType::Control);
        assert_eq!(PipeType::from_attributes(0x01), PipeType::Isochronous);
        assert_eq!(PipeType::from_attributes(0x02), PipeType::Bulk);
        assert_eq!(PipeType::from_attributes(0x03), PipeType::Interrupt);
        // Upper bits carry sync/usage type and are ignored
        assert_eq!(PipeType::from_attributes(0x0D), PipeType::Isochronous);
    }

    #[test]
    fn test_endpoint_direction_and_number() {
        let ep = EndpointDescriptor {
            address: 0x81,
            attributes: 0x03,
            max_packet_size: 8,
            interval: 10,
        };
        assert_eq!(ep.direction(), PipeDirection::In);
        assert_eq!(ep.number(), 1);
        assert_eq!(ep.transfer_type(), PipeType::Interrupt);
        assert_eq!(PipeDirection::from_endpoint_address(0x02), PipeDirection::Out);
    }

    #[test]
    fn test_pnp_info_reports_alt_setting_zero_only() {
        let iface = |number, alt_setting, class| InterfaceDescriptor {
            number,
            alt_setting,
            class,
            subclass: 0,
            protocol: 0,
            endpoints: Vec::new(),
        };
        let config = ConfigDescriptor {
            value: 1,
            interfaces: vec![iface(0, 0, 0x02), iface(1, 0, 0x0A), iface(1, 1, 0x0A)],
        };
        assert_eq!(config.interface_numbers(), vec![0, 1]);

        let info = PnpDeviceInfo::from_descriptors(
            DeviceAddress::new(1, 4),
            DeviceDescriptor::default(),
            &config,
        );
        assert_eq!(info.interfaces.len(), 2);
        assert_eq!(info.interfaces[1].class, 0x0A);
    }

    #[test]
    fn test_command_classification() {
        assert!(PnpCommand::ReportInterface.is_add());
        assert!(!PnpCommand::ReportInterface.is_remove());
        assert!(PnpCommand::RemoveInterface.is_remove());
        assert_eq!(DeviceAddress::new(2, 17).to_string(), "002-017");
    }
}
