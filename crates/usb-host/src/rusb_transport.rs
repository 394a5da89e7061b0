//! libusb transport
//!
//! Device handles are opened by (bus, address) and kept until the pool closes
//! them. libusb handles are thread safe, so transfers and configuration
//! calls share one handle without a lock; a blocked transfer never delays a
//! claim, release, alternate setting change or halt clear on the device.

use crate::error::map_rusb_error;
use crate::transport::{RawTransport, Transfer};
use common::{Error, Result};
use protocol::{
    ConfigDescriptor, DeviceAddress, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor,
    PipeType, PnpDeviceInfo,
};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

type SharedHandle = Arc<DeviceHandle<Context>>;

pub struct RusbTransport {
    context: Context,
    handles: Mutex<HashMap<DeviceAddress, SharedHandle>>,
}

impl RusbTransport {
    pub fn new() -> Result<Self> {
        let context = Context::new().map_err(|e| map_rusb_error(e, Duration::ZERO))?;
        Ok(Self {
            context,
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// Every attached device, as reported to the PnP loader
    pub fn enumerate(&self) -> Result<Vec<PnpDeviceInfo>> {
        let devices = self
            .context
            .devices()
            .map_err(|e| map_rusb_error(e, Duration::ZERO))?;

        let mut infos = Vec::new();
        for device in devices.iter() {
            let address = DeviceAddress::new(device.bus_number(), device.address());
            let descriptors = read_device_descriptor(&device)
                .and_then(|desc| Ok((desc, read_config_descriptor(&device)?)));
            match descriptors {
                Ok((desc, config)) => {
                    infos.push(PnpDeviceInfo::from_descriptors(address, desc, &config))
                }
                Err(e) => warn!("Skipping device {} during enumeration: {}", address, e),
            }
        }

        debug!("Enumerated {} devices", infos.len());
        Ok(infos)
    }

    fn find_device(&self, address: DeviceAddress) -> Result<Device<Context>> {
        let devices = self
            .context
            .devices()
            .map_err(|e| map_rusb_error(e, Duration::ZERO))?;
        devices
            .iter()
            .find(|d| d.bus_number() == address.bus && d.address() == address.device)
            .ok_or(Error::NoDevice)
    }

    fn handle(&self, address: DeviceAddress) -> Result<SharedHandle> {
        self.handles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&address)
            .cloned()
            .ok_or_else(|| Error::InvalidParameter(format!("device {} is not open", address)))
    }
}

impl RawTransport for RusbTransport {
    fn open_device(&self, address: DeviceAddress) -> Result<()> {
        if self.handle(address).is_ok() {
            return Ok(());
        }

        let device = self.find_device(address)?;
        let handle = device.open().map_err(|e| {
            warn!("Failed to open device {}: {}", address, e);
            map_rusb_error(e, Duration::ZERO)
        })?;
        self.handles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(address)
            .or_insert_with(|| Arc::new(handle));
        info!("Opened device {}", address);
        Ok(())
    }

    fn close_device(&self, address: DeviceAddress) -> Result<()> {
        let removed = self
            .handles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&address);
        if removed.is_none() {
            return Err(Error::NotFound(format!("device {} is not open", address)));
        }
        debug!("Closed device {}", address);
        Ok(())
    }

    fn device_descriptor(&self, address: DeviceAddress) -> Result<DeviceDescriptor> {
        read_device_descriptor(&self.find_device(address)?)
    }

    fn config_descriptor(&self, address: DeviceAddress) -> Result<ConfigDescriptor> {
        read_config_descriptor(&self.find_device(address)?)
    }

    fn claim_interface(&self, address: DeviceAddress, interface: u8) -> Result<()> {
        let handle = self.handle(address)?;

        match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!(
                    "Detaching kernel driver from interface {} on {}",
                    interface, address
                );
                if let Err(e) = handle.detach_kernel_driver(interface) {
                    warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    );
                }
            }
            Ok(false) => {}
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            ),
        }

        handle
            .claim_interface(interface)
            .map_err(|e| map_rusb_error(e, Duration::ZERO))
    }

    fn release_interface(&self, address: DeviceAddress, interface: u8) -> Result<()> {
        let handle = self.handle(address)?;
        handle
            .release_interface(interface)
            .map_err(|e| map_rusb_error(e, Duration::ZERO))?;

        if let Err(e) = handle.attach_kernel_driver(interface) {
            debug!(
                "Could not reattach kernel driver to interface {}: {}",
                interface, e
            );
        }
        Ok(())
    }

    fn set_alt_setting(
        &self,
        address: DeviceAddress,
        interface: u8,
        alt_setting: u8,
    ) -> Result<()> {
        let handle = self.handle(address)?;
        handle
            .set_alternate_setting(interface, alt_setting)
            .map_err(|e| map_rusb_error(e, Duration::ZERO))
    }

    fn clear_halt(&self, address: DeviceAddress, endpoint: u8) -> Result<()> {
        let handle = self.handle(address)?;
        handle
            .clear_halt(endpoint)
            .map_err(|e| map_rusb_error(e, Duration::ZERO))
    }

    fn transfer(&self, address: DeviceAddress, transfer: &mut Transfer) -> Result<usize> {
        let handle = self.handle(address)?;

        let is_in = transfer.is_in();
        let endpoint = transfer.endpoint;
        let timeout = transfer.timeout;
        let length = transfer.length;
        let buffer = &mut transfer.buffer[..length];

        let result = match (transfer.pipe_type, transfer.setup) {
            (PipeType::Control, Some(setup)) if is_in => handle.read_control(
                setup.request_type(),
                setup.request,
                setup.value,
                setup.index,
                buffer,
                timeout,
            ),
            (PipeType::Control, Some(setup)) => handle.write_control(
                setup.request_type(),
                setup.request,
                setup.value,
                setup.index,
                buffer,
                timeout,
            ),
            (PipeType::Bulk, _) if is_in => handle.read_bulk(endpoint, buffer, timeout),
            (PipeType::Bulk, _) => handle.write_bulk(endpoint, buffer, timeout),
            (PipeType::Interrupt, _) if is_in => handle.read_interrupt(endpoint, buffer, timeout),
            (PipeType::Interrupt, _) => handle.write_interrupt(endpoint, buffer, timeout),
            (pipe_type, _) => {
                return Err(Error::InvalidParameter(format!(
                    "{:?} transfers are not supported by the synchronous transport",
                    pipe_type
                )));
            }
        };

        result.map_err(|e| map_rusb_error(e, timeout))
    }

    fn cancel_transfer(&self, address: DeviceAddress, endpoint: u8) -> Result<()> {
        // Synchronous libusb transfers cannot be aborted; the transfer ends at its timeout
        warn!(
            "Cancel on {} endpoint {:#04x} waits for the transfer timeout",
            address, endpoint
        );
        Ok(())
    }
}

fn read_device_descriptor(device: &Device<Context>) -> Result<DeviceDescriptor> {
    let desc = device
        .device_descriptor()
        .map_err(|e| map_rusb_error(e, Duration::ZERO))?;
    Ok(DeviceDescriptor {
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
        bcd_device: version_to_bcd(desc.device_version()),
        class: desc.class_code(),
        subclass: desc.sub_class_code(),
        protocol: desc.protocol_code(),
        num_configurations: desc.num_configurations(),
    })
}

fn read_config_descriptor(device: &Device<Context>) -> Result<ConfigDescriptor> {
    let config = device
        .active_config_descriptor()
        .map_err(|e| map_rusb_error(e, Duration::ZERO))?;

    let mut interfaces = Vec::new();
    for interface in config.interfaces() {
        for desc in interface.descriptors() {
            interfaces.push(InterfaceDescriptor {
                number: desc.interface_number(),
                alt_setting: desc.setting_number(),
                class: desc.class_code(),
                subclass: desc.sub_class_code(),
                protocol: desc.protocol_code(),
                endpoints: desc
                    .endpoint_descriptors()
                    .map(|ep| EndpointDescriptor {
                        address: ep.address(),
                        attributes: transfer_type_bits(ep.transfer_type()),
                        max_packet_size: ep.max_packet_size(),
                        interval: ep.interval(),
                    })
                    .collect(),
            });
        }
    }

    Ok(ConfigDescriptor {
        value: config.number(),
        interfaces,
    })
}

/// `bmAttributes` transfer type bits
fn transfer_type_bits(transfer_type: rusb::TransferType) -> u8 {
    match transfer_type {
        rusb::TransferType::Control => 0,
        rusb::TransferType::Isochronous => 1,
        rusb::TransferType::Bulk => 2,
        rusb::TransferType::Interrupt => 3,
    }
}

/// Re-encode a decoded `bcdDevice`
fn version_to_bcd(version: rusb::Version) -> u16 {
    let major = u16::from(version.major());
    ((major / 10) << 12)
        | ((major % 10) << 8)
        | (u16::from(version.minor()) << 4)
        | u16::from(version.sub_minor())
}
