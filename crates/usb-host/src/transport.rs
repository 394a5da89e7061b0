//! Raw USB transport capability
//!
//! The object pool never talks to libusb directly. Everything it needs from
//! the host controller goes through [`RawTransport`], implemented by
//! [`crate::RusbTransport`] on real hardware and by
//! `test_utils::MockTransport` in tests.

use common::Result;
use protocol::{ConfigDescriptor, ControlSetup, DeviceAddress, DeviceDescriptor, PipeType};
use std::time::Duration;

/// A transfer as handed to the transport
#[derive(Debug, Clone)]
pub struct Transfer {
    /// Endpoint address including the direction bit (0x00/0x80 for control)
    pub endpoint: u8,
    pub pipe_type: PipeType,
    /// Setup stage, control transfers only
    pub setup: Option<ControlSetup>,
    /// Data stage: source for OUT, destination for IN
    pub buffer: Vec<u8>,
    /// Bytes of `buffer` taking part in the transfer
    pub length: usize,
    /// `Duration::ZERO` waits forever
    pub timeout: Duration,
}

impl Transfer {
    /// True when data flows device to host
    pub fn is_in(&self) -> bool {
        match &self.setup {
            Some(setup) => setup.request_type() & 0x80 != 0,
            None => self.endpoint & 0x80 != 0,
        }
    }
}

/// Host controller operations used by the object pool
pub trait RawTransport: Send + Sync {
    fn open_device(&self, address: DeviceAddress) -> Result<()>;

    fn close_device(&self, address: DeviceAddress) -> Result<()>;

    fn device_descriptor(&self, address: DeviceAddress) -> Result<DeviceDescriptor>;

    /// Active configuration, every alternate setting included
    fn config_descriptor(&self, address: DeviceAddress) -> Result<ConfigDescriptor>;

    fn claim_interface(&self, address: DeviceAddress, interface: u8) -> Result<()>;

    fn release_interface(&self, address: DeviceAddress, interface: u8) -> Result<()>;

    fn set_alt_setting(&self, address: DeviceAddress, interface: u8, alt_setting: u8)
    -> Result<()>;

    fn clear_halt(&self, address: DeviceAddress, endpoint: u8) -> Result<()>;

    /// Run one transfer to completion; returns the bytes actually moved
    fn transfer(&self, address: DeviceAddress, transfer: &mut Transfer) -> Result<usize>;

    /// Abort whatever transfer is in flight on `endpoint`
    fn cancel_transfer(&self, address: DeviceAddress, endpoint: u8) -> Result<()>;
}
