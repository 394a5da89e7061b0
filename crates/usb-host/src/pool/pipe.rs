//! Pipe entities

use protocol::{EndpointDescriptor, PipeDirection, PipeType};

/// Pipe id of the default control pipe
pub const CONTROL_PIPE_ID: u8 = 0;

/// Public description of a pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeInfo {
    /// Session-wide object id
    pub object_id: u32,
    pub interface_number: u8,
    pub alt_setting: u8,
    /// Index within its interface alt setting; 0 is the control pipe
    pub pipe_id: u8,
    /// Endpoint number without the direction bit
    pub address: u8,
    pub direction: PipeDirection,
    pub pipe_type: PipeType,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl PipeInfo {
    /// The default control pipe of a device
    pub(crate) fn control(object_id: u32, interface_number: u8) -> Self {
        Self {
            object_id,
            interface_number,
            alt_setting: 0,
            pipe_id: CONTROL_PIPE_ID,
            address: 0,
            direction: PipeDirection::Out,
            pipe_type: PipeType::Control,
            max_packet_size: 64,
            interval: 0,
        }
    }

    pub(crate) fn from_endpoint(
        object_id: u32,
        interface_number: u8,
        alt_setting: u8,
        pipe_id: u8,
        endpoint: &EndpointDescriptor,
    ) -> Self {
        Self {
            object_id,
            interface_number,
            alt_setting,
            pipe_id,
            address: endpoint.number(),
            direction: endpoint.direction(),
            pipe_type: endpoint.transfer_type(),
            max_packet_size: endpoint.max_packet_size,
            interval: endpoint.interval,
        }
    }

    /// Endpoint address with the direction bit set for IN pipes
    pub fn endpoint_address(&self) -> u8 {
        (self.direction.bit() << 7) | self.address
    }
}
