//! Control transfer setup packet
//!
//! ```text
//! [bmRequestType: u8][bRequest: u8][wValue: u16 LE][wIndex: u16 LE][wLength: u16 LE]
//! ```

use crate::PipeDirection;
use crate::error::{ProtocolError, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Size of an encoded setup packet
pub const CONTROL_SETUP_SIZE: usize = 8;

/// Request type field of `bmRequestType`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
}

impl RequestKind {
    fn bits(self) -> u8 {
        match self {
            RequestKind::Standard => 0,
            RequestKind::Class => 1,
            RequestKind::Vendor => 2,
        }
    }
}

/// Recipient field of `bmRequestType`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

impl Recipient {
    fn bits(self) -> u8 {
        match self {
            Recipient::Device => 0,
            Recipient::Interface => 1,
            Recipient::Endpoint => 2,
            Recipient::Other => 3,
        }
    }
}

/// A decoded control request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSetup {
    pub direction: PipeDirection,
    pub kind: RequestKind,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlSetup {
    /// Compose `bmRequestType`
    pub fn request_type(&self) -> u8 {
        (self.direction.bit() << 7) | (self.kind.bits() << 5) | self.recipient.bits()
    }

    /// Encode as the 8-byte wire setup packet
    pub fn to_bytes(&self) -> [u8; CONTROL_SETUP_SIZE] {
        let mut packet = [0u8; CONTROL_SETUP_SIZE];
        packet[0] = self.request_type();
        packet[1] = self.request;
        LittleEndian::write_u16(&mut packet[2..4], self.value);
        LittleEndian::write_u16(&mut packet[4..6], self.index);
        LittleEndian::write_u16(&mut packet[6..8], self.length);
        packet
    }

    /// Decode a setup packet
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CONTROL_SETUP_SIZE {
            return Err(ProtocolError::BufferTooSmall {
                needed: CONTROL_SETUP_SIZE,
                available: bytes.len(),
            });
        }

        let request_type = bytes[0];
        let direction = if request_type & 0x80 != 0 {
            PipeDirection::In
        } else {
            PipeDirection::Out
        };
        let kind = match (request_type >> 5) & 0x03 {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            other => {
                return Err(ProtocolError::InvalidField {
                    field: "bmRequestType.type",
                    value: u32::from(other),
                });
            }
        };
        let recipient = match request_type & 0x1F {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            other => {
                return Err(ProtocolError::InvalidField {
                    field: "bmRequestType.recipient",
                    value: u32::from(other),
                });
            }
        };

        Ok(Self {
            direction,
            kind,
            recipient,
            request: bytes[1],
            value: LittleEndian::read_u16(&bytes[2..4]),
            index: LittleEndian::read_u16(&bytes[4..6]),
            length: LittleEndian::read_u16(&bytes[6..8]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_descriptor_encoding() {
        // GET_DESCRIPTOR(DEVICE), 18 bytes
        let setup = ControlSetup {
            direction: PipeDirection::In,
            kind: RequestKind::Standard,
            recipient: Recipient::Device,
            request: 0x06,
            value: 0x0100,
            index: 0,
            length: 18,
        };
        assert_eq!(setup.request_type(), 0x80);
        assert_eq!(
            setup.to_bytes(),
            [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]
        );
    }

    #[test]
    fn test_class_interface_request_type() {
        let setup = ControlSetup {
            direction: PipeDirection::Out,
            kind: RequestKind::Class,
            recipient: Recipient::Interface,
            request: 0x0A,
            value: 0,
            index: 2,
            length: 0,
        };
        assert_eq!(setup.request_type(), 0x21);
        assert_eq!(ControlSetup::parse(&setup.to_bytes()).unwrap(), setup);
    }

    #[test]
    fn test_parse_rejects_short_and_reserved() {
        assert!(matches!(
            ControlSetup::parse(&[0x80, 0x06]),
            Err(ProtocolError::BufferTooSmall { needed: 8, available: 2 })
        ));
        // type bits 0b11 are reserved
        assert!(matches!(
            ControlSetup::parse(&[0x60, 0, 0, 0, 0, 0, 0, 0]),
            Err(ProtocolError::InvalidField { .. })
        ));
    }
}
