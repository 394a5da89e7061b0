//! Message serialization and deserialization using postcard
//!
//! PnP events and driver bindings travel as postcard-encoded [`Message`]
//! envelopes. Every decode validates the envelope version before the payload
//! is handed to the caller.

use crate::{
    CURRENT_VERSION, DriverBinding, Message, MessagePayload, PnpEvent, ProtocolVersion,
    error::ProtocolError, error::Result,
};

/// Maximum encoded payload size (64 KiB)
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Encode a message to bytes using postcard
///
/// # Example
/// ```
/// use protocol::{CURRENT_VERSION, DeviceAddress, DriverBinding, Message, MessagePayload, encode_message};
///
/// let msg = Message {
///     version: CURRENT_VERSION,
///     payload: MessagePayload::Register(DriverBinding {
///         module_name: "usb_ecm".into(),
///         service_name: "ecm_service".into(),
///         match_attr: "ecm_attr".into(),
///         address: DeviceAddress::new(1, 2),
///         interface_numbers: vec![0, 1],
///     }),
/// };
/// let bytes = encode_message(&msg).unwrap();
/// assert!(!bytes.is_empty());
/// ```
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    let bytes = postcard::to_allocvec(message)?;
    if bytes.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: bytes.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(bytes)
}

/// Decode a message from bytes and validate its version
pub fn decode_message(bytes: &[u8]) -> Result<Message> {
    if bytes.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: bytes.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }
    let message: Message = postcard::from_bytes(bytes)?;
    validate_version(&message.version)?;
    Ok(message)
}

/// Validate protocol version compatibility
///
/// Compatible if major versions match. Minor version differences are allowed.
pub fn validate_version(message_version: &ProtocolVersion) -> Result<()> {
    if message_version.major != CURRENT_VERSION.major {
        return Err(ProtocolError::IncompatibleVersion {
            major: message_version.major,
            minor: message_version.minor,
            expected_major: CURRENT_VERSION.major,
            expected_minor: CURRENT_VERSION.minor,
        });
    }
    Ok(())
}

/// Encode a PnP event in a current-version envelope
pub fn encode_event(event: &PnpEvent) -> Result<Vec<u8>> {
    encode_message(&Message {
        version: CURRENT_VERSION,
        payload: MessagePayload::Event(event.clone()),
    })
}

/// Decode a PnP event payload
///
/// Fails with [`ProtocolError::InvalidMessageType`] if the envelope carries
/// anything other than an event.
pub fn decode_event(bytes: &[u8]) -> Result<PnpEvent> {
    match decode_message(bytes)?.payload {
        MessagePayload::Event(event) => Ok(event),
        _ => Err(ProtocolError::InvalidMessageType { expected: "event" }),
    }
}

/// Encode a register (`register == true`) or unregister request
pub fn encode_binding(binding: &DriverBinding, register: bool) -> Result<Vec<u8>> {
    let payload = if register {
        MessagePayload::Register(binding.clone())
    } else {
        MessagePayload::Unregister(binding.clone())
    };
    encode_message(&Message {
        version: CURRENT_VERSION,
        payload,
    })
}
