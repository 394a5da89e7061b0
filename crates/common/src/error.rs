//! Common error types

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Null or out-of-range input; the caller's bug, never retried
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Offset {offset} out of range for capacity {capacity}")]
    OutOfRange { offset: usize, capacity: usize },

    /// Allocation of a buffer or pool object failed
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Register port or transport call failed
    #[error("Hardware failure: {0}")]
    HardwareFailure(String),

    #[error("Device disconnected")]
    NoDevice,

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_display() {
        let err = Error::OutOfRange {
            offset: 16384,
            capacity: 16384,
        };
        assert_eq!(err.to_string(), "Offset 16384 out of range for capacity 16384");
    }

    #[test]
    fn test_protocol_error_conversion() {
        let err: Error = protocol::ProtocolError::InvalidMessageType { expected: "event" }.into();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.to_string().contains("expected event"));
    }
}
