//! Versioned envelopes for PnP traffic

use crate::{DriverBinding, PnpEvent, ProtocolVersion};
use serde::{Deserialize, Serialize};

/// Top-level message exchanged between the PnP notifier, the loader and the
/// driver host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub version: ProtocolVersion,
    pub payload: MessagePayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessagePayload {
    /// Device or interface arrived/left (notifier -> loader)
    Event(PnpEvent),
    /// Register a driver for a matched device (loader -> driver host)
    Register(DriverBinding),
    /// Unregister a previously registered driver (loader -> driver host)
    Unregister(DriverBinding),
}

impl MessagePayload {
    /// Short name used in logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            MessagePayload::Event(_) => "event",
            MessagePayload::Register(_) => "register",
            MessagePayload::Unregister(_) => "unregister",
        }
    }
}
