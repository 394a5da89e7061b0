//! Register port capability
//!
//! Everything the controller does to the audio DMA engine goes through
//! [`RegisterPort`]. Platform code implements it over MMIO; tests use
//! `test_utils::SimulatedRegisterPort`.

use common::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamDirection {
    /// CPU produces, DMA engine drains
    Render,
    /// DMA engine produces, CPU drains
    Capture,
}

impl fmt::Display for StreamDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamDirection::Render => write!(f, "render"),
            StreamDirection::Capture => write!(f, "capture"),
        }
    }
}

/// Identifies one DMA engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineId {
    pub direction: StreamDirection,
    pub channel: u32,
}

impl EngineId {
    pub fn new(direction: StreamDirection, channel: u32) -> Self {
        Self { direction, channel }
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.direction, self.channel)
    }
}

/// Which hardware pointer a register access targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerKind {
    Read,
    Write,
}

/// Hardware register access for one or more DMA engines
///
/// Failures are reported as `Error::HardwareFailure`. The controller never
/// retries a failed register call.
pub trait RegisterPort: Send + Sync {
    fn read_pointer(&self, engine: EngineId, kind: PointerKind) -> Result<u32>;

    fn write_pointer(&self, engine: EngineId, kind: PointerKind, value: u32) -> Result<()>;

    fn set_buffer_addr(&self, engine: EngineId, phys_addr: u64) -> Result<()>;

    fn set_buffer_size(&self, engine: EngineId, size: u32) -> Result<()>;

    fn set_transfer_size(&self, engine: EngineId, size: u32) -> Result<()>;

    fn set_engine_running(&self, engine: EngineId, running: bool) -> Result<()>;
}
