//! Audio DMA ring buffer core
//!
//! One [`StreamTransferController`] per stream direction owns a
//! [`CircularStreamBuffer`] placed in DMA-reachable memory and moves PCM data
//! between the CPU and the engine's hardware read/write pointers. Hardware
//! access goes through two capabilities supplied by the platform:
//! [`PhysicalBufferAllocator`] and [`RegisterPort`].
//!
//! # Example
//!
//! ```
//! use audio::test_utils::SimulatedHardware;
//! use audio::{FlowStatus, HwParams, StreamDirection};
//!
//! let hw = SimulatedHardware::new();
//! let render = hw.controller(StreamDirection::Render);
//! render.set_hw_params(HwParams::default_for(StreamDirection::Render)).unwrap();
//! render.prepare().unwrap();
//! render.start().unwrap();
//!
//! let outcome = render.write(&[0u8; 256]).unwrap();
//! assert_eq!(outcome.status, FlowStatus::Normal);
//! assert_eq!(outcome.frames, 64);
//! ```

pub mod config;
pub mod controller;
pub mod dma;
pub mod mmap;
pub mod offset;
pub mod params;
pub mod register;
pub mod ring;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{AudioConfig, load_config};
pub use controller::{StreamPhase, StreamPosition, StreamTransferController, TransferOutcome};
pub use dma::{
    DMA_ALIGNMENT, DmaMemory, DmaRegion, HeapAllocator, PhysicalBufferAllocator,
    ReservedRegionAllocator,
};
pub use mmap::{MmapWriteReport, RetryPolicy};
pub use offset::BoundedOffset;
pub use params::{HwParams, SAFETY_MARGIN};
pub use register::{EngineId, PointerKind, RegisterPort, StreamDirection};
pub use ring::{CircularStreamBuffer, FlowStatus};
