//! Common utilities for the audio DMA and USB host cores
//!
//! This crate provides what both cores share: the error taxonomy, tracing
//! setup, transfer metrics, and the async channel bridge that carries PnP
//! events into the loader thread and driver registrations out to the driver
//! host.

pub mod channel;
pub mod error;
pub mod logging;
pub mod metrics;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use channel::{DriverRequest, LoaderCommand, PnpBridge, PnpWorker, create_pnp_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use metrics::{IoMetrics, IoMetricsSnapshot, StreamMetrics, StreamMetricsSnapshot};
