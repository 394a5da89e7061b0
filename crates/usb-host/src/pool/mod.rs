//! Object pool: device pools, interfaces, pipes and the session owning them

mod interface;
mod interface_pool;
mod pipe;
mod session;

pub use interface::{InterfaceStatus, UsbInterface};
pub use interface_pool::{FoundInterface, InterfaceKey, InterfacePool};
pub use pipe::{CONTROL_PIPE_ID, PipeInfo};
pub use session::{ClaimedInterface, InterfaceHandle, PoolKey, UsbSession};
