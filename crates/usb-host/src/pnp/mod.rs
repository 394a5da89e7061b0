//! Plug-and-play matching and driver loading

mod loader;
mod matcher;
mod rule;

pub use loader::{
    ChannelRegistrar, DeviceListEntry, DeviceRegistrar, DeviceStatus, PnpLoader, spawn_loader,
};
pub use matcher::PnpMatcher;
pub use rule::{InterfaceList, MatchFlags, MatchRule};
