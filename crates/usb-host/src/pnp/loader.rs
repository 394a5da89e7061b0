//! PnP loader
//!
//! Turns add/remove events into driver registrations. The loader keeps a
//! table of bound drivers per device so a device that is reported twice is
//! not bound twice, and a removal unbinds exactly what was bound.

use crate::pnp::matcher::PnpMatcher;
use async_channel::Sender;
use common::channel::send_request_blocking;
use common::{DriverRequest, Error, LoaderCommand, PnpWorker, Result};
use protocol::{DeviceAddress, DriverBinding, PnpCommand, PnpDeviceInfo, PnpEvent, RemoveScope};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Binds and unbinds drivers on behalf of the loader
pub trait DeviceRegistrar: Send + Sync {
    fn register(&self, binding: &DriverBinding) -> Result<()>;

    fn unregister(&self, binding: &DriverBinding) -> Result<()>;
}

/// Registrar forwarding every request over the PnP bridge
///
/// Each call blocks until the driver host answers.
#[derive(Clone)]
pub struct ChannelRegistrar {
    request_tx: Sender<DriverRequest>,
}

impl ChannelRegistrar {
    pub fn new(request_tx: Sender<DriverRequest>) -> Self {
        Self { request_tx }
    }
}

impl DeviceRegistrar for ChannelRegistrar {
    fn register(&self, binding: &DriverBinding) -> Result<()> {
        send_request_blocking(&self.request_tx, true, binding.clone())
    }

    fn unregister(&self, binding: &DriverBinding) -> Result<()> {
        send_request_blocking(&self.request_tx, false, binding.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Added,
    Removed,
}

/// One bound driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceListEntry {
    pub binding: DriverBinding,
    pub status: DeviceStatus,
}

impl DeviceListEntry {
    fn same_driver(&self, binding: &DriverBinding) -> bool {
        self.binding.module_name == binding.module_name
            && self.binding.service_name == binding.service_name
            && self.binding.match_attr == binding.match_attr
            && self.binding.address == binding.address
    }
}

pub struct PnpLoader {
    matcher: PnpMatcher,
    registrar: Arc<dyn DeviceRegistrar>,
    devices: Vec<DeviceListEntry>,
}

impl PnpLoader {
    pub fn new(matcher: PnpMatcher, registrar: Arc<dyn DeviceRegistrar>) -> Self {
        Self {
            matcher,
            registrar,
            devices: Vec::new(),
        }
    }

    pub fn devices(&self) -> &[DeviceListEntry] {
        &self.devices
    }

    pub fn matcher(&self) -> &PnpMatcher {
        &self.matcher
    }

    /// Apply one event
    pub fn handle_event(&mut self, event: &PnpEvent) -> Result<()> {
        debug!("PnP {:?} for {}", event.command, event.info.address);
        if event.command.is_add() {
            self.add_device(event.command, &event.info);
            Ok(())
        } else {
            self.remove_device(event.command, event.info.address, event.remove_scope)
        }
    }

    /// Decode a postcard payload and apply it
    pub fn event_received(&mut self, payload: &[u8]) -> Result<()> {
        let event = protocol::decode_event(payload)?;
        self.handle_event(&event)
    }

    /// Match the device and bind every hit
    ///
    /// A failed binding is logged and the remaining hits still bind.
    fn add_device(&mut self, command: PnpCommand, info: &PnpDeviceInfo) {
        for binding in self.matcher.match_device(info) {
            let existing = self.devices.iter().position(|e| e.same_driver(&binding));
            if let Some(pos) = existing {
                if self.devices[pos].status != DeviceStatus::Removed {
                    debug!(
                        "{} already bound to {}",
                        binding.module_name, binding.address
                    );
                    continue;
                }
            }

            if let Err(e) = self.registrar.register(&binding) {
                error!(
                    "Failed to bind {}/{} to {}: {}",
                    binding.module_name, binding.service_name, binding.address, e
                );
                continue;
            }

            if command == PnpCommand::AddInterface {
                match existing {
                    Some(pos) => self.devices[pos].status = DeviceStatus::Added,
                    None => error!(
                        "Interface added on {} without a device entry for {}",
                        binding.address, binding.module_name
                    ),
                }
            } else {
                info!(
                    "Bound {}/{} to {} (interfaces {:?})",
                    binding.module_name,
                    binding.service_name,
                    binding.address,
                    binding.interface_numbers
                );
                self.devices.push(DeviceListEntry {
                    binding,
                    status: DeviceStatus::Added,
                });
            }
        }
    }

    /// Unbind the drivers of a device, or of one of its interfaces
    fn remove_device(
        &mut self,
        command: PnpCommand,
        address: DeviceAddress,
        scope: RemoveScope,
    ) -> Result<()> {
        let interface = match (command, scope) {
            (PnpCommand::RemoveInterface, RemoveScope::Interface(n)) => Some(n),
            _ => None,
        };

        let mut found = false;
        let mut i = 0;
        while i < self.devices.len() {
            let entry = &self.devices[i];
            let in_scope = entry.binding.address == address
                && interface.is_none_or(|n| entry.binding.interface_numbers.contains(&n));
            if !in_scope {
                i += 1;
                continue;
            }
            found = true;

            if entry.status != DeviceStatus::Removed {
                self.registrar.unregister(&entry.binding).map_err(|e| {
                    error!(
                        "Failed to unbind {} from {}: {}",
                        entry.binding.module_name, address, e
                    );
                    e
                })?;
                self.devices[i].status = DeviceStatus::Removed;
                info!("Unbound {} from {}", self.devices[i].binding.module_name, address);
            }

            if command == PnpCommand::RemoveInterface {
                i += 1;
            } else {
                self.devices.remove(i);
            }
        }

        if !found {
            warn!("No driver bound to {} for {:?}", address, command);
            return Err(Error::NotFound(format!("driver entry for {}", address)));
        }
        Ok(())
    }

    /// Serve loader commands until shutdown or until the bridge closes
    pub fn run(mut self, worker: PnpWorker) {
        info!("PnP loader started with {} rule(s)", self.matcher.rules().len());
        loop {
            match worker.recv_command() {
                Ok(LoaderCommand::Event(event)) => {
                    if let Err(e) = self.handle_event(&event) {
                        warn!("PnP {:?} for {} failed: {}", event.command, event.info.address, e);
                    }
                }
                Ok(LoaderCommand::Shutdown) => {
                    info!("PnP loader shutting down");
                    break;
                }
                Err(e) => {
                    debug!("PnP bridge closed: {}", e);
                    break;
                }
            }
        }
    }
}

/// Run `loader` on a dedicated thread
pub fn spawn_loader(loader: PnpLoader, worker: PnpWorker) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("pnp-loader".to_string())
        .spawn(move || loader.run(worker))?;
    Ok(handle)
}
