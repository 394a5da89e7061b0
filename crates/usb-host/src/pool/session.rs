//! USB host session
//!
//! A [`UsbSession`] owns the list of opened device pools. Interface claims
//! keep a pool alive: the first claim on a device opens it and parses its
//! descriptors, the last release destroys the pool and closes the device.

use crate::config::SessionSettings;
use crate::ids::{IdAllocator, ObjectKind};
use crate::io::{Completion, RequestParams, UsbRequest};
use crate::pool::interface::{InterfaceStatus, UsbInterface};
use crate::pool::interface_pool::{InterfaceKey, InterfacePool};
use crate::pool::pipe::PipeInfo;
use crate::transport::RawTransport;
use async_channel::Sender;
use common::{Error, LoaderCommand, Result};
use protocol::{DeviceAddress, PnpCommand, PnpDeviceInfo, PnpEvent, RemoveScope};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How to look a pool up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKey {
    Address(DeviceAddress),
    Id(u32),
}

impl PoolKey {
    fn matches(&self, pool: &InterfacePool) -> bool {
        match *self {
            PoolKey::Address(address) => pool.address() == address,
            PoolKey::Id(id) => pool.object_id() == id,
        }
    }
}

/// A claimed interface, returned by [`UsbSession::claim_interface`]
#[derive(Debug)]
pub struct ClaimedInterface {
    pool: Arc<InterfacePool>,
    interface: Arc<UsbInterface>,
    first_claim: bool,
    released: AtomicBool,
}

impl ClaimedInterface {
    pub fn address(&self) -> DeviceAddress {
        self.pool.address()
    }

    pub fn pool_id(&self) -> u32 {
        self.pool.object_id()
    }

    pub fn number(&self) -> u8 {
        self.interface.number()
    }

    pub fn interface(&self) -> &Arc<UsbInterface> {
        &self.interface
    }

    /// True when this claim performed the hardware claim
    pub fn first_claim(&self) -> bool {
        self.first_claim
    }
}

/// An opened interface; requests are allocated and filled through it
#[derive(Debug)]
pub struct InterfaceHandle {
    pool: Arc<InterfacePool>,
    interface: Arc<UsbInterface>,
}

impl InterfaceHandle {
    pub fn address(&self) -> DeviceAddress {
        self.pool.address()
    }

    pub fn number(&self) -> u8 {
        self.interface.number()
    }

    pub fn pool(&self) -> &Arc<InterfacePool> {
        &self.pool
    }
}

pub struct UsbSession {
    transport: Arc<dyn RawTransport>,
    ids: Arc<IdAllocator>,
    pools: Mutex<Vec<Arc<InterfacePool>>>,
    /// Serializes opening and closing of one device without holding `pools`
    device_locks: Mutex<HashMap<DeviceAddress, Arc<Mutex<()>>>>,
    /// Where interface add/remove events go
    notifier: Option<Sender<LoaderCommand>>,
    io_queue_depth: usize,
    sync_timeout: Option<Duration>,
}

impl std::fmt::Debug for UsbSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbSession")
            .field("pools", &self.pool_count())
            .field("io_queue_depth", &self.io_queue_depth)
            .finish()
    }
}

impl UsbSession {
    pub fn new(transport: Arc<dyn RawTransport>, settings: &SessionSettings) -> Self {
        Self {
            transport,
            ids: Arc::new(IdAllocator::new(settings.id_ceiling)),
            pools: Mutex::new(Vec::new()),
            device_locks: Mutex::new(HashMap::new()),
            notifier: None,
            io_queue_depth: settings.io_queue_depth,
            sync_timeout: settings.sync_timeout(),
        }
    }

    /// Route interface add/remove events to a PnP loader
    pub fn with_notifier(mut self, notifier: Sender<LoaderCommand>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    fn lock_pools(&self) -> MutexGuard<'_, Vec<Arc<InterfacePool>>> {
        self.pools.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn pool_count(&self) -> usize {
        self.lock_pools().len()
    }

    /// Snapshot of the opened pools
    pub fn pools(&self) -> Vec<Arc<InterfacePool>> {
        self.lock_pools().clone()
    }

    fn device_lock(&self, address: DeviceAddress) -> Arc<Mutex<()>> {
        self.device_locks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(address)
            .or_default()
            .clone()
    }

    fn new_pool(&self, address: DeviceAddress) -> Arc<InterfacePool> {
        Arc::new(InterfacePool::new(
            self.ids.next(ObjectKind::Pool),
            address,
            self.transport.clone(),
            self.ids.clone(),
            self.io_queue_depth,
        ))
    }

    /// Register an empty pool for `address`
    pub fn create_pool(&self, address: DeviceAddress) -> Arc<InterfacePool> {
        let pool = self.new_pool(address);
        self.lock_pools().push(pool.clone());
        debug!("Created pool {} for device {}", pool.object_id(), address);
        pool
    }

    fn find_pool_locked(
        pools: &[Arc<InterfacePool>],
        key: PoolKey,
        bump_ref: bool,
    ) -> Result<Arc<InterfacePool>> {
        let pool = pools
            .iter()
            .find(|pool| key.matches(pool))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("pool {:?}", key)))?;
        if bump_ref {
            pool.acquire();
        }
        Ok(pool)
    }

    /// Look a pool up, optionally taking a reference in the same critical section
    pub fn find_pool(&self, key: PoolKey, bump_ref: bool) -> Result<Arc<InterfacePool>> {
        let pools = self.lock_pools();
        Self::find_pool_locked(&pools, key, bump_ref)
    }

    fn destroy_pool_locked(
        pools: &mut Vec<Arc<InterfacePool>>,
        pool: &Arc<InterfacePool>,
    ) -> Result<Option<crate::io::IoQueues>> {
        if pool.ref_count() > 0 {
            return Err(Error::InvariantViolation(format!(
                "pool {} destroyed with {} claim(s)",
                pool.object_id(),
                pool.ref_count()
            )));
        }
        let pos = pools
            .iter()
            .position(|p| Arc::ptr_eq(p, pool))
            .ok_or_else(|| Error::NotFound(format!("pool {}", pool.object_id())))?;
        pools.remove(pos);
        pool.destroy_interface(None)?;
        debug!("Destroyed pool {} for device {}", pool.object_id(), pool.address());
        Ok(pool.take_io())
    }

    /// Remove an unreferenced pool and everything it owns
    pub fn destroy_pool(&self, pool: &Arc<InterfacePool>) -> Result<()> {
        let queues = {
            let mut pools = self.lock_pools();
            Self::destroy_pool_locked(&mut pools, pool)?
        };
        if let Some(queues) = queues {
            queues.stop();
        }
        Ok(())
    }

    /// Drop a pool reference; the last one destroys the pool and closes the device
    pub fn destroy_device(&self, pool: &Arc<InterfacePool>, decrement: bool) -> Result<()> {
        let queues = {
            let mut pools = self.lock_pools();
            if decrement {
                pool.release();
            }
            if pool.ref_count() > 0 {
                return Ok(());
            }
            Self::destroy_pool_locked(&mut pools, pool)?
        };
        if let Some(queues) = queues {
            queues.stop();
        }

        pool.detach_device();

        let device_lock = self.device_lock(pool.address());
        let _device = device_lock.lock().unwrap_or_else(|p| p.into_inner());
        if self.find_pool(PoolKey::Address(pool.address()), false).is_ok() {
            debug!("Device {} reopened; leaving it open", pool.address());
            return Ok(());
        }
        self.transport.close_device(pool.address()).map_err(|e| {
            error!("Failed to close device {}: {}", pool.address(), e);
            e
        })?;
        info!("Closed device {}", pool.address());
        Ok(())
    }

    /// Find the pool for `address` or open the device and build one
    ///
    /// Returns the pool with a reference taken. A pool whose descriptors
    /// could not be read comes back without a device. The device is opened
    /// and read under its own device lock, so lookups of other devices do
    /// not wait on it.
    fn acquire_pool(&self, address: DeviceAddress) -> Result<Arc<InterfacePool>> {
        let key = PoolKey::Address(address);
        if let Ok(pool) = self.find_pool(key, true) {
            return Ok(pool);
        }

        let device_lock = self.device_lock(address);
        let _device = device_lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Ok(pool) = self.find_pool(key, true) {
            return Ok(pool);
        }

        self.transport.open_device(address)?;
        let pool = self.new_pool(address);
        let descriptors = self
            .transport
            .device_descriptor(address)
            .and_then(|device| Ok((device, self.transport.config_descriptor(address)?)));
        match descriptors {
            Ok((device, config)) => {
                pool.populate(&config);
                pool.attach_device(device);
            }
            Err(e) => error!("Failed to read descriptors of {}: {}", address, e),
        }
        pool.acquire();

        let mut pools = self.lock_pools();
        // create_pool does not take the device lock
        if let Ok(existing) = Self::find_pool_locked(&pools, key, true) {
            debug!(
                "Pool {} for {} registered while opening; dropping pool {}",
                existing.object_id(),
                address,
                pool.object_id()
            );
            return Ok(existing);
        }
        pools.push(pool.clone());
        debug!("Created pool {} for device {}", pool.object_id(), address);
        Ok(pool)
    }

    /// Claim interface `index` on device `address`
    ///
    /// The hardware claim runs only for the first claimant of a regular
    /// interface. Any failure drops the pool reference taken here.
    pub fn claim_interface(&self, address: DeviceAddress, index: u8) -> Result<ClaimedInterface> {
        let pool = self.acquire_pool(address)?;
        if !pool.has_device() {
            warn!("Pool {} for {} has no device", pool.object_id(), address);
            if let Err(e) = self.destroy_device(&pool, true) {
                error!("Teardown of {} failed: {}", address, e);
            }
            return Err(Error::NoDevice);
        }

        let claimed = pool
            .find_interface(InterfaceKey::Index(index), false, false)
            .and_then(|found| {
                let first_claim = found
                    .interface
                    .claim_with(|| self.transport.claim_interface(address, index))?;
                Ok((found.interface, first_claim))
            });

        match claimed {
            Ok((interface, first_claim)) => {
                debug!(
                    "Claimed interface {} on {} (ref {})",
                    index,
                    address,
                    interface.ref_count()
                );
                Ok(ClaimedInterface {
                    pool,
                    interface,
                    first_claim,
                    released: AtomicBool::new(false),
                })
            }
            Err(e) => {
                error!("Failed to claim interface {} on {}: {}", index, address, e);
                if let Err(teardown) = self.destroy_device(&pool, true) {
                    error!("Teardown of {} failed: {}", address, teardown);
                }
                Err(e)
            }
        }
    }

    /// Release a claim
    ///
    /// The last claim of a regular interface releases it in hardware; the
    /// pool reference goes in any case. A disconnected device counts as
    /// released.
    pub fn release_interface(&self, claimed: &ClaimedInterface) -> Result<()> {
        if claimed.released.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidParameter(format!(
                "interface {} on {} already released",
                claimed.number(),
                claimed.address()
            )));
        }

        let pool = &claimed.pool;
        let iface = &claimed.interface;
        let released = iface.release_with(|| {
            match self.transport.release_interface(pool.address(), iface.number()) {
                Ok(()) | Err(Error::NoDevice) => Ok(()),
                Err(e) => Err(e),
            }
        });
        if let Err(e) = released {
            error!(
                "Failed to release interface {} on {}: {}",
                iface.number(),
                pool.address(),
                e
            );
            claimed.released.store(false, Ordering::Release);
            return Err(e);
        }

        debug!("Released interface {} on {}", iface.number(), pool.address());
        self.destroy_device(pool, true)
    }

    /// Mark a claimed interface added or removed and tell the PnP loader
    pub fn add_or_remove_interface(
        &self,
        status: InterfaceStatus,
        claimed: &ClaimedInterface,
    ) -> Result<()> {
        let iface = &claimed.interface;
        if iface.status() == status {
            return Err(Error::InvalidParameter(format!(
                "interface {} already {:?}",
                iface.number(),
                status
            )));
        }

        let (command, remove_scope) = match status {
            InterfaceStatus::Normal => (PnpCommand::AddInterface, RemoveScope::Device),
            InterfaceStatus::Removed => (
                PnpCommand::RemoveInterface,
                RemoveScope::Interface(iface.number()),
            ),
        };
        let event = PnpEvent {
            command,
            info: PnpDeviceInfo {
                address: claimed.address(),
                device: claimed.pool.device_descriptor().unwrap_or_default(),
                interfaces: vec![iface.summary()],
            },
            remove_scope,
        };

        let notifier = self
            .notifier
            .as_ref()
            .ok_or_else(|| Error::Channel("no PnP notifier attached".to_string()))?;
        notifier
            .send_blocking(LoaderCommand::Event(event))
            .map_err(|e| Error::Channel(e.to_string()))?;

        iface.set_status(status);
        info!(
            "{:?} interface {} on {}",
            command,
            iface.number(),
            claimed.address()
        );
        Ok(())
    }

    /// Open a claimed interface for IO
    pub fn open_interface(&self, claimed: &ClaimedInterface) -> Result<InterfaceHandle> {
        let iface = &claimed.interface;
        if iface.status() == InterfaceStatus::Removed {
            return Err(Error::NotFound(format!(
                "interface {} on {} removed",
                iface.number(),
                claimed.address()
            )));
        }
        if !claimed.pool.has_device() {
            return Err(Error::NoDevice);
        }

        {
            let _list = claimed.pool.lock_interfaces();
            claimed.pool.open_io()?;
            iface.acquire();
        }
        debug!("Opened interface {} on {}", iface.number(), claimed.address());
        Ok(InterfaceHandle {
            pool: claimed.pool.clone(),
            interface: iface.clone(),
        })
    }

    /// Close a handle; the last close stops the IO workers
    pub fn close_interface(&self, handle: InterfaceHandle) -> Result<()> {
        let queues = {
            let _list = handle.pool.lock_interfaces();
            handle.interface.release();
            handle.pool.close_io()
        };
        if let Some(queues) = queues {
            queues.stop();
            debug!("IO stopped for device {}", handle.address());
        }
        Ok(())
    }

    /// Select an alternate setting; returns the now-current interface entry
    pub fn select_interface_setting(
        &self,
        handle: &InterfaceHandle,
        alt_setting: u8,
    ) -> Result<Arc<UsbInterface>> {
        let number = handle.interface.number();
        self.transport
            .set_alt_setting(handle.address(), number, alt_setting)?;

        let list = handle.pool.lock_interfaces();
        for iface in list.iter().filter(|iface| iface.number() == number) {
            iface.set_current_alt_setting(alt_setting);
        }
        let found =
            InterfacePool::find_interface_locked(&list, InterfaceKey::Index(number), false, true)?;
        debug!(
            "Interface {} on {} now at alt setting {}",
            number,
            handle.address(),
            alt_setting
        );
        Ok(found.interface)
    }

    pub fn get_pipe_info(
        &self,
        handle: &InterfaceHandle,
        alt_setting: u8,
        pipe_id: u8,
    ) -> Result<PipeInfo> {
        let found = handle.pool.find_interface(
            InterfaceKey::AltSetting {
                index: handle.interface.number(),
                alt: alt_setting,
            },
            false,
            true,
        )?;
        found.interface.find_pipe(pipe_id).ok_or_else(|| {
            Error::NotFound(format!(
                "pipe {} of interface {} alt {}",
                pipe_id,
                handle.interface.number(),
                alt_setting
            ))
        })
    }

    /// Clear a halt condition on `pipe_address` (endpoint address with direction bit)
    pub fn clear_interface_halt(&self, handle: &InterfaceHandle, pipe_address: u8) -> Result<()> {
        self.transport.clear_halt(handle.address(), pipe_address)
    }

    pub fn alloc_request(
        &self,
        handle: &InterfaceHandle,
        iso_packets: usize,
        length: usize,
    ) -> Result<UsbRequest> {
        let request = UsbRequest::new(
            self.ids.next(ObjectKind::Request),
            handle.pool.clone(),
            iso_packets,
            length,
        );
        debug!(
            "Allocated request {} ({} bytes) on {}",
            request.id(),
            length,
            handle.address()
        );
        Ok(request)
    }

    /// Bind `request` to a pipe of the opened device and stage its transfer
    pub fn fill_request(
        &self,
        request: &UsbRequest,
        handle: &InterfaceHandle,
        params: RequestParams,
    ) -> Result<()> {
        let found = handle.pool.find_interface(
            InterfaceKey::Index(params.interface_number),
            false,
            true,
        )?;
        let pipe = found.interface.find_pipe(params.pipe_id).ok_or_else(|| {
            Error::NotFound(format!(
                "pipe {} of interface {}",
                params.pipe_id, params.interface_number
            ))
        })?;
        request.fill(pipe.pipe_type, pipe.direction, pipe.endpoint_address(), params)
    }

    /// Submit and wait, bounded by the session's sync timeout
    pub fn submit_request_sync(&self, request: &UsbRequest) -> Result<Completion> {
        request.submit_sync(self.sync_timeout)
    }
}
