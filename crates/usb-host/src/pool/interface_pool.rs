//! Per-device interface pool
//!
//! Lock order is session list, then this pool's interface list, then an
//! interface's pipe list. The IO queue lock is only taken with the interface
//! list held or on its own.

use crate::ids::{IdAllocator, ObjectKind};
use crate::io::{IoQueues, RequestInner};
use crate::pool::interface::{InterfaceStatus, UsbInterface};
use crate::pool::pipe::PipeInfo;
use crate::transport::RawTransport;
use common::{Error, IoMetrics, IoMetricsSnapshot, Result};
use protocol::{
    ConfigDescriptor, DeviceAddress, DeviceDescriptor, InterfaceDescriptor, USB_CTRL_INTERFACE_ID,
};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// How to look an interface up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceKey {
    /// The entry of `index` whose alt setting is the currently selected one
    Index(u8),
    /// Exact (index, alt setting) entry
    AltSetting { index: u8, alt: u8 },
}

impl InterfaceKey {
    fn matches(&self, iface: &UsbInterface) -> bool {
        match *self {
            InterfaceKey::Index(index) => {
                iface.number() == index && iface.current_alt_setting() == iface.alt_setting()
            }
            InterfaceKey::AltSetting { index, alt } => {
                iface.number() == index && iface.alt_setting() == alt
            }
        }
    }

    fn index(&self) -> u8 {
        match *self {
            InterfaceKey::Index(index) | InterfaceKey::AltSetting { index, .. } => index,
        }
    }
}

/// Result of a lookup
#[derive(Debug, Clone)]
pub struct FoundInterface {
    pub interface: Arc<UsbInterface>,
    /// True when the lookup took the first reference on a regular interface
    pub first_claim: bool,
}

/// All interfaces of one opened device
pub struct InterfacePool {
    object_id: u32,
    address: DeviceAddress,
    transport: Arc<dyn RawTransport>,
    ids: Arc<IdAllocator>,
    /// Set once the descriptors have been parsed
    device: Mutex<Option<DeviceDescriptor>>,
    ref_count: AtomicI32,
    io_ref_count: AtomicI32,
    interfaces: Mutex<Vec<Arc<UsbInterface>>>,
    io: Mutex<Option<IoQueues>>,
    io_queue_depth: usize,
    metrics: Arc<IoMetrics>,
}

impl std::fmt::Debug for InterfacePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfacePool")
            .field("object_id", &self.object_id)
            .field("address", &self.address)
            .field("ref_count", &self.ref_count())
            .field("io_ref_count", &self.io_ref_count())
            .finish()
    }
}

impl InterfacePool {
    pub(crate) fn new(
        object_id: u32,
        address: DeviceAddress,
        transport: Arc<dyn RawTransport>,
        ids: Arc<IdAllocator>,
        io_queue_depth: usize,
    ) -> Self {
        Self {
            object_id,
            address,
            transport,
            ids,
            device: Mutex::new(None),
            ref_count: AtomicI32::new(0),
            io_ref_count: AtomicI32::new(0),
            interfaces: Mutex::new(Vec::new()),
            io: Mutex::new(None),
            io_queue_depth,
            metrics: Arc::new(IoMetrics::new()),
        }
    }

    pub fn object_id(&self) -> u32 {
        self.object_id
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub(crate) fn acquire(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the count after the decrement
    pub(crate) fn release(&self) -> i32 {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn io_ref_count(&self) -> i32 {
        self.io_ref_count.load(Ordering::Acquire)
    }

    pub fn device_descriptor(&self) -> Option<DeviceDescriptor> {
        *self.device.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn has_device(&self) -> bool {
        self.device_descriptor().is_some()
    }

    pub(crate) fn attach_device(&self, descriptor: DeviceDescriptor) {
        *self.device.lock().unwrap_or_else(|p| p.into_inner()) = Some(descriptor);
    }

    pub(crate) fn detach_device(&self) -> Option<DeviceDescriptor> {
        self.device.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    pub(crate) fn transport(&self) -> &Arc<dyn RawTransport> {
        &self.transport
    }

    pub(crate) fn lock_interfaces(&self) -> MutexGuard<'_, Vec<Arc<UsbInterface>>> {
        self.interfaces.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Snapshot of the interface list in discovery order
    pub fn interfaces(&self) -> Vec<Arc<UsbInterface>> {
        self.lock_interfaces().clone()
    }

    pub fn metrics(&self) -> IoMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Append an interface for one (number, alt setting) descriptor
    pub(crate) fn create_interface(&self, desc: &InterfaceDescriptor) -> Arc<UsbInterface> {
        let iface = Arc::new(UsbInterface::new(
            self.ids.next(ObjectKind::Interface),
            self.object_id,
            desc,
        ));
        self.lock_interfaces().push(iface.clone());
        iface
    }

    /// Append a pipe to `iface`
    pub(crate) fn create_pipe(&self, iface: &UsbInterface, build: impl FnOnce(u32) -> PipeInfo) {
        iface.add_pipe(build(self.ids.next(ObjectKind::Pipe)));
    }

    /// Build the interface and pipe sets from the active configuration
    ///
    /// Regular pipes are numbered from 1 within each alt setting; the control
    /// interface carries the single control pipe 0.
    pub(crate) fn populate(&self, config: &ConfigDescriptor) {
        let ctrl = Arc::new(UsbInterface::control(
            self.ids.next(ObjectKind::Interface),
            self.object_id,
        ));
        self.create_pipe(&ctrl, |id| PipeInfo::control(id, USB_CTRL_INTERFACE_ID));
        self.lock_interfaces().push(ctrl);

        for desc in &config.interfaces {
            let iface = self.create_interface(desc);
            for (i, endpoint) in desc.endpoints.iter().enumerate() {
                let pipe_id = (i + 1) as u8;
                self.create_pipe(&iface, |id| {
                    PipeInfo::from_endpoint(id, desc.number, desc.alt_setting, pipe_id, endpoint)
                });
            }
        }

        debug!(
            "Pool {} for {}: {} interface entries",
            self.object_id,
            self.address,
            config.interfaces.len() + 1
        );
    }

    /// Look up an interface with the interface list already locked
    ///
    /// With `bump_ref` the reference is taken in the same critical section,
    /// so exactly one concurrent caller sees `first_claim`. The control
    /// interface is never counted.
    pub(crate) fn find_interface_locked(
        list: &[Arc<UsbInterface>],
        key: InterfaceKey,
        bump_ref: bool,
        status_check: bool,
    ) -> Result<FoundInterface> {
        let iface = list
            .iter()
            .find(|iface| key.matches(iface))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("interface {:?}", key)))?;

        if status_check && iface.status() == InterfaceStatus::Removed {
            return Err(Error::NotFound(format!("interface {} removed", key.index())));
        }

        let mut first_claim = false;
        if bump_ref && key.index() != USB_CTRL_INTERFACE_ID {
            first_claim = iface.acquire() == 0;
        }

        Ok(FoundInterface {
            interface: iface,
            first_claim,
        })
    }

    pub fn find_interface(
        &self,
        key: InterfaceKey,
        bump_ref: bool,
        status_check: bool,
    ) -> Result<FoundInterface> {
        let list = self.lock_interfaces();
        Self::find_interface_locked(&list, key, bump_ref, status_check)
    }

    /// Destroy one interface, or all of them when `target` is `None`
    ///
    /// An already empty list is a no-op; a missing specific target is
    /// `NotFound`.
    pub fn destroy_interface(&self, target: Option<&UsbInterface>) -> Result<()> {
        let mut list = self.lock_interfaces();
        if list.is_empty() {
            return Ok(());
        }

        match target {
            None => {
                for iface in list.drain(..) {
                    iface.destroy_all_pipes();
                }
                Ok(())
            }
            Some(target) => {
                let pos = list
                    .iter()
                    .position(|iface| iface.object_id() == target.object_id())
                    .ok_or_else(|| {
                        Error::NotFound(format!("interface object {}", target.object_id()))
                    })?;
                let iface = list.remove(pos);
                iface.destroy_all_pipes();
                Ok(())
            }
        }
    }

    /// Take an IO reference, starting the workers on the first one
    ///
    /// Caller holds the interface list lock.
    pub(crate) fn open_io(&self) -> Result<()> {
        let mut io = self.io.lock().unwrap_or_else(|p| p.into_inner());
        if io.is_none() {
            let queues = IoQueues::start(
                self.address,
                self.transport.clone(),
                self.io_queue_depth,
                self.metrics.clone(),
            )?;
            *io = Some(queues);
        }
        self.io_ref_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Drop an IO reference
    ///
    /// Returns the queues to stop once the last reference is gone. The caller
    /// stops them after releasing its locks, since completion callbacks may
    /// call back into the session.
    pub(crate) fn close_io(&self) -> Option<IoQueues> {
        let remaining = self.io_ref_count.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining > 0 {
            return None;
        }
        self.io.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    /// Detach the queues regardless of outstanding IO references
    pub(crate) fn take_io(&self) -> Option<IoQueues> {
        let queues = self.io.lock().unwrap_or_else(|p| p.into_inner()).take();
        if queues.is_some() {
            warn!(
                "Pool {} destroyed with {} open handle(s)",
                self.object_id,
                self.io_ref_count()
            );
        }
        self.io_ref_count.store(0, Ordering::Release);
        queues
    }

    /// Queue a request, waiting for room when the submit queue is full
    ///
    /// The wait happens outside the `io` lock so handles can still be opened
    /// and closed meanwhile; stopping the queues fails a waiting submit.
    pub(crate) fn submit(&self, request: Arc<RequestInner>) -> Result<()> {
        let sender = self
            .io
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(IoQueues::sender)
            .ok_or_else(|| {
                Error::InvalidParameter(format!("no open interface on device {}", self.address))
            })?;
        self.metrics.record_submit();
        sender
            .send_blocking(request)
            .map_err(|e| Error::Channel(e.to_string()))
    }

    pub(crate) fn cancel_transfer(&self, endpoint: u8) -> Result<()> {
        self.transport.cancel_transfer(self.address, endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockTransport;
    use common::test_utils::create_cdc_config;

    fn pool() -> InterfacePool {
        let pool = InterfacePool::new(
            1,
            DeviceAddress::new(1, 4),
            Arc::new(MockTransport::new()),
            Arc::new(IdAllocator::default()),
            8,
        );
        pool.populate(&create_cdc_config());
        pool
    }

    #[test]
    fn test_populate_layout() {
        let pool = pool();
        let list = pool.interfaces();
        // control + 3 descriptors
        assert_eq!(list.len(), 4);
        assert!(list[0].is_control());
        assert_eq!(list[0].pipes().len(), 1);

        let bulk = pool
            .find_interface(InterfaceKey::AltSetting { index: 1, alt: 1 }, false, true)
            .unwrap()
            .interface;
        let ids: Vec<u8> = bulk.pipes().iter().map(|p| p.pipe_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_index_lookup_follows_current_alt() {
        let pool = pool();
        let found = pool.find_interface(InterfaceKey::Index(1), false, true).unwrap();
        assert_eq!(found.interface.alt_setting(), 0);

        for iface in pool.interfaces().iter().filter(|i| i.number() == 1) {
            iface.set_current_alt_setting(1);
        }
        let found = pool.find_interface(InterfaceKey::Index(1), false, true).unwrap();
        assert_eq!(found.interface.alt_setting(), 1);
    }

    #[test]
    fn test_first_claim_reported_once() {
        let pool = pool();
        let a = pool.find_interface(InterfaceKey::Index(0), true, false).unwrap();
        let b = pool.find_interface(InterfaceKey::Index(0), true, false).unwrap();
        assert!(a.first_claim);
        assert!(!b.first_claim);
        assert_eq!(a.interface.ref_count(), 2);

        let ctrl = pool
            .find_interface(InterfaceKey::Index(USB_CTRL_INTERFACE_ID), true, false)
            .unwrap();
        assert!(!ctrl.first_claim);
        assert_eq!(ctrl.interface.ref_count(), 0);
    }

    #[test]
    fn test_status_check_hides_removed() {
        let pool = pool();
        let iface = pool.find_interface(InterfaceKey::Index(0), false, false).unwrap();
        iface.interface.set_status(InterfaceStatus::Removed);

        assert!(matches!(
            pool.find_interface(InterfaceKey::Index(0), false, true),
            Err(Error::NotFound(_))
        ));
        assert!(pool.find_interface(InterfaceKey::Index(0), false, false).is_ok());
    }

    #[test]
    fn test_destroy_interface() {
        let pool = pool();
        let iface = pool.find_interface(InterfaceKey::Index(0), false, false).unwrap();
        pool.destroy_interface(Some(&iface.interface)).unwrap();
        assert!(matches!(
            pool.destroy_interface(Some(&iface.interface)),
            Err(Error::NotFound(_))
        ));

        pool.destroy_interface(None).unwrap();
        assert!(pool.interfaces().is_empty());
        // empty list: no-op even for a specific target
        pool.destroy_interface(Some(&iface.interface)).unwrap();
    }
}
