//! Interface entities
//!
//! One [`UsbInterface`] exists per (interface number, alternate setting) pair
//! of the active configuration, plus the reserved control interface. Its pipe
//! list is guarded by its own lock, the innermost of the three pool locks.

use crate::pool::pipe::PipeInfo;
use common::{Error, Result};
use protocol::{InterfaceDescriptor, InterfaceSummary, USB_CTRL_INTERFACE_ID};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};

/// Whether an interface is visible to drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceStatus {
    Normal,
    Removed,
}

#[derive(Debug)]
pub struct UsbInterface {
    object_id: u32,
    /// Id of the owning pool
    pool_id: u32,
    number: u8,
    alt_setting: u8,
    class: u8,
    subclass: u8,
    protocol: u8,
    current_alt: AtomicU8,
    status: Mutex<InterfaceStatus>,
    ref_count: AtomicI32,
    /// Held across the hardware claim or release that a ref transition triggers
    hardware: Mutex<()>,
    pipes: Mutex<Vec<PipeInfo>>,
}

impl UsbInterface {
    pub(crate) fn new(object_id: u32, pool_id: u32, desc: &InterfaceDescriptor) -> Self {
        Self {
            object_id,
            pool_id,
            number: desc.number,
            alt_setting: desc.alt_setting,
            class: desc.class,
            subclass: desc.subclass,
            protocol: desc.protocol,
            current_alt: AtomicU8::new(0),
            status: Mutex::new(InterfaceStatus::Normal),
            ref_count: AtomicI32::new(0),
            hardware: Mutex::new(()),
            pipes: Mutex::new(Vec::new()),
        }
    }

    /// The reserved control interface
    pub(crate) fn control(object_id: u32, pool_id: u32) -> Self {
        Self::new(
            object_id,
            pool_id,
            &InterfaceDescriptor {
                number: USB_CTRL_INTERFACE_ID,
                alt_setting: 0,
                class: 0,
                subclass: 0,
                protocol: 0,
                endpoints: Vec::new(),
            },
        )
    }

    pub fn object_id(&self) -> u32 {
        self.object_id
    }

    pub fn pool_id(&self) -> u32 {
        self.pool_id
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn alt_setting(&self) -> u8 {
        self.alt_setting
    }

    pub fn is_control(&self) -> bool {
        self.number == USB_CTRL_INTERFACE_ID
    }

    pub fn current_alt_setting(&self) -> u8 {
        self.current_alt.load(Ordering::Acquire)
    }

    pub(crate) fn set_current_alt_setting(&self, alt: u8) {
        self.current_alt.store(alt, Ordering::Release);
    }

    pub fn status(&self) -> InterfaceStatus {
        *self.status.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn set_status(&self, status: InterfaceStatus) {
        *self.status.lock().unwrap_or_else(|p| p.into_inner()) = status;
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Returns the count before the increment
    pub(crate) fn acquire(&self) -> i32 {
        self.ref_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Returns the count after the decrement
    pub(crate) fn release(&self) -> i32 {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Take a claim; `claim` runs for the first one
    ///
    /// Returns whether this was the first claim. A failed hardware claim
    /// leaves the count unchanged. The control interface is not counted.
    pub(crate) fn claim_with<F>(&self, claim: F) -> Result<bool>
    where
        F: FnOnce() -> Result<()>,
    {
        if self.is_control() {
            return Ok(false);
        }
        let _hw = self.hardware.lock().unwrap_or_else(|p| p.into_inner());
        let first = self.acquire() == 0;
        if first {
            if let Err(e) = claim() {
                self.release();
                return Err(e);
            }
        }
        Ok(first)
    }

    /// Drop a claim; `release` runs for the last one
    ///
    /// A failed hardware release restores the claim.
    pub(crate) fn release_with<F>(&self, release: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        if self.is_control() {
            return Ok(());
        }
        let _hw = self.hardware.lock().unwrap_or_else(|p| p.into_inner());
        if self.release() <= 0 {
            if let Err(e) = release() {
                self.acquire();
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn summary(&self) -> InterfaceSummary {
        InterfaceSummary {
            number: self.number,
            class: self.class,
            subclass: self.subclass,
            protocol: self.protocol,
        }
    }

    pub(crate) fn add_pipe(&self, pipe: PipeInfo) {
        self.pipes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(pipe);
    }

    pub fn pipes(&self) -> Vec<PipeInfo> {
        self.pipes.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn find_pipe(&self, pipe_id: u8) -> Option<PipeInfo> {
        self.pipes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|pipe| pipe.pipe_id == pipe_id)
            .copied()
    }

    pub(crate) fn destroy_pipe(&self, object_id: u32) -> Result<()> {
        let mut pipes = self.pipes.lock().unwrap_or_else(|p| p.into_inner());
        let pos = pipes
            .iter()
            .position(|pipe| pipe.object_id == object_id)
            .ok_or_else(|| Error::NotFound(format!("pipe object {}", object_id)))?;
        pipes.remove(pos);
        Ok(())
    }

    pub(crate) fn destroy_all_pipes(&self) -> usize {
        let mut pipes = self.pipes.lock().unwrap_or_else(|p| p.into_inner());
        let count = pipes.len();
        pipes.clear();
        count
    }
}
