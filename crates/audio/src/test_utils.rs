//! Simulated hardware for audio tests
//!
//! [`SimulatedRegisterPort`] keeps one register file per engine.
//! [`SimulatedHardware`] pairs it with a [`HeapAllocator`] so tests can play
//! the DMA engine: [`SimulatedHardware::drain`] consumes what a render stream
//! queued and [`SimulatedHardware::fill`] produces capture data.

use crate::controller::StreamTransferController;
use crate::dma::{DmaMemory, DmaRegion, HeapAllocator, PhysicalBufferAllocator};
use crate::register::{EngineId, PointerKind, RegisterPort, StreamDirection};
use common::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Register file of one simulated engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineRegisters {
    pub read_ptr: u32,
    pub write_ptr: u32,
    pub buffer_addr: u64,
    pub buffer_size: u32,
    pub transfer_size: u32,
    pub running: bool,
}

#[derive(Debug, Default)]
pub struct SimulatedRegisterPort {
    engines: Mutex<HashMap<EngineId, EngineRegisters>>,
    fail_writes: AtomicBool,
}

impl SimulatedRegisterPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engine_state(&self, engine: EngineId) -> EngineRegisters {
        self.registers()
            .get(&engine)
            .copied()
            .unwrap_or_default()
    }

    /// Make every subsequent register write fail
    pub fn fail_register_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Move the hardware read pointer as if the engine consumed `bytes`
    pub fn advance_read(&self, engine: EngineId, bytes: u32) {
        self.update(engine, |regs| {
            regs.read_ptr = (regs.read_ptr + bytes) % regs.buffer_size.max(1);
        });
    }

    /// Move the hardware write pointer as if the engine produced `bytes`
    pub fn advance_write(&self, engine: EngineId, bytes: u32) {
        self.update(engine, |regs| {
            regs.write_ptr = (regs.write_ptr + bytes) % regs.buffer_size.max(1);
        });
    }

    pub fn set_pointer(&self, engine: EngineId, kind: PointerKind, value: u32) {
        self.update(engine, |regs| match kind {
            PointerKind::Read => regs.read_ptr = value,
            PointerKind::Write => regs.write_ptr = value,
        });
    }

    fn update(&self, engine: EngineId, f: impl FnOnce(&mut EngineRegisters)) {
        f(self.registers().entry(engine).or_default());
    }

    fn registers(&self) -> MutexGuard<'_, HashMap<EngineId, EngineRegisters>> {
        self.engines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn checked_update(&self, engine: EngineId, f: impl FnOnce(&mut EngineRegisters)) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::HardwareFailure(format!(
                "register write to {} failed",
                engine
            )));
        }
        self.update(engine, f);
        Ok(())
    }
}

impl RegisterPort for SimulatedRegisterPort {
    fn read_pointer(&self, engine: EngineId, kind: PointerKind) -> Result<u32> {
        let regs = self.engine_state(engine);
        Ok(match kind {
            PointerKind::Read => regs.read_ptr,
            PointerKind::Write => regs.write_ptr,
        })
    }

    fn write_pointer(&self, engine: EngineId, kind: PointerKind, value: u32) -> Result<()> {
        self.checked_update(engine, |regs| match kind {
            PointerKind::Read => regs.read_ptr = value,
            PointerKind::Write => regs.write_ptr = value,
        })
    }

    fn set_buffer_addr(&self, engine: EngineId, phys_addr: u64) -> Result<()> {
        self.checked_update(engine, |regs| regs.buffer_addr = phys_addr)
    }

    fn set_buffer_size(&self, engine: EngineId, size: u32) -> Result<()> {
        self.checked_update(engine, |regs| regs.buffer_size = size)
    }

    fn set_transfer_size(&self, engine: EngineId, size: u32) -> Result<()> {
        self.checked_update(engine, |regs| regs.transfer_size = size)
    }

    fn set_engine_running(&self, engine: EngineId, running: bool) -> Result<()> {
        self.checked_update(engine, |regs| regs.running = running)
    }
}

/// Register port plus allocator, standing in for a whole audio DMA block
#[derive(Debug, Clone)]
pub struct SimulatedHardware {
    pub port: Arc<SimulatedRegisterPort>,
    pub allocator: Arc<HeapAllocator>,
}

impl Default for SimulatedHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHardware {
    pub fn new() -> Self {
        Self {
            port: Arc::new(SimulatedRegisterPort::new()),
            allocator: Arc::new(HeapAllocator::new()),
        }
    }

    /// Controller for channel 0 of `direction`
    pub fn controller(&self, direction: StreamDirection) -> StreamTransferController {
        StreamTransferController::new(
            EngineId::new(direction, 0),
            self.port.clone(),
            self.allocator.clone(),
        )
    }

    /// Ring memory programmed into `engine`
    pub fn memory(&self, engine: EngineId) -> Option<DmaMemory> {
        self.allocator
            .lookup(self.port.engine_state(engine).buffer_addr)
    }

    /// Consume up to `max` queued bytes the way a render engine would
    pub fn drain(&self, engine: EngineId, max: usize) -> Vec<u8> {
        let regs = self.port.engine_state(engine);
        let Some(memory) = self.memory(engine) else {
            return Vec::new();
        };
        let size = regs.buffer_size as usize;
        let (r, w) = (regs.read_ptr as usize, regs.write_ptr as usize);
        let queued = if w >= r { w - r } else { size - r + w };
        let n = queued.min(max);

        let mem = memory.lock();
        let out: Vec<u8> = (0..n).map(|i| mem[(r + i) % size]).collect();
        drop(mem);

        self.port.advance_read(engine, n as u32);
        out
    }

    /// Produce `data` at the write pointer the way a capture engine would
    pub fn fill(&self, engine: EngineId, data: &[u8]) {
        let regs = self.port.engine_state(engine);
        let Some(memory) = self.memory(engine) else {
            return;
        };
        let size = regs.buffer_size as usize;
        let w = regs.write_ptr as usize;
        {
            let mut mem = memory.lock();
            for (i, byte) in data.iter().enumerate() {
                mem[(w + i) % size] = *byte;
            }
        }
        self.port.advance_write(engine, data.len() as u32);
    }
}

/// Allocator that always reports exhaustion
#[derive(Debug, Default)]
pub struct FailingAllocator;

impl PhysicalBufferAllocator for FailingAllocator {
    fn allocate(&self, size: usize, _alignment: usize) -> Result<DmaRegion> {
        Err(Error::ResourceExhausted(format!(
            "no memory for {} bytes",
            size
        )))
    }

    fn free(&self, _region: DmaRegion) {}

    fn lookup(&self, _phys_addr: u64) -> Option<DmaMemory> {
        None
    }
}
