//! Per-direction stream controller
//!
//! [`StreamTransferController`] owns one ring buffer and drives one DMA
//! engine through the [`RegisterPort`]. Every operation that touches the
//! buffer runs under a single mutex, so `stop` can free the buffer while a
//! writer is mid-call without a use-after-free. Concurrent writers are not
//! ordered by the controller; a single producer per direction is assumed.

use crate::dma::{DMA_ALIGNMENT, PhysicalBufferAllocator};
use crate::params::{HwParams, swap_sample_bytes};
use crate::register::{EngineId, PointerKind, RegisterPort, StreamDirection};
use crate::ring::{CircularStreamBuffer, FlowStatus, readable_bytes};
use common::{Error, Result, StreamMetrics, StreamMetricsSnapshot};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Lifecycle of one stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Uninitialized,
    Prepared,
    Running,
    Paused,
    Stopped,
}

/// Status and size of one write or read call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    pub status: FlowStatus,
    pub bytes: usize,
    pub frames: usize,
}

impl TransferOutcome {
    fn flow(status: FlowStatus) -> Self {
        Self {
            status,
            bytes: 0,
            frames: 0,
        }
    }
}

/// Snapshot returned by [`StreamTransferController::position`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPosition {
    pub phase: StreamPhase,
    pub frames_position: u64,
    pub total_stream_bytes: u64,
    pub engine_enabled: bool,
    pub buffer_frees: u64,
}

#[derive(Debug)]
pub(crate) struct StreamState {
    pub(crate) phase: StreamPhase,
    pub(crate) params: Option<HwParams>,
    pub(crate) buffer: Option<CircularStreamBuffer>,
    pub(crate) running: bool,
    pub(crate) engine_enabled: bool,
    pub(crate) total_stream_bytes: u64,
    pub(crate) frames_position: u64,
    buffer_frees: u64,
}

/// Orchestrates prepare/start/write/read/stop for one direction
pub struct StreamTransferController {
    engine: EngineId,
    port: Arc<dyn RegisterPort>,
    allocator: Arc<dyn PhysicalBufferAllocator>,
    state: Mutex<StreamState>,
    pub(crate) metrics: StreamMetrics,
}

impl StreamTransferController {
    pub fn new(
        engine: EngineId,
        port: Arc<dyn RegisterPort>,
        allocator: Arc<dyn PhysicalBufferAllocator>,
    ) -> Self {
        Self {
            engine,
            port,
            allocator,
            state: Mutex::new(StreamState {
                phase: StreamPhase::Uninitialized,
                params: None,
                buffer: None,
                running: false,
                engine_enabled: false,
                total_stream_bytes: 0,
                frames_position: 0,
                buffer_frees: 0,
            }),
            metrics: StreamMetrics::new(),
        }
    }

    pub fn engine(&self) -> EngineId {
        self.engine
    }

    pub fn direction(&self) -> StreamDirection {
        self.engine.direction
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Accept new hardware parameters
    ///
    /// A buffer of a different size is released so the next prepare
    /// allocates the new capacity.
    pub fn set_hw_params(&self, params: HwParams) -> Result<()> {
        params.validate()?;
        if params.direction != self.engine.direction {
            return Err(Error::InvalidParameter(format!(
                "{} params given to {} engine",
                params.direction, self.engine
            )));
        }

        let mut state = self.lock();
        if matches!(state.phase, StreamPhase::Running | StreamPhase::Paused) {
            return Err(Error::InvalidParameter(format!(
                "{} busy, stop before changing params",
                self.engine
            )));
        }

        if let Some(buffer) = state.buffer.take() {
            if buffer.capacity() == params.buffer_size() {
                state.buffer = Some(buffer);
            } else {
                self.allocator.free(buffer.into_region());
                state.buffer_frees += 1;
                self.metrics.record_buffer_free();
            }
        }

        debug!(
            "{}: {} ch, {} bit, {} Hz, ring {} bytes",
            self.engine,
            params.channels,
            params.bit_width,
            params.rate,
            params.buffer_size()
        );
        state.params = Some(params);
        Ok(())
    }

    /// Allocate the ring on first use, then zero it and reset every offset
    pub fn prepare(&self) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if matches!(state.phase, StreamPhase::Running) {
            return Err(Error::InvalidParameter(format!(
                "{} is running",
                self.engine
            )));
        }
        let params = state
            .params
            .ok_or_else(|| Error::InvalidParameter("hardware params not set".to_string()))?;

        if state.buffer.is_none() {
            state.buffer = Some(self.allocate_buffer(&params)?);
        }
        if let Some(buffer) = state.buffer.as_mut() {
            buffer.clear();
        }

        state.total_stream_bytes = 0;
        state.frames_position = 0;
        state.running = false;
        state.engine_enabled = false;

        self.port.write_pointer(self.engine, PointerKind::Write, 0)?;
        self.port.write_pointer(self.engine, PointerKind::Read, 0)?;

        state.phase = StreamPhase::Prepared;
        debug!("{} prepared", self.engine);
        Ok(())
    }

    fn allocate_buffer(&self, params: &HwParams) -> Result<CircularStreamBuffer> {
        let size = params.buffer_size();
        let region = self.allocator.allocate(size, DMA_ALIGNMENT).inspect_err(|e| {
            error!("{}: buffer allocation of {} bytes failed: {}", self.engine, size, e);
        })?;
        let buffer = CircularStreamBuffer::new(region)?;

        let init = self
            .port
            .set_buffer_addr(self.engine, buffer.phys_addr())
            .and_then(|_| self.port.set_buffer_size(self.engine, size as u32))
            .and_then(|_| {
                self.port
                    .set_transfer_size(self.engine, params.hw_transfer_size())
            });
        if let Err(e) = init {
            error!("{}: engine init failed: {}", self.engine, e);
            self.allocator.free(buffer.into_region());
            return Err(e);
        }

        debug!(
            "{}: ring at {:#x}, {} bytes",
            self.engine,
            buffer.phys_addr(),
            size
        );
        Ok(buffer)
    }

    /// Mark the stream running
    ///
    /// Render defers engine activation to the write that crosses the start
    /// threshold. Capture starts the engine immediately.
    pub fn start(&self) -> Result<()> {
        let mut state = self.lock();
        if state.buffer.is_none() {
            error!("{}: start without a buffer", self.engine);
            return Err(Error::InvalidParameter(format!(
                "{} buffer not allocated",
                self.engine
            )));
        }

        state.running = true;
        state.engine_enabled = false;
        if self.engine.direction == StreamDirection::Capture {
            self.port.set_engine_running(self.engine, true)?;
            state.engine_enabled = true;
            self.metrics.record_engine_start();
        }
        state.phase = StreamPhase::Running;
        debug!("{} started", self.engine);
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        let mut state = self.lock();
        match state.phase {
            StreamPhase::Running => {}
            StreamPhase::Paused => return Ok(()),
            other => {
                return Err(Error::InvalidParameter(format!(
                    "{} cannot pause from {:?}",
                    self.engine, other
                )));
            }
        }
        state.running = false;
        state.engine_enabled = false;
        self.port.set_engine_running(self.engine, false)?;
        state.phase = StreamPhase::Paused;
        debug!("{} paused", self.engine);
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        if self.phase() != StreamPhase::Paused {
            return Err(Error::InvalidParameter(format!(
                "{} is not paused",
                self.engine
            )));
        }
        self.start()
    }

    /// Halt the engine and release the ring
    ///
    /// Safe to call repeatedly and concurrently with `write`/`read`.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.lock();
        state.running = false;
        state.engine_enabled = false;
        let halted = self.port.set_engine_running(self.engine, false);
        if let Err(e) = &halted {
            warn!("{}: engine halt failed: {}", self.engine, e);
        }

        if let Some(buffer) = state.buffer.take() {
            self.allocator.free(buffer.into_region());
            state.buffer_frees += 1;
            self.metrics.record_buffer_free();
            debug!("{} buffer freed ({} total)", self.engine, state.buffer_frees);
        }
        state.phase = StreamPhase::Stopped;
        halted
    }

    /// Forget the parameters of a stopped stream
    pub fn close(&self) -> Result<()> {
        let mut state = self.lock();
        if state.buffer.is_some() {
            return Err(Error::InvariantViolation(format!(
                "{} closed with a live buffer",
                self.engine
            )));
        }
        state.params = None;
        state.phase = StreamPhase::Uninitialized;
        Ok(())
    }

    /// Queue interleaved PCM bytes for playback
    ///
    /// Returns `FlowStatus::Full` without copying when the ring lacks room.
    pub fn write(&self, data: &[u8]) -> Result<TransferOutcome> {
        if self.engine.direction != StreamDirection::Render {
            return Err(Error::InvalidParameter(format!(
                "write on {} engine",
                self.engine
            )));
        }

        let mut guard = self.lock();
        let state = &mut *guard;
        let params = state
            .params
            .ok_or_else(|| Error::InvalidParameter("hardware params not set".to_string()))?;
        let frame_size = params.frame_size();
        if data.is_empty() || data.len() % frame_size != 0 {
            error!("{}: write of {} bytes is not whole frames", self.engine, data.len());
            return Err(Error::InvalidParameter(format!(
                "{} bytes is not a whole number of {} byte frames",
                data.len(),
                frame_size
            )));
        }
        let Some(buffer) = state.buffer.as_mut() else {
            error!("{}: render buffer not allocated", self.engine);
            return Err(Error::InvalidParameter(format!(
                "{} buffer not allocated",
                self.engine
            )));
        };
        if data.len() >= buffer.capacity() {
            error!("{}: stream data too long", self.engine);
            return Err(Error::InvalidParameter(format!(
                "{} bytes does not fit a {} byte ring",
                data.len(),
                buffer.capacity()
            )));
        }

        let swapped;
        let payload = if params.big_endian {
            let mut copy = data.to_vec();
            swap_sample_bytes(&mut copy, params.bit_width)?;
            swapped = copy;
            swapped.as_slice()
        } else {
            data
        };

        let read = buffer.offset(self.port.read_pointer(self.engine, PointerKind::Read)?)?;
        let write = buffer.offset(self.port.read_pointer(self.engine, PointerKind::Write)?)?;
        let produced = buffer.produce(write, read, payload)?;
        if produced.status == FlowStatus::Full {
            self.metrics.record_full();
            return Ok(TransferOutcome::flow(FlowStatus::Full));
        }

        if state.running {
            state.total_stream_bytes += data.len() as u64;
            self.port.write_pointer(
                self.engine,
                PointerKind::Write,
                produced.write.as_register(),
            )?;

            if !state.engine_enabled && state.total_stream_bytes >= params.start_threshold_bytes()
            {
                self.port.set_engine_running(self.engine, true)?;
                state.engine_enabled = true;
                self.metrics.record_engine_start();
                info!(
                    "{} engine enabled after {} bytes",
                    self.engine, state.total_stream_bytes
                );
            }
        }

        let frames = data.len() / frame_size;
        self.metrics
            .record_write(data.len() as u64, frames as u64);
        self.metrics
            .record_fill_level(readable_bytes(produced.write, read) as u64);

        Ok(TransferOutcome {
            status: FlowStatus::Normal,
            bytes: data.len(),
            frames,
        })
    }

    /// Take one transfer chunk of captured bytes
    ///
    /// `out` must hold at least one chunk. Returns `FlowStatus::Empty` when
    /// less than a chunk is available.
    pub fn read(&self, out: &mut [u8]) -> Result<TransferOutcome> {
        if self.engine.direction != StreamDirection::Capture {
            return Err(Error::InvalidParameter(format!(
                "read on {} engine",
                self.engine
            )));
        }

        let mut guard = self.lock();
        let state = &mut *guard;
        let params = state
            .params
            .ok_or_else(|| Error::InvalidParameter("hardware params not set".to_string()))?;
        let Some(buffer) = state.buffer.as_ref() else {
            error!("{}: capture buffer not allocated", self.engine);
            return Err(Error::InvalidParameter(format!(
                "{} buffer not allocated",
                self.engine
            )));
        };

        let read = buffer.offset(self.port.read_pointer(self.engine, PointerKind::Read)?)?;
        let write = buffer.offset(self.port.read_pointer(self.engine, PointerKind::Write)?)?;
        let consumed = buffer.consume(write, read, params.transfer_chunk(), out)?;
        if consumed.status == FlowStatus::Empty {
            self.metrics.record_empty();
            return Ok(TransferOutcome::flow(FlowStatus::Empty));
        }

        // Captured samples are swapped unless the stream is big-endian
        if !params.big_endian {
            let sample = (params.bit_width / 8).max(1) as usize;
            let whole = consumed.bytes - consumed.bytes % sample;
            swap_sample_bytes(&mut out[..whole], params.bit_width)?;
        }

        self.port.write_pointer(
            self.engine,
            PointerKind::Read,
            consumed.read.as_register(),
        )?;

        let frames = consumed.bytes / params.frame_size();
        self.metrics
            .record_read(consumed.bytes as u64, frames as u64);

        Ok(TransferOutcome {
            status: FlowStatus::Normal,
            bytes: consumed.bytes,
            frames,
        })
    }

    pub fn phase(&self) -> StreamPhase {
        self.lock().phase
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn hw_params(&self) -> Option<HwParams> {
        self.lock().params
    }

    pub fn position(&self) -> StreamPosition {
        let state = self.lock();
        StreamPosition {
            phase: state.phase,
            frames_position: state.frames_position,
            total_stream_bytes: state.total_stream_bytes,
            engine_enabled: state.engine_enabled,
            buffer_frees: state.buffer_frees,
        }
    }

    pub fn metrics(&self) -> StreamMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Current hardware (read, write) pointers
    pub fn hw_pointers(&self) -> Result<(u32, u32)> {
        Ok((
            self.port.read_pointer(self.engine, PointerKind::Read)?,
            self.port.read_pointer(self.engine, PointerKind::Write)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::HeapAllocator;
    use crate::test_utils::{FailingAllocator, SimulatedHardware, SimulatedRegisterPort};

    fn render() -> (StreamTransferController, SimulatedHardware) {
        let hw = SimulatedHardware::new();
        let ctrl = hw.controller(StreamDirection::Render);
        ctrl.set_hw_params(HwParams::default_for(StreamDirection::Render))
            .unwrap();
        (ctrl, hw)
    }

    #[test]
    fn test_prepare_requires_params() {
        let ctrl = StreamTransferController::new(
            EngineId::new(StreamDirection::Render, 0),
            Arc::new(SimulatedRegisterPort::new()),
            Arc::new(HeapAllocator::new()),
        );
        assert!(matches!(ctrl.prepare(), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_prepare_programs_engine() {
        let (ctrl, hw) = render();
        ctrl.prepare().unwrap();

        let engine = ctrl.engine();
        let regs = hw.port.engine_state(engine);
        assert_eq!(regs.buffer_size, 32 * 1024);
        assert_eq!(regs.transfer_size, crate::params::RENDER_TRANSFER_SIZE);
        assert_ne!(regs.buffer_addr, 0);
        assert_eq!(regs.read_ptr, 0);
        assert_eq!(regs.write_ptr, 0);
        assert_eq!(ctrl.phase(), StreamPhase::Prepared);
    }

    #[test]
    fn test_write_without_buffer_fails() {
        let (ctrl, _hw) = render();
        assert!(matches!(
            ctrl.write(&[0u8; 64]),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_write_rejects_partial_frames_and_oversize() {
        let (ctrl, _hw) = render();
        ctrl.prepare().unwrap();
        assert!(ctrl.write(&[0u8; 6]).is_err());
        assert!(ctrl.write(&vec![0u8; 32 * 1024]).is_err());
    }

    #[test]
    fn test_write_before_start_does_not_advance_hardware() {
        let (ctrl, hw) = render();
        ctrl.prepare().unwrap();
        let outcome = ctrl.write(&[1u8; 64]).unwrap();
        assert_eq!(outcome.status, FlowStatus::Normal);
        assert_eq!(hw.port.engine_state(ctrl.engine()).write_ptr, 0);
        assert_eq!(ctrl.position().total_stream_bytes, 0);
    }

    #[test]
    fn test_engine_enabled_once_at_threshold() {
        let (ctrl, hw) = render();
        ctrl.prepare().unwrap();
        ctrl.start().unwrap();

        // Threshold is 4096 frames = 16384 bytes
        let chunk = vec![0u8; 4096];
        for _ in 0..3 {
            ctrl.write(&chunk).unwrap();
            assert!(!hw.port.engine_state(ctrl.engine()).running);
        }
        ctrl.write(&chunk).unwrap();
        assert!(hw.port.engine_state(ctrl.engine()).running);
        assert!(ctrl.position().engine_enabled);

        hw.port.advance_read(ctrl.engine(), 16384);
        ctrl.write(&chunk).unwrap();
        assert_eq!(ctrl.metrics().engine_starts, 1);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (ctrl, _hw) = render();
        ctrl.prepare().unwrap();
        ctrl.start().unwrap();
        ctrl.stop().unwrap();
        ctrl.stop().unwrap();
        assert_eq!(ctrl.position().buffer_frees, 1);
        assert_eq!(ctrl.phase(), StreamPhase::Stopped);
        assert!(ctrl.write(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_pause_and_resume() {
        let (ctrl, hw) = render();
        ctrl.prepare().unwrap();
        assert!(ctrl.resume().is_err());
        ctrl.start().unwrap();
        ctrl.pause().unwrap();
        assert!(!ctrl.is_running());
        assert!(!hw.port.engine_state(ctrl.engine()).running);
        ctrl.resume().unwrap();
        assert_eq!(ctrl.phase(), StreamPhase::Running);
        assert!(!ctrl.position().engine_enabled);
    }

    #[test]
    fn test_big_endian_write_swaps_samples() {
        let (ctrl, hw) = render();
        let mut params = HwParams::default_for(StreamDirection::Render);
        params.big_endian = true;
        ctrl.set_hw_params(params).unwrap();
        ctrl.prepare().unwrap();
        ctrl.start().unwrap();
        ctrl.write(&[0x01, 0x02, 0x03, 0x04]).unwrap();

        let memory = hw.memory(ctrl.engine()).unwrap();
        assert_eq!(&memory.lock()[..4], &[0x02, 0x01, 0x04, 0x03]);
    }

    #[test]
    fn test_allocation_failure_propagates() {
        let ctrl = StreamTransferController::new(
            EngineId::new(StreamDirection::Render, 0),
            Arc::new(SimulatedRegisterPort::new()),
            Arc::new(FailingAllocator),
        );
        ctrl.set_hw_params(HwParams::default_for(StreamDirection::Render))
            .unwrap();
        assert!(matches!(
            ctrl.prepare(),
            Err(Error::ResourceExhausted(_))
        ));
        assert_eq!(ctrl.phase(), StreamPhase::Uninitialized);
    }

    #[test]
    fn test_params_rejected_while_running() {
        let (ctrl, _hw) = render();
        ctrl.prepare().unwrap();
        ctrl.start().unwrap();
        assert!(
            ctrl.set_hw_params(HwParams::default_for(StreamDirection::Render))
                .is_err()
        );
        assert!(
            ctrl.set_hw_params(HwParams::default_for(StreamDirection::Capture))
                .is_err()
        );
    }
}
