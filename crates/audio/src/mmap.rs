//! Bulk transfers on top of the single-chunk write/read calls
//!
//! The controller itself never waits on a full or empty ring. These loops do,
//! with a bounded retry budget: a render page that still does not fit after
//! the budget is dropped and counted, a capture that stays empty times out.

use crate::controller::StreamTransferController;
use crate::params::MMAP_PAGE_SIZE;
use crate::ring::FlowStatus;
use common::{Error, Result};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded polling used by the mmap loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per chunk while the ring is full or empty
    pub attempts: u32,
    pub delay: Duration,
    /// Polls waiting for the engine to drain after a render transfer
    pub drain_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 100,
            delay: Duration::from_millis(5),
            drain_attempts: 500,
        }
    }
}

/// Summary of one mmap render transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MmapWriteReport {
    pub frames_written: u64,
    pub frames_dropped: u64,
    /// False when the engine had not caught up after the drain budget
    pub drained: bool,
}

/// Round a chunk up to whole pages
pub fn page_size_for(chunk: usize) -> usize {
    chunk.div_ceil(MMAP_PAGE_SIZE) * MMAP_PAGE_SIZE
}

impl StreamTransferController {
    /// Write all of `data`, paged by `transfer_frames`
    ///
    /// Stops early if the stream leaves the running state.
    pub fn mmap_write(
        &self,
        data: &[u8],
        transfer_frames: u32,
        policy: &RetryPolicy,
    ) -> Result<MmapWriteReport> {
        let params = self
            .hw_params()
            .ok_or_else(|| Error::InvalidParameter("hardware params not set".to_string()))?;
        let frame_size = params.frame_size();
        if transfer_frames == 0 || data.is_empty() || data.len() % frame_size != 0 {
            return Err(Error::InvalidParameter(format!(
                "mmap write of {} bytes in {} frame transfers",
                data.len(),
                transfer_frames
            )));
        }

        let page = page_size_for(transfer_frames as usize * frame_size);
        let mut report = MmapWriteReport::default();
        self.lock().frames_position = 0;

        for chunk in data.chunks(page) {
            if !self.is_running() {
                debug!("{} stopped during mmap write", self.engine());
                break;
            }
            let frames = (chunk.len() / frame_size) as u64;

            if self.write_with_retry(chunk, policy)? {
                report.frames_written += frames;
            } else {
                warn!("{}: frame drop ({} frames)", self.engine(), frames);
                self.metrics.record_dropped(frames);
                report.frames_dropped += frames;
            }
            self.lock().frames_position += frames;
        }

        report.drained = self.wait_drained(policy)?;
        if !report.drained {
            warn!("{}: playback not drained, wait timeout", self.engine());
        }
        Ok(report)
    }

    fn write_with_retry(&self, chunk: &[u8], policy: &RetryPolicy) -> Result<bool> {
        for _ in 0..policy.attempts {
            if self.write(chunk)?.status != FlowStatus::Full {
                return Ok(true);
            }
            thread::sleep(policy.delay);
        }
        Ok(false)
    }

    /// Poll until the hardware read pointer reaches the write pointer
    pub fn wait_drained(&self, policy: &RetryPolicy) -> Result<bool> {
        for _ in 0..policy.drain_attempts {
            let (read, write) = self.hw_pointers()?;
            if read == write {
                return Ok(true);
            }
            thread::sleep(policy.delay);
        }
        Ok(false)
    }

    /// Fill `out` with captured bytes
    ///
    /// Each empty poll costs one attempt; a successful read restores the full
    /// budget. Returns the number of bytes placed in `out`, which is short
    /// only when the stream stopped running.
    pub fn mmap_read(&self, out: &mut [u8], policy: &RetryPolicy) -> Result<usize> {
        let params = self
            .hw_params()
            .ok_or_else(|| Error::InvalidParameter("hardware params not set".to_string()))?;
        let frame_size = params.frame_size();
        if out.is_empty() || out.len() % frame_size != 0 {
            return Err(Error::InvalidParameter(format!(
                "mmap read into {} bytes",
                out.len()
            )));
        }

        let chunk = params.transfer_chunk();
        let mut staging = vec![0u8; chunk];
        let mut filled = 0;
        let mut attempts_left = policy.attempts;
        self.lock().frames_position = 0;

        loop {
            let outcome = self.read(&mut staging)?;
            if outcome.status == FlowStatus::Empty {
                if attempts_left == 0 {
                    warn!("{}: no capture data after {} polls", self.engine(), policy.attempts);
                    return Err(Error::Timeout(policy.delay * policy.attempts));
                }
                attempts_left -= 1;
                thread::sleep(policy.delay);
                continue;
            }
            attempts_left = policy.attempts;

            let n = outcome.bytes.min(out.len() - filled);
            out[filled..filled + n].copy_from_slice(&staging[..n]);
            if n < outcome.bytes {
                self.metrics
                    .record_dropped(((outcome.bytes - n) / frame_size) as u64);
            }
            filled += n;
            self.lock().frames_position += (n / frame_size) as u64;

            if filled >= out.len() || !self.is_running() {
                return Ok(filled);
            }
        }
    }
}
