//! Transfer metrics for audio streams and USB request queues
//!
//! Counters are lock-free atomics so the hot write/read paths never block on
//! metrics. Request latency keeps a short rolling window behind an `RwLock`.

use std::collections::VecDeque;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Number of latency samples kept for the rolling window
const ROLLING_WINDOW_SIZE: usize = 100;

/// Per-direction audio stream counters
#[derive(Debug, Default)]
pub struct StreamMetrics {
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    frames_written: AtomicU64,
    frames_read: AtomicU64,
    full_events: AtomicU64,
    empty_events: AtomicU64,
    dropped_frames: AtomicU64,
    engine_starts: AtomicU64,
    buffer_frees: AtomicU64,
    /// Highest observed ring occupancy in bytes
    peak_fill: AtomicU64,
}

/// Point-in-time copy of [`StreamMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamMetricsSnapshot {
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub frames_written: u64,
    pub frames_read: u64,
    pub full_events: u64,
    pub empty_events: u64,
    pub dropped_frames: u64,
    pub engine_starts: u64,
    pub buffer_frees: u64,
    pub peak_fill: u64,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_write(&self, bytes: u64, frames: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.frames_written.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn record_read(&self, bytes: u64, frames: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
        self.frames_read.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn record_full(&self) {
        self.full_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_empty(&self) {
        self.empty_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, frames: u64) {
        self.dropped_frames.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn record_engine_start(&self) {
        self.engine_starts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_buffer_free(&self) {
        self.buffer_frees.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fill_level(&self, used: u64) {
        self.peak_fill.fetch_max(used, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StreamMetricsSnapshot {
        StreamMetricsSnapshot {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            frames_read: self.frames_read.load(Ordering::Relaxed),
            full_events: self.full_events.load(Ordering::Relaxed),
            empty_events: self.empty_events.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            engine_starts: self.engine_starts.load(Ordering::Relaxed),
            buffer_frees: self.buffer_frees.load(Ordering::Relaxed),
            peak_fill: self.peak_fill.load(Ordering::Relaxed),
        }
    }
}

/// Rolling latency window
#[derive(Debug)]
struct RollingLatency {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
}

impl RollingLatency {
    fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(ROLLING_WINDOW_SIZE),
            window,
        }
    }

    fn add(&mut self, latency_us: u64) {
        let now = Instant::now();
        self.samples.push_back((now, latency_us));
        while self.samples.len() > ROLLING_WINDOW_SIZE {
            self.samples.pop_front();
        }
        while let Some((ts, _)) = self.samples.front() {
            if now.duration_since(*ts) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn avg(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let sum: u64 = self.samples.iter().map(|(_, l)| *l).sum();
        sum / self.samples.len() as u64
    }

    fn max(&self) -> u64 {
        self.samples.iter().map(|(_, l)| *l).max().unwrap_or(0)
    }
}

/// USB request queue counters
#[derive(Debug)]
pub struct IoMetrics {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    bytes_transferred: AtomicU64,
    latency: RwLock<RollingLatency>,
}

/// Point-in-time copy of [`IoMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoMetricsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub bytes_transferred: u64,
    pub avg_latency_us: u64,
    pub max_latency_us: u64,
}

impl Default for IoMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl IoMetrics {
    pub fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            latency: RwLock::new(RollingLatency::new(Duration::from_secs(10))),
        }
    }

    pub fn record_submit(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, bytes: u64, latency: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
        let mut window = self
            .latency
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        window.add(latency.as_micros() as u64);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancel(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IoMetricsSnapshot {
        let window = self
            .latency
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        IoMetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            avg_latency_us: window.avg(),
            max_latency_us: window.max(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_counters() {
        let metrics = StreamMetrics::new();
        metrics.record_write(56, 14);
        metrics.record_write(56, 14);
        metrics.record_full();
        metrics.record_fill_level(112);
        metrics.record_fill_level(56);

        let snap = metrics.snapshot();
        assert_eq!(snap.bytes_written, 112);
        assert_eq!(snap.frames_written, 28);
        assert_eq!(snap.full_events, 1);
        assert_eq!(snap.peak_fill, 112);
    }

    #[test]
    fn test_io_latency_window() {
        let metrics = IoMetrics::new();
        metrics.record_submit();
        metrics.record_submit();
        metrics.record_success(64, Duration::from_micros(100));
        metrics.record_success(64, Duration::from_micros(300));

        let snap = metrics.snapshot();
        assert_eq!(snap.submitted, 2);
        assert_eq!(snap.completed, 2);
        assert_eq!(snap.bytes_transferred, 128);
        assert_eq!(snap.avg_latency_us, 200);
        assert_eq!(snap.max_latency_us, 300);
    }
}
