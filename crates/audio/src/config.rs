//! Audio stream configuration

use crate::dma::{HeapAllocator, PhysicalBufferAllocator, ReservedRegionAllocator};
use crate::mmap::RetryPolicy;
use crate::params::{HwParams, MIN_PERIOD_COUNT, MIN_PERIOD_SIZE};
use crate::register::StreamDirection;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "AudioConfig::default_log_level")]
    pub log_level: String,
    pub pcm: PcmSettings,
    pub buffer: BufferSettings,
    #[serde(default)]
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcmSettings {
    pub channels: u32,
    pub bit_width: u32,
    pub rate: u32,
    #[serde(default)]
    pub big_endian: bool,
    /// Frames queued before a render engine starts
    #[serde(default = "PcmSettings::default_threshold")]
    pub start_threshold: u32,
    /// Capture read chunk in bytes
    #[serde(default = "PcmSettings::default_threshold")]
    pub silence_threshold: u32,
}

impl PcmSettings {
    fn default_threshold() -> u32 {
        MIN_PERIOD_SIZE
    }
}

/// Which allocator backs the ring buffers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocatorKind {
    #[default]
    Heap,
    Reserved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferSettings {
    pub period_size: u32,
    pub period_count: u32,
    #[serde(default)]
    pub allocator: AllocatorKind,
    /// Start of the reserved window (reserved allocator only)
    #[serde(default)]
    pub reserved_base: u64,
    /// Size of the reserved window in bytes (reserved allocator only)
    #[serde(default)]
    pub reserved_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "RetrySettings::default_attempts")]
    pub attempts: u32,
    #[serde(default = "RetrySettings::default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "RetrySettings::default_drain_attempts")]
    pub drain_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: Self::default_attempts(),
            delay_ms: Self::default_delay_ms(),
            drain_attempts: Self::default_drain_attempts(),
        }
    }
}

impl RetrySettings {
    fn default_attempts() -> u32 {
        100
    }

    fn default_delay_ms() -> u64 {
        5
    }

    fn default_drain_attempts() -> u32 {
        500
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            pcm: PcmSettings {
                channels: 2,
                bit_width: 16,
                rate: 48_000,
                big_endian: false,
                start_threshold: PcmSettings::default_threshold(),
                silence_threshold: PcmSettings::default_threshold(),
            },
            buffer: BufferSettings {
                period_size: MIN_PERIOD_SIZE,
                period_count: MIN_PERIOD_COUNT,
                allocator: AllocatorKind::Heap,
                reserved_base: 0,
                reserved_bytes: 0,
            },
            retry: RetrySettings::default(),
        }
    }
}

impl AudioConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    /// Load configuration from file or default location
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/hdf-io-core/audio.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: AudioConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded audio configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or fall back to defaults
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved audio configuration to: {}", path.display());
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("hdf-io-core").join("audio.toml")
        } else {
            PathBuf::from(".config/hdf-io-core/audio.toml")
        }
    }

    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }

        for direction in [StreamDirection::Render, StreamDirection::Capture] {
            self.hw_params(direction)
                .validate()
                .map_err(|e| anyhow!("Invalid {} parameters: {}", direction, e))?;
        }

        if self.buffer.allocator == AllocatorKind::Reserved {
            let needed = self.hw_params(StreamDirection::Render).buffer_size() * 2;
            if self.buffer.reserved_bytes < needed {
                return Err(anyhow!(
                    "Reserved window of {} bytes cannot hold a render and a capture ring ({} bytes)",
                    self.buffer.reserved_bytes,
                    needed
                ));
            }
        }

        if self.retry.attempts == 0 {
            return Err(anyhow!("retry.attempts must be at least 1"));
        }

        Ok(())
    }

    /// Hardware parameters for one direction
    pub fn hw_params(&self, direction: StreamDirection) -> HwParams {
        HwParams {
            direction,
            channels: self.pcm.channels,
            bit_width: self.pcm.bit_width,
            rate: self.pcm.rate,
            period_size: self.buffer.period_size,
            period_count: self.buffer.period_count,
            big_endian: self.pcm.big_endian,
            start_threshold: self.pcm.start_threshold,
            silence_threshold: self.pcm.silence_threshold,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry.attempts,
            delay: Duration::from_millis(self.retry.delay_ms),
            drain_attempts: self.retry.drain_attempts,
        }
    }

    /// Build the configured allocator
    pub fn allocator(&self) -> Arc<dyn PhysicalBufferAllocator> {
        match self.buffer.allocator {
            AllocatorKind::Heap => Arc::new(HeapAllocator::new()),
            AllocatorKind::Reserved => Arc::new(ReservedRegionAllocator::new(
                self.buffer.reserved_base,
                self.buffer.reserved_bytes,
            )),
        }
    }
}

/// Load configuration from a path, expanding `~`
pub fn load_config(path: &str) -> Result<AudioConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    AudioConfig::load(Some(path_buf))
}
