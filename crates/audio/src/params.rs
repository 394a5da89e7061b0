//! PCM hardware parameters and sample byte-order handling

use crate::register::StreamDirection;
use common::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::error;

/// Guard gap kept between the hardware read and write pointers
pub const SAFETY_MARGIN: usize = 128;
pub const MIN_BUFFER_SIZE: usize = 16 * 1024;
pub const MAX_BUFFER_SIZE: usize = 128 * 1024;
pub const MIN_PERIOD_SIZE: u32 = 4096;
pub const MAX_PERIOD_SIZE: u32 = 16 * 1024;
pub const MIN_PERIOD_COUNT: u32 = 8;
pub const MAX_PERIOD_COUNT: u32 = 32;
/// Hardware burst size programmed for render engines
pub const RENDER_TRANSFER_SIZE: u32 = 1024;
/// Hardware burst size programmed for capture engines
pub const CAPTURE_TRANSFER_SIZE: u32 = 320;
/// Mmap transfers are paged in multiples of this size
pub const MMAP_PAGE_SIZE: usize = 4096;

const MIN_CHANNELS: u32 = 1;
const MAX_CHANNELS: u32 = 2;

/// Parameters negotiated for one stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwParams {
    pub direction: StreamDirection,
    pub channels: u32,
    pub bit_width: u32,
    pub rate: u32,
    pub period_size: u32,
    pub period_count: u32,
    pub big_endian: bool,
    /// Frames that must be queued before a render engine is enabled
    pub start_threshold: u32,
    /// Capture read chunk in bytes
    pub silence_threshold: u32,
}

impl HwParams {
    /// 16-bit stereo at 48 kHz with the smallest legal ring
    pub fn default_for(direction: StreamDirection) -> Self {
        Self {
            direction,
            channels: 2,
            bit_width: 16,
            rate: 48_000,
            period_size: MIN_PERIOD_SIZE,
            period_count: MIN_PERIOD_COUNT,
            big_endian: false,
            start_threshold: MIN_PERIOD_SIZE,
            silence_threshold: MIN_PERIOD_SIZE,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_CHANNELS..=MAX_CHANNELS).contains(&self.channels) {
            error!("channels {} is invalid", self.channels);
            return Err(Error::InvalidParameter(format!(
                "channels must be {}..={}, got {}",
                MIN_CHANNELS, MAX_CHANNELS, self.channels
            )));
        }
        if !matches!(self.bit_width, 8 | 16 | 24 | 32) {
            return Err(Error::InvalidParameter(format!(
                "unsupported bit width {}",
                self.bit_width
            )));
        }
        if self.rate == 0 {
            return Err(Error::InvalidParameter("rate must be non-zero".to_string()));
        }
        if !(MIN_PERIOD_SIZE..=MAX_PERIOD_SIZE).contains(&self.period_size) {
            error!("period size {} is invalid", self.period_size);
            return Err(Error::InvalidParameter(format!(
                "period size must be {}..={}, got {}",
                MIN_PERIOD_SIZE, MAX_PERIOD_SIZE, self.period_size
            )));
        }
        if !(MIN_PERIOD_COUNT..=MAX_PERIOD_COUNT).contains(&self.period_count) {
            error!("period count {} is invalid", self.period_count);
            return Err(Error::InvalidParameter(format!(
                "period count must be {}..={}, got {}",
                MIN_PERIOD_COUNT, MAX_PERIOD_COUNT, self.period_count
            )));
        }
        let size = self.buffer_size();
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&size) {
            return Err(Error::InvalidParameter(format!(
                "buffer size {} outside {}..={}",
                size, MIN_BUFFER_SIZE, MAX_BUFFER_SIZE
            )));
        }
        if self.direction == StreamDirection::Capture
            && !(MIN_PERIOD_SIZE..=MAX_PERIOD_SIZE).contains(&self.silence_threshold)
        {
            error!("silence threshold {} is invalid", self.silence_threshold);
            return Err(Error::InvalidParameter(format!(
                "silence threshold must be {}..={}, got {}",
                MIN_PERIOD_SIZE, MAX_PERIOD_SIZE, self.silence_threshold
            )));
        }
        Ok(())
    }

    /// Bytes per frame
    pub fn frame_size(&self) -> usize {
        (self.channels * self.bit_width / 8) as usize
    }

    /// Ring capacity in bytes
    pub fn buffer_size(&self) -> usize {
        self.period_size as usize * self.period_count as usize
    }

    /// Burst size programmed into the engine
    pub fn hw_transfer_size(&self) -> u32 {
        match self.direction {
            StreamDirection::Render => RENDER_TRANSFER_SIZE,
            StreamDirection::Capture => CAPTURE_TRANSFER_SIZE,
        }
    }

    /// Bytes moved by one software read or write burst
    pub fn transfer_chunk(&self) -> usize {
        match self.direction {
            StreamDirection::Render => RENDER_TRANSFER_SIZE as usize,
            StreamDirection::Capture => self.silence_threshold as usize,
        }
    }

    pub fn start_threshold_bytes(&self) -> u64 {
        self.start_threshold as u64 * self.frame_size() as u64
    }
}

/// Reverse the byte order of every sample in `data`
///
/// 8-bit samples are left untouched.
pub fn swap_sample_bytes(data: &mut [u8], bit_width: u32) -> Result<()> {
    let width = match bit_width {
        8 => return Ok(()),
        16 | 24 | 32 => (bit_width / 8) as usize,
        other => {
            return Err(Error::InvalidParameter(format!(
                "unsupported bit width {}",
                other
            )));
        }
    };
    if data.len() % width != 0 {
        return Err(Error::InvalidParameter(format!(
            "{} bytes is not a whole number of {}-bit samples",
            data.len(),
            bit_width
        )));
    }
    for sample in data.chunks_exact_mut(width) {
        sample.reverse();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_are_valid() {
        let params = HwParams::default_for(StreamDirection::Render);
        params.validate().unwrap();
        assert_eq!(params.frame_size(), 4);
        assert_eq!(params.buffer_size(), 32 * 1024);
        assert_eq!(params.start_threshold_bytes(), 4096 * 4);
    }

    #[test]
    fn test_rejects_three_channels() {
        let mut params = HwParams::default_for(StreamDirection::Render);
        params.channels = 3;
        assert!(matches!(params.validate(), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_rejects_oversized_ring() {
        let mut params = HwParams::default_for(StreamDirection::Render);
        params.period_size = MAX_PERIOD_SIZE;
        params.period_count = 16;
        assert!(params.validate().is_err());
        params.period_count = MIN_PERIOD_COUNT;
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_capture_chunk_follows_silence_threshold() {
        let mut params = HwParams::default_for(StreamDirection::Capture);
        params.silence_threshold = 8192;
        params.validate().unwrap();
        assert_eq!(params.transfer_chunk(), 8192);
        assert_eq!(params.hw_transfer_size(), CAPTURE_TRANSFER_SIZE);

        params.silence_threshold = 320;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_swap_sample_bytes() {
        let mut data = [0x01, 0x02, 0x03, 0x04];
        swap_sample_bytes(&mut data, 16).unwrap();
        assert_eq!(data, [0x02, 0x01, 0x04, 0x03]);

        let mut data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
        swap_sample_bytes(&mut data, 24).unwrap();
        assert_eq!(data, [0x03, 0x02, 0x01, 0x06, 0x05, 0x04]);

        let mut data = [0x01, 0x02];
        swap_sample_bytes(&mut data, 8).unwrap();
        assert_eq!(data, [0x01, 0x02]);

        let mut odd = [0x01, 0x02, 0x03];
        assert!(swap_sample_bytes(&mut odd, 16).is_err());
    }
}
