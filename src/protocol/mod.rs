//! Session parameters and wire format
//!
//! A session starts with a single `CONFIG:` line (see [`handshake`]) and then
//! carries raw s16le PCM frames of a fixed size (see [`frame`]).

pub mod frame;
pub mod handshake;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::HandshakeError;

pub use frame::{AudioFrame, Fit, FrameGeometry, BYTES_PER_SAMPLE};
pub use handshake::{parse_config_line, receive_config, send_config, MAX_CONFIG_LINE};

/// Supported sample rate range in Hz
pub const SAMPLE_RATE_RANGE: std::ops::RangeInclusive<u32> = 8000..=96000;

/// Supported channel counts
pub const CHANNEL_RANGE: std::ops::RangeInclusive<u16> = 1..=2;

/// Supported frames-per-chunk range
pub const FRAME_SIZE_RANGE: std::ops::RangeInclusive<u32> = 64..=4096;

/// Latency/robustness trade-off negotiated for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    LowLatency,
    #[default]
    Balanced,
    HighQuality,
}

impl Quality {
    pub const ALL: [Quality; 3] = [Quality::LowLatency, Quality::Balanced, Quality::HighQuality];

    /// Wire name of the preset
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::LowLatency => "low_latency",
            Quality::Balanced => "balanced",
            Quality::HighQuality => "high_quality",
        }
    }

    /// Jitter buffer capacity in frames
    pub fn buffer_capacity(&self) -> usize {
        match self {
            Quality::LowLatency => 3,
            Quality::Balanced => 5,
            Quality::HighQuality => 8,
        }
    }

    /// Frames kept when the jitter buffer overflows
    pub fn min_buffer(&self) -> usize {
        match self {
            Quality::LowLatency => 2,
            _ => 3,
        }
    }

    /// How long the sink writer waits for a frame before repeating the last one
    pub fn pop_timeout(&self) -> Duration {
        match self {
            Quality::LowLatency => Duration::from_millis(10),
            _ => Duration::from_millis(20),
        }
    }

    /// Number of sink writes between explicit flushes
    pub fn flush_interval(&self) -> u64 {
        match self {
            Quality::LowLatency => 3,
            _ => 5,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quality {
    type Err = HandshakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Quality::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| HandshakeError::Malformed(format!("unknown quality preset '{}'", s)))
    }
}

/// Audio parameters negotiated for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames (samples per channel) per chunk
    pub frame_size: u32,
    #[serde(default)]
    pub quality: Quality,
}

impl SessionConfig {
    /// Create a validated session configuration
    pub fn new(
        sample_rate: u32,
        channels: u16,
        frame_size: u32,
        quality: Quality,
    ) -> Result<Self, HandshakeError> {
        let config = Self {
            sample_rate,
            channels,
            frame_size,
            quality,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the parameter ranges every session must respect
    pub fn validate(&self) -> Result<(), HandshakeError> {
        if !SAMPLE_RATE_RANGE.contains(&self.sample_rate) {
            return Err(HandshakeError::Malformed(format!(
                "sample rate {} outside {}..={}",
                self.sample_rate,
                SAMPLE_RATE_RANGE.start(),
                SAMPLE_RATE_RANGE.end()
            )));
        }
        if !CHANNEL_RANGE.contains(&self.channels) {
            return Err(HandshakeError::Malformed(format!(
                "channel count {} outside {}..={}",
                self.channels,
                CHANNEL_RANGE.start(),
                CHANNEL_RANGE.end()
            )));
        }
        if !FRAME_SIZE_RANGE.contains(&self.frame_size) {
            return Err(HandshakeError::Malformed(format!(
                "frame size {} outside {}..={}",
                self.frame_size,
                FRAME_SIZE_RANGE.start(),
                FRAME_SIZE_RANGE.end()
            )));
        }
        Ok(())
    }

    /// Frame layout implied by this configuration
    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.frame_size as usize, self.channels)
    }

    /// Size of one frame on the wire
    pub fn frame_bytes(&self) -> usize {
        self.geometry().frame_bytes()
    }

    /// Wall-clock duration covered by one frame
    pub fn frame_duration(&self) -> Duration {
        Duration::from_nanos(self.frame_size as u64 * 1_000_000_000 / self.sample_rate as u64)
    }

    /// Encode as a newline-terminated handshake line
    pub fn to_config_line(&self) -> String {
        format!(
            "CONFIG:{}:{}:{}:{}\n",
            self.sample_rate, self.channels, self.frame_size, self.quality
        )
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::constants::DEFAULT_SAMPLE_RATE,
            channels: crate::constants::DEFAULT_CHANNELS,
            frame_size: crate::constants::DEFAULT_FRAME_SIZE,
            quality: Quality::Balanced,
        }
    }
}

impl fmt::Display for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz, {} ch, {} frames/chunk ({} bytes), {}",
            self.sample_rate,
            self.channels,
            self.frame_size,
            self.frame_bytes(),
            self.quality
        )
    }
}
