//! Gain control and level metering for s16le PCM

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::protocol::BYTES_PER_SAMPLE;

/// Allowed gain range
pub const MIN_GAIN: f32 = 0.0;
pub const MAX_GAIN: f32 = 2.0;

/// A gain multiplier that can be changed from any thread.
///
/// Readers take one snapshot per frame; a concurrent update becomes visible
/// at the next frame at the latest.
#[derive(Debug)]
pub struct GainState {
    bits: AtomicU32,
}

impl GainState {
    pub fn new(gain: f32) -> Self {
        Self {
            bits: AtomicU32::new(clamp_gain(gain).to_bits()),
        }
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }

    /// Set the gain, clamped to `[0.0, 2.0]`
    pub fn set(&self, gain: f32) {
        self.bits.store(clamp_gain(gain).to_bits(), Ordering::Relaxed);
    }
}

impl Default for GainState {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Shared handle to a gain control
pub type SharedGain = Arc<GainState>;

fn clamp_gain(gain: f32) -> f32 {
    if gain.is_nan() {
        1.0
    } else {
        gain.clamp(MIN_GAIN, MAX_GAIN)
    }
}

/// Scale every sample in place, saturating at the i16 range.
///
/// Unity gain leaves the buffer untouched.
pub fn apply_gain(pcm: &mut [u8], gain: f32) {
    if gain == 1.0 {
        return;
    }
    for chunk in pcm.chunks_exact_mut(BYTES_PER_SAMPLE) {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]) as f32;
        let scaled = (sample * gain).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        chunk.copy_from_slice(&scaled.to_le_bytes());
    }
}

/// Loudness of one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameLevel {
    /// RMS as a percentage of full scale
    pub rms_percent: f32,
    /// Largest absolute sample value
    pub peak: u16,
}

impl FrameLevel {
    /// Below this the input is most likely muted
    pub const SILENCE_THRESHOLD_PERCENT: f32 = 0.1;

    pub fn measure(pcm: &[u8]) -> Self {
        let mut sum_sq = 0f64;
        let mut peak = 0u16;
        let mut count = 0usize;
        for chunk in pcm.chunks_exact(BYTES_PER_SAMPLE) {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            sum_sq += (sample as f64) * (sample as f64);
            peak = peak.max(sample.unsigned_abs());
            count += 1;
        }
        let rms = if count == 0 { 0.0 } else { (sum_sq / count as f64).sqrt() };
        Self {
            rms_percent: (rms / i16::MAX as f64 * 100.0) as f32,
            peak,
        }
    }

    pub fn is_silent(&self) -> bool {
        self.rms_percent < Self::SILENCE_THRESHOLD_PERCENT
    }
}
