//! Fixed-size PCM frames
//!
//! Every frame that enters the jitter buffer or reaches a sink is exactly
//! `frame_size * channels * 2` bytes. Short input is zero-padded and long
//! input truncated at the point of ingestion, so nothing downstream has to
//! care about partial data.

use bytes::Bytes;

/// Bytes per signed 16-bit sample
pub const BYTES_PER_SAMPLE: usize = 2;

/// Layout of one frame: samples per channel and channel count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    frame_size: usize,
    channels: u16,
}

/// How an incoming buffer had to be adjusted to fit the frame size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fit {
    Exact,
    /// Number of zero bytes appended
    Padded(usize),
    /// Number of bytes dropped from the tail
    Truncated(usize),
}

impl FrameGeometry {
    pub fn new(frame_size: usize, channels: u16) -> Self {
        Self {
            frame_size,
            channels,
        }
    }

    /// Samples per channel
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Interleaved samples per frame
    pub fn samples_per_frame(&self) -> usize {
        self.frame_size * self.channels as usize
    }

    /// Bytes per frame on the wire
    pub fn frame_bytes(&self) -> usize {
        self.samples_per_frame() * BYTES_PER_SAMPLE
    }

    /// Classify a buffer length against the frame size
    pub fn fit(&self, len: usize) -> Fit {
        let expected = self.frame_bytes();
        match len.cmp(&expected) {
            std::cmp::Ordering::Equal => Fit::Exact,
            std::cmp::Ordering::Less => Fit::Padded(expected - len),
            std::cmp::Ordering::Greater => Fit::Truncated(len - expected),
        }
    }

    /// Turn an arbitrary buffer into an exact-length frame
    pub fn normalize(&self, mut data: Vec<u8>) -> (AudioFrame, Fit) {
        let fit = self.fit(data.len());
        data.resize(self.frame_bytes(), 0);
        (AudioFrame::from_exact(data), fit)
    }

    /// A frame of digital silence
    pub fn silence(&self) -> AudioFrame {
        AudioFrame::from_exact(vec![0u8; self.frame_bytes()])
    }
}

/// One exact-length chunk of interleaved s16le PCM
#[derive(Clone, PartialEq, Eq)]
pub struct AudioFrame {
    data: Bytes,
    sequence: u64,
}

impl AudioFrame {
    fn from_exact(data: Vec<u8>) -> Self {
        Self {
            data: Bytes::from(data),
            sequence: 0,
        }
    }

    /// Tag the frame with its arrival order
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Decoded samples
    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.data
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
    }

    /// Copy the payload out for in-place processing
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    /// Replace the payload with processed audio of the same length
    pub fn map_payload(self, f: impl FnOnce(&mut [u8])) -> Self {
        let mut data = self.data.to_vec();
        f(&mut data);
        Self {
            data: Bytes::from(data),
            sequence: self.sequence,
        }
    }
}

impl std::fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFrame")
            .field("sequence", &self.sequence)
            .field("len", &self.data.len())
            .finish()
    }
}
