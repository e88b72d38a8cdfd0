//! Receiving side: socket → fixed-size frames → jitter buffer
//!
//! Frames arrive back-to-back with no delimiter, so the reader keeps
//! reading until it has exactly one frame's worth of bytes. A read timeout
//! only means the sender is idle; a peer close in the middle of a frame
//! still delivers the partial audio, zero-padded, as a final frame.

use std::io::{self, Read};

use crate::audio::buffer::{PushOutcome, SharedJitterBuffer};
use crate::error::NetworkError;
use crate::protocol::{AudioFrame, Fit, FrameGeometry};

/// Result of one attempt to read a frame
#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete frame
    Frame(AudioFrame),
    /// The peer closed mid-frame; the partial data was zero-padded
    Final(AudioFrame),
    /// The peer closed on a frame boundary
    Closed,
    /// The read timed out before a frame completed; bytes read so far are kept
    Idle,
}

/// Splits a byte stream into frames of a fixed size
pub struct FrameReader<R> {
    reader: R,
    geometry: FrameGeometry,
    /// Frame being assembled, always `frame_bytes` long
    buf: Vec<u8>,
    /// Bytes of `buf` received so far
    filled: usize,
    /// Sequence number of the next complete frame
    sequence: u64,
    /// Set once the peer has closed the connection
    closed: bool,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, geometry: FrameGeometry) -> Self {
        Self {
            reader,
            buf: vec![0u8; geometry.frame_bytes()],
            geometry,
            filled: 0,
            sequence: 0,
            closed: false,
        }
    }

    /// Bytes of the current frame read so far
    pub fn pending(&self) -> usize {
        self.filled
    }

    /// Read until one frame is complete, the peer closes, or the read times out
    pub fn read_frame(&mut self) -> io::Result<ReadOutcome> {
        if self.closed {
            return Ok(ReadOutcome::Closed);
        }

        while self.filled < self.buf.len() {
            match self.reader.read(&mut self.buf[self.filled..]) {
                Ok(0) => {
                    self.closed = true;
                    if self.filled == 0 {
                        return Ok(ReadOutcome::Closed);
                    }
                    tracing::debug!(
                        "Peer closed mid-frame after {} of {} bytes",
                        self.filled,
                        self.buf.len()
                    );
                    return Ok(ReadOutcome::Final(self.take_frame()));
                }
                Ok(n) => self.filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    return Ok(ReadOutcome::Idle)
                }
                Err(e) => return Err(e),
            }
        }

        Ok(ReadOutcome::Frame(self.take_frame()))
    }

    fn take_frame(&mut self) -> AudioFrame {
        let data = self.buf[..self.filled].to_vec();
        self.filled = 0;
        let (frame, fit) = self.geometry.normalize(data);
        if let Fit::Truncated(n) = fit {
            tracing::warn!("Dropped {} excess bytes from oversized frame", n);
        }
        let frame = frame.with_sequence(self.sequence);
        self.sequence += 1;
        frame
    }
}

/// Receiver statistics
#[derive(Debug, Clone, Default)]
pub struct ReceiverStats {
    pub frames_received: u64,
    pub bytes_received: u64,
    /// Read timeouts while waiting for the sender
    pub idle_timeouts: u64,
    /// Frames dropped from the jitter buffer to make room
    pub frames_evicted: u64,
    /// The stream ended with a zero-padded partial frame
    pub ended_mid_frame: bool,
}

/// Feeds frames from the connection into the jitter buffer
pub struct AudioReceiver<R> {
    reader: FrameReader<R>,
    buffer: SharedJitterBuffer,
    stats: ReceiverStats,
}

impl<R: Read> AudioReceiver<R> {
    pub fn new(reader: R, geometry: FrameGeometry, buffer: SharedJitterBuffer) -> Self {
        Self {
            reader: FrameReader::new(reader, geometry),
            buffer,
            stats: ReceiverStats::default(),
        }
    }

    /// Receive until the peer disconnects, `should_stop` returns true, or a
    /// socket error occurs. The jitter buffer is marked finished on return.
    pub fn run(&mut self, should_stop: impl Fn() -> bool) -> Result<ReceiverStats, NetworkError> {
        let result = self.pump(should_stop);
        self.buffer.finish();
        result.map(|()| self.stats.clone())
    }

    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }

    fn pump(&mut self, should_stop: impl Fn() -> bool) -> Result<(), NetworkError> {
        while !should_stop() {
            let outcome = self
                .reader
                .read_frame()
                .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;

            match outcome {
                ReadOutcome::Frame(frame) => self.deliver(frame),
                ReadOutcome::Final(frame) => {
                    self.stats.ended_mid_frame = true;
                    self.deliver(frame);
                    tracing::info!("Client disconnected mid-frame");
                    return Ok(());
                }
                ReadOutcome::Closed => {
                    tracing::info!("Client disconnected");
                    return Ok(());
                }
                ReadOutcome::Idle => self.stats.idle_timeouts += 1,
            }
        }
        Ok(())
    }

    fn deliver(&mut self, frame: AudioFrame) {
        self.stats.frames_received += 1;
        self.stats.bytes_received += frame.len() as u64;
        if let PushOutcome::Evicted(n) = self.buffer.push(frame) {
            self.stats.frames_evicted += n as u64;
        }
    }
}
