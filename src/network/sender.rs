//! Sending side: capture → gain → transmit
//!
//! One loop on one thread. Each iteration reads a frame from the capture
//! source, pads it to the negotiated size, applies the current gain and
//! writes it to the socket in full. Any capture or socket failure ends the
//! stream; reconnecting is up to the caller.

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::audio::capture::CaptureSource;
use crate::audio::gain::{apply_gain, FrameLevel, SharedGain};
use crate::config::ClientConfig;
use crate::error::{AudioError, NetworkError, Result};
use crate::network::socket;
use crate::protocol::{send_config, Fit, FrameGeometry, SessionConfig};

/// Frames between input level checks
pub const LEVEL_CHECK_INTERVAL: u64 = 500;

/// Sender statistics
#[derive(Debug, Clone, Default)]
pub struct SenderStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    /// Captured chunks that had to be zero-padded
    pub padded_frames: u64,
    /// Captured chunks longer than a frame, cut to size
    pub truncated_frames: u64,
}

/// Streams captured audio to a writer, one fixed-size frame at a time
pub struct AudioSender<C, W> {
    capture: C,
    /// Connection to the receiver, after the handshake
    writer: W,
    config: SessionConfig,
    geometry: FrameGeometry,
    /// Microphone volume, applied before sending
    gain: SharedGain,
    stats: SenderStats,
}

impl<C: CaptureSource, W: Write> AudioSender<C, W> {
    pub fn new(capture: C, writer: W, config: SessionConfig, gain: SharedGain) -> Self {
        Self {
            capture,
            writer,
            geometry: config.geometry(),
            config,
            gain,
            stats: SenderStats::default(),
        }
    }

    /// Capture, process and transmit one frame
    pub fn send_frame(&mut self) -> Result<()> {
        let chunk = self
            .capture
            .read_frame(self.config.frame_size as usize)
            .map_err(|e| match e {
                AudioError::CaptureFailed(_) => e,
                other => AudioError::CaptureFailed(other.to_string()),
            })?;

        let (frame, fit) = self.geometry.normalize(chunk);
        match fit {
            Fit::Exact => {}
            Fit::Padded(n) => {
                self.stats.padded_frames += 1;
                tracing::debug!("Short capture, padded {} bytes of silence", n);
            }
            Fit::Truncated(n) => {
                self.stats.truncated_frames += 1;
                tracing::debug!("Oversized capture, dropped {} bytes", n);
            }
        }

        let mut pcm = frame.to_vec();

        if self.stats.frames_sent % LEVEL_CHECK_INTERVAL == 0 {
            self.check_level(&pcm);
        }

        // one gain snapshot per frame
        let gain = self.gain.get();
        apply_gain(&mut pcm, gain);

        self.writer
            .write_all(&pcm)
            .map_err(|e| NetworkError::TransmitFailed(e.to_string()))?;

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += pcm.len() as u64;
        if self.stats.frames_sent % 100 == 0 {
            tracing::trace!("Sent {} audio frames", self.stats.frames_sent);
        }
        Ok(())
    }

    /// Stream until `shutdown` is set or an error ends the session
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<SenderStats> {
        tracing::info!("Streaming {}", self.config);
        while !shutdown.load(Ordering::Relaxed) {
            if let Err(e) = self.send_frame() {
                tracing::error!("Stream ended after {} frames: {}", self.stats.frames_sent, e);
                return Err(e);
            }
        }
        tracing::info!("Stream stopped after {} frames", self.stats.frames_sent);
        Ok(self.stats.clone())
    }

    pub fn stats(&self) -> &SenderStats {
        &self.stats
    }

    fn check_level(&self, pcm: &[u8]) {
        let level = FrameLevel::measure(pcm);
        if self.stats.frames_sent == 0 {
            tracing::info!(
                "Input level: RMS {:.1}%, peak {}",
                level.rms_percent,
                level.peak
            );
        } else if level.is_silent() {
            tracing::warn!(
                "Very low input level (RMS {:.2}%), microphone may be muted",
                level.rms_percent
            );
        }
    }
}

/// Connect to the server, announce the session and stream until stopped
pub fn stream_to_server<C: CaptureSource>(
    client: &ClientConfig,
    capture: C,
    gain: SharedGain,
    shutdown: &AtomicBool,
) -> Result<SenderStats> {
    let session = client.session_config()?;
    let addr = socket::resolve(&client.host, client.port)?;

    let mut stream = socket::connect(addr, client.connect_timeout(), client.send_buffer_size)?;
    tracing::info!("Connected to server at {}", addr);

    send_config(&mut stream, &session).map_err(|e| NetworkError::TransmitFailed(e.to_string()))?;
    tracing::info!("Audio configuration sent: {}", session.to_config_line().trim_end());

    let mut sender: AudioSender<C, TcpStream> = AudioSender::new(capture, stream, session, gain);
    sender.run(shutdown)
}
