//! Capture sources feeding the sender
//!
//! A [`CaptureSource`] hands out one frame's worth of s16le PCM per call and
//! blocks until the audio is available, which paces the sender at the
//! device's sample rate.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, SizedSample, StreamConfig};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::device::find_input_device;
use crate::error::AudioError;
use crate::protocol::{SessionConfig, BYTES_PER_SAMPLE};

/// Something that yields PCM frames on demand
pub trait CaptureSource: Send {
    /// Read up to `frame_size` samples per channel as s16le bytes.
    ///
    /// May return fewer bytes than a full frame around stream start or stop.
    fn read_frame(&mut self, frame_size: usize) -> Result<Vec<u8>, AudioError>;
}

/// Microphone capture through cpal
pub struct MicCapture {
    /// Requested device, or `None` for the host default
    device_name: Option<String>,
    config: StreamConfig,
    /// Cleared to stop the stream thread
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    /// Interleaved samples from the cpal callback
    sample_rx: Option<Receiver<Vec<i16>>>,
    /// Stream errors reported by cpal
    error_rx: Option<Receiver<AudioError>>,
    /// Samples received but not yet handed out
    pending: Vec<i16>,
    /// Longest wait for device data before returning a short frame
    read_timeout: Duration,
    /// Callback chunks lost because the reader fell behind
    chunks_dropped: Arc<AtomicU64>,
}

impl MicCapture {
    /// Prepare capture from the named device (or the default input device)
    pub fn new(device_name: Option<&str>, session: &SessionConfig) -> Result<Self, AudioError> {
        // fail early if the device is missing
        find_input_device(device_name)?;

        let config = StreamConfig {
            channels: session.channels,
            sample_rate: cpal::SampleRate(session.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        Ok(Self {
            device_name: device_name.map(str::to_string),
            config,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            sample_rx: None,
            error_rx: None,
            pending: Vec::new(),
            read_timeout: session.frame_duration() * 4 + Duration::from_millis(100),
            chunks_dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Start the device stream on a dedicated thread
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let device = find_input_device(self.device_name.as_deref())?;
        let sample_format = device
            .default_input_config()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?
            .sample_format();

        let (sample_tx, sample_rx) = bounded::<Vec<i16>>(64);
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        self.sample_rx = Some(sample_rx);
        self.error_rx = Some(error_rx);
        self.pending.clear();

        let running = self.running.clone();
        let dropped = self.chunks_dropped.clone();
        let config = self.config.clone();
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let stream = match sample_format {
                    SampleFormat::I16 => {
                        build_stream::<i16, _>(&device, &config, sample_tx, error_tx, dropped, |s| s)
                    }
                    SampleFormat::U16 => build_stream::<u16, _>(
                        &device,
                        &config,
                        sample_tx,
                        error_tx,
                        dropped,
                        |s| (s as i32 - 32768) as i16,
                    ),
                    SampleFormat::F32 => build_stream::<f32, _>(
                        &device,
                        &config,
                        sample_tx,
                        error_tx,
                        dropped,
                        |s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16,
                    ),
                    other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
                };

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep thread alive while running
                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);

        let started = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(AudioError::StreamError("capture thread exited".into())));
        if started.is_err() {
            self.stop();
        } else {
            tracing::info!(
                "Audio capture started: {}Hz, {} channel(s), {:?} samples",
                self.config.sample_rate.0,
                self.config.channels,
                sample_format
            );
        }
        started
    }

    /// Stop capturing audio
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Device callbacks discarded because the reader fell behind
    pub fn chunks_dropped(&self) -> u64 {
        self.chunks_dropped.load(Ordering::Relaxed)
    }
}

impl CaptureSource for MicCapture {
    fn read_frame(&mut self, frame_size: usize) -> Result<Vec<u8>, AudioError> {
        let (Some(sample_rx), Some(error_rx)) = (&self.sample_rx, &self.error_rx) else {
            return Err(AudioError::CaptureFailed("capture not started".into()));
        };

        let wanted = frame_size * self.config.channels as usize;
        let deadline = Instant::now() + self.read_timeout;

        while self.pending.len() < wanted {
            if let Ok(e) = error_rx.try_recv() {
                return Err(AudioError::CaptureFailed(e.to_string()));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match sample_rx.recv_timeout(remaining) {
                Ok(chunk) => self.pending.extend_from_slice(&chunk),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(AudioError::CaptureFailed("capture stream stopped".into()))
                }
            }
        }

        let take = wanted.min(self.pending.len());
        Ok(self
            .pending
            .drain(..take)
            .flat_map(|s| s.to_le_bytes())
            .collect())
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_stream<T, F>(
    device: &cpal::Device,
    config: &StreamConfig,
    sample_tx: Sender<Vec<i16>>,
    error_tx: Sender<AudioError>,
    dropped: Arc<AtomicU64>,
    convert: F,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample,
    F: Fn(T) -> i16 + Send + 'static,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let chunk: Vec<i16> = data.iter().map(|&s| convert(s)).collect();
                if sample_tx.try_send(chunk).is_err() {
                    dropped.fetch_add(1, Ordering::Relaxed);
                }
            },
            move |err| {
                let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
            },
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))
}

/// Sine generator paced at real time, for testing without a microphone
pub struct ToneSource {
    sample_rate: u32,
    channels: u16,
    /// Tone frequency in Hz
    frequency: f32,
    /// Peak level as a fraction of full scale
    amplitude: f32,
    /// Current phase in radians
    phase: f32,
    /// Duration of one frame at the session rate
    frame_period: Duration,
    /// When false, frames are produced as fast as they are read
    paced: bool,
    /// When the next frame is due
    next_deadline: Option<Instant>,
}

impl ToneSource {
    pub fn new(session: &SessionConfig, frequency: f32) -> Self {
        Self {
            sample_rate: session.sample_rate,
            channels: session.channels,
            frequency,
            amplitude: 0.5,
            phase: 0.0,
            frame_period: session.frame_duration(),
            paced: true,
            next_deadline: None,
        }
    }

    /// Generate frames as fast as they are requested
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    fn wait_for_cadence(&mut self) {
        if !self.paced {
            return;
        }
        let now = Instant::now();
        let deadline = *self.next_deadline.get_or_insert(now);
        if deadline > now {
            thread::sleep(deadline - now);
        }
        self.next_deadline = Some(deadline + self.frame_period);
    }
}

impl CaptureSource for ToneSource {
    fn read_frame(&mut self, frame_size: usize) -> Result<Vec<u8>, AudioError> {
        self.wait_for_cadence();

        let step = 2.0 * std::f32::consts::PI * self.frequency / self.sample_rate as f32;
        let mut out = Vec::with_capacity(frame_size * self.channels as usize * BYTES_PER_SAMPLE);
        for _ in 0..frame_size {
            let value = (self.phase.sin() * self.amplitude * i16::MAX as f32) as i16;
            for _ in 0..self.channels {
                out.extend_from_slice(&value.to_le_bytes());
            }
            self.phase = (self.phase + step) % (2.0 * std::f32::consts::PI);
        }
        Ok(out)
    }
}
