//! Sink writer: drains the jitter buffer into the playback sink
//!
//! The writer runs on its own thread for the lifetime of a session. When the
//! buffer runs dry it repeats the last frame instead of leaving a gap, and it
//! only stops once the receiver has finished and every buffered frame has
//! been written.

use crossbeam_channel::{bounded, Receiver};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::SharedJitterBuffer;
use crate::audio::gain::{apply_gain, GainState, SharedGain};
use crate::audio::sink::{SharedSinkFactory, Sink};
use crate::error::SinkError;
use crate::protocol::{AudioFrame, Quality};

/// Sink writer statistics
#[derive(Debug, Clone, Default)]
pub struct SinkWriterStats {
    /// Fresh frames taken from the buffer
    pub frames_written: u64,
    /// Underruns covered by repeating the previous frame
    pub frames_repeated: u64,
    pub flushes: u64,
    pub bytes_written: u64,
}

pub struct SinkWriter {
    /// Opened sink, or `None` until the factory opens one
    sink: Option<Box<dyn Sink>>,
    factory: Option<SharedSinkFactory>,
    buffer: SharedJitterBuffer,
    /// Writes between explicit flushes
    flush_interval: u64,
    /// Volume applied at the sink
    device_gain: SharedGain,
    /// Set to stop without draining; also cancels a pending sink open
    abort: Arc<AtomicBool>,
    /// Replayed when the buffer runs dry
    last_frame: Option<AudioFrame>,
    writes: u64,
    stats: SinkWriterStats,
}

impl SinkWriter {
    /// Writer for an already opened sink
    pub fn new(sink: Box<dyn Sink>, buffer: SharedJitterBuffer, quality: Quality) -> Self {
        let mut writer = Self::with_buffer(buffer, quality);
        writer.sink = Some(sink);
        writer
    }

    /// Writer that opens its sink from `factory` once it starts running
    pub fn from_factory(factory: SharedSinkFactory, buffer: SharedJitterBuffer, quality: Quality) -> Self {
        let mut writer = Self::with_buffer(buffer, quality);
        writer.factory = Some(factory);
        writer
    }

    fn with_buffer(buffer: SharedJitterBuffer, quality: Quality) -> Self {
        Self {
            sink: None,
            factory: None,
            buffer,
            flush_interval: quality.flush_interval().max(1),
            device_gain: Arc::new(GainState::default()),
            abort: Arc::new(AtomicBool::new(false)),
            last_frame: None,
            writes: 0,
            stats: SinkWriterStats::default(),
        }
    }

    /// Volume applied to every frame before it reaches the sink
    pub fn with_device_gain(mut self, gain: SharedGain) -> Self {
        self.device_gain = gain;
        self
    }

    /// Flag that stops the writer without draining
    pub fn with_abort(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = abort;
        self
    }

    /// Run until the buffer is drained, the sink fails or the writer is aborted
    pub fn run(mut self) -> Result<SinkWriterStats, SinkError> {
        let mut sink = match self.sink.take() {
            Some(sink) => sink,
            None => match self.open_sink()? {
                Some(sink) => sink,
                None => return Ok(self.stats),
            },
        };

        let result = self.pump(sink.as_mut());
        if let Err(e) = sink.close() {
            tracing::debug!("Error closing sink: {}", e);
        }
        result.map(|()| self.stats)
    }

    /// Spawn the writer on a dedicated thread
    pub fn spawn(self) -> io::Result<WriterHandle> {
        let (done_tx, done_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("sink-writer".to_string())
            .spawn(move || {
                let result = self.run();
                let _ = done_tx.send(());
                result
            })?;
        Ok(WriterHandle { done_rx, handle })
    }

    /// `Ok(None)` when the open was cancelled by the abort flag
    fn open_sink(&self) -> Result<Option<Box<dyn Sink>>, SinkError> {
        let Some(factory) = &self.factory else {
            return Err(SinkError::ResourceUnavailable("no sink configured".into()));
        };
        match factory.create(&self.abort) {
            Ok(sink) => Ok(Some(sink)),
            Err(_) if self.abort.load(Ordering::Relaxed) => Ok(None),
            Err(SinkError::Disconnected(msg)) => Err(SinkError::ResourceUnavailable(msg)),
            Err(e) => Err(e),
        }
    }

    fn pump(&mut self, sink: &mut dyn Sink) -> Result<(), SinkError> {
        while !self.abort.load(Ordering::Relaxed) {
            match self.buffer.pop() {
                Some(frame) => {
                    let gain = self.device_gain.get();
                    let frame = if gain == 1.0 {
                        frame
                    } else {
                        frame.map_payload(|pcm| apply_gain(pcm, gain))
                    };
                    self.write_frame(sink, &frame)?;
                    self.stats.frames_written += 1;
                    self.last_frame = Some(frame);
                }
                None if self.buffer.is_drained() => break,
                None => {
                    let Some(frame) = self.last_frame.take() else {
                        continue;
                    };
                    let result = self.write_frame(sink, &frame);
                    self.last_frame = Some(frame);
                    result?;
                    self.stats.frames_repeated += 1;
                }
            }
        }
        Ok(())
    }

    /// Write a whole frame, looping over partial writes
    fn write_frame(&mut self, sink: &mut dyn Sink, frame: &AudioFrame) -> Result<(), SinkError> {
        let data = frame.as_bytes();
        let mut written = 0;
        while written < data.len() {
            match sink.write(&data[written..]) {
                Ok(0) => return Err(SinkError::Disconnected("sink accepted no data".into())),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SinkError::Disconnected(e.to_string())),
            }
        }
        self.stats.bytes_written += written as u64;

        self.writes += 1;
        if self.writes % self.flush_interval == 0 {
            sink.flush().map_err(|e| SinkError::Disconnected(e.to_string()))?;
            self.stats.flushes += 1;
        }
        Ok(())
    }
}

/// Handle to a running sink writer thread
pub struct WriterHandle {
    done_rx: Receiver<()>,
    handle: JoinHandle<Result<SinkWriterStats, SinkError>>,
}

impl WriterHandle {
    /// Whether the writer has already exited
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait up to `timeout` for the writer to exit.
    ///
    /// Returns `None` if it is still running; the thread is then detached.
    pub fn wait(self, timeout: Duration) -> Option<Result<SinkWriterStats, SinkError>> {
        if self.done_rx.recv_timeout(timeout).is_err() && !self.handle.is_finished() {
            return None;
        }
        match self.handle.join() {
            Ok(result) => Some(result),
            Err(_) => Some(Err(SinkError::Disconnected("sink writer panicked".into()))),
        }
    }
}
