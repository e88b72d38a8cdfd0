//! Jitter buffer between the network receiver and the sink writer
//!
//! A bounded FIFO of fixed-size frames built on a crossbeam channel. The
//! producer side never blocks: when the buffer is full the oldest frames are
//! dropped down to a quality-dependent minimum so the newest frame always
//! fits, which bounds latency while keeping some audio in reserve.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::{AudioFrame, Quality};

/// Result of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Appended without dropping anything
    Queued,
    /// Appended after dropping this many of the oldest frames
    Evicted(usize),
}

/// Bounded single-producer single-consumer frame queue
pub struct JitterBuffer {
    tx: Sender<AudioFrame>,
    /// Consumer end; the producer also uses it to evict the oldest frames
    rx: Receiver<AudioFrame>,
    capacity: usize,
    min_buffer: usize,
    pop_timeout: Duration,
    /// Set by the producer once no further frames will arrive
    finished: AtomicBool,
    pushed: AtomicUsize,
    /// Frames dropped from the front on overflow
    evicted: AtomicUsize,
    /// Pops that timed out on an empty buffer
    underruns: AtomicUsize,
}

impl JitterBuffer {
    /// Create a buffer tuned for the given quality preset
    pub fn for_quality(quality: Quality) -> Self {
        Self::new(quality.buffer_capacity(), quality.min_buffer(), quality.pop_timeout())
    }

    /// Create a buffer with explicit tuning; `min_buffer` must be below `capacity`
    pub fn new(capacity: usize, min_buffer: usize, pop_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            min_buffer: min_buffer.min(capacity - 1),
            pop_timeout,
            finished: AtomicBool::new(false),
            pushed: AtomicUsize::new(0),
            evicted: AtomicUsize::new(0),
            underruns: AtomicUsize::new(0),
        }
    }

    /// Append a frame, evicting the oldest frames if the buffer is full
    pub fn push(&self, frame: AudioFrame) -> PushOutcome {
        self.pushed.fetch_add(1, Ordering::Relaxed);

        let frame = match self.tx.try_send(frame) {
            Ok(()) => return PushOutcome::Queued,
            Err(TrySendError::Full(frame)) => frame,
            // both ends live in self, so the channel cannot disconnect
            Err(TrySendError::Disconnected(_)) => return PushOutcome::Queued,
        };

        let mut dropped = 0;
        let to_drop = self.rx.len().saturating_sub(self.min_buffer).max(1);
        while dropped < to_drop && self.rx.try_recv().is_ok() {
            dropped += 1;
        }

        let mut pending = frame;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => break,
                Err(TrySendError::Full(frame)) => {
                    // still full: drop exactly one more and try again
                    if self.rx.try_recv().is_ok() {
                        dropped += 1;
                    }
                    pending = frame;
                }
                Err(TrySendError::Disconnected(_)) => break,
            }
        }

        self.evicted.fetch_add(dropped, Ordering::Relaxed);
        tracing::trace!("Jitter buffer full, dropped {} oldest frame(s)", dropped);
        PushOutcome::Evicted(dropped)
    }

    /// Take the oldest frame, waiting up to the configured pop timeout
    pub fn pop(&self) -> Option<AudioFrame> {
        self.pop_timeout(self.pop_timeout)
    }

    /// Take the oldest frame, waiting up to `timeout`
    pub fn pop_timeout(&self, timeout: Duration) -> Option<AudioFrame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                self.underruns.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Mark the end of the producer's stream
    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }

    /// Whether the producer has stopped
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Whether the producer has stopped and everything has been consumed
    pub fn is_drained(&self) -> bool {
        self.is_finished() && self.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn min_buffer(&self) -> usize {
        self.min_buffer
    }

    /// Get statistics
    pub fn stats(&self) -> JitterBufferStats {
        JitterBufferStats {
            level: self.len(),
            capacity: self.capacity,
            pushed: self.pushed.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
        }
    }
}

/// Thread-safe handle to a jitter buffer
pub type SharedJitterBuffer = Arc<JitterBuffer>;

/// Jitter buffer statistics
#[derive(Debug, Clone, Default)]
pub struct JitterBufferStats {
    /// Frames queued when the stats were taken
    pub level: usize,
    pub capacity: usize,
    pub pushed: usize,
    pub evicted: usize,
    pub underruns: usize,
}

impl JitterBufferStats {
    pub fn drop_rate(&self) -> f32 {
        if self.pushed == 0 {
            0.0
        } else {
            self.evicted as f32 / self.pushed as f32
        }
    }
}
