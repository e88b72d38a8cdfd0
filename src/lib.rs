//! # Mic Relay
//!
//! Low-latency microphone relay over a LAN.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────── SENDER PC ────────────────────────────┐
//! │  ┌────────────┐   ┌────────────┐   ┌────────────────────────────┐ │
//! │  │ Microphone │──▶│ Gain/level │──▶│ AudioSender (TCP, NODELAY) │ │
//! │  │ (cpal)     │   │ (audio::   │   │ CONFIG line, then raw      │ │
//! │  └────────────┘   │  gain)     │   │ s16le frames               │ │
//! │                   └────────────┘   └─────────────┬──────────────┘ │
//! └──────────────────────────────────────────────────┼────────────────┘
//!                                                    │ TCP over LAN
//! ┌─────────────────────────── RECEIVER PC ──────────┼────────────────┐
//! │                                                  ▼                │
//! │  ┌──────────────────────────────────────────────────────────────┐ │
//! │  │ Server (session) Listening → Handshaking → Streaming →       │ │
//! │  │                  Draining → Listening                        │ │
//! │  └──────────────────────────────────────────────────────────────┘ │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐           │
//! │  │ AudioReceiver│──▶│ JitterBuffer │──▶│ SinkWriter   │──▶ Sink   │
//! │  │ (frames)     │   │ (drop oldest)│   │ (own thread) │  (FIFO of │
//! │  └──────────────┘   └──────────────┘   └──────────────┘  virtual  │
//! │                                                           mic)    │
//! └───────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod session;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Name used for the config directory
    pub const APP_NAME: &str = "mic-relay";

    /// Default sample rate announced by the sender
    pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

    /// Default channel count (mono)
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Default frames per chunk
    pub const DEFAULT_FRAME_SIZE: u32 = 128;

    /// Default TCP port for audio streaming
    pub const DEFAULT_PORT: u16 = 5000;

    /// Default sink, the FIFO read by the virtual microphone source
    pub const DEFAULT_SINK_PATH: &str = "/tmp/mic-relay.pipe";

    /// Total time allowed for the client to send its configuration line
    pub const HANDSHAKE_TIMEOUT_MS: u64 = 5000;

    /// Socket read timeout while streaming
    pub const READ_TIMEOUT_MS: u64 = 100;

    /// Upper bound on flushing buffered audio at session end
    pub const DRAIN_TIMEOUT_MS: u64 = 3000;

    pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

    /// Kernel socket buffer size; kept small to bound latency
    pub const SOCKET_BUFFER_SIZE: usize = 8192;
}
