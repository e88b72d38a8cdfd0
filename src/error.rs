//! Error types for the microphone relay

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error must stop the whole server rather than one session
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Sink(SinkError::ResourceUnavailable(_)))
    }
}

/// Configuration line exchange errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Malformed handshake: {0}")]
    Malformed(String),

    #[error("Handshake timed out")]
    Timeout,
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transmit failed: {0}")]
    TransmitFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

/// Playback sink errors
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink disconnected: {0}")]
    Disconnected(String),

    #[error("Sink resource unavailable: {0}")]
    ResourceUnavailable(String),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
