//! Network subsystem for TCP audio transport

pub mod receiver;
pub mod sender;
pub mod socket;

pub use receiver::{AudioReceiver, FrameReader, ReadOutcome, ReceiverStats};
pub use sender::{stream_to_server, AudioSender, SenderStats};
pub use socket::{bind_listener, connect, resolve, tune_accepted};
