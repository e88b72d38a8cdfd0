//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod gain;
pub mod sink;
pub mod writer;

pub use buffer::{JitterBuffer, PushOutcome, SharedJitterBuffer};
pub use capture::{CaptureSource, MicCapture, ToneSource};
pub use device::{find_input_device, list_input_devices, InputDeviceInfo};
pub use gain::{apply_gain, FrameLevel, GainState, SharedGain};
pub use sink::{
    FileSink, FileSinkFactory, SharedSinkFactory, Sink, SinkFactory, SinkTarget, StdoutSink,
};
pub use writer::{SinkWriter, SinkWriterStats, WriterHandle};
