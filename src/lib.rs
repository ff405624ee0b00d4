//! HW Codec Bridge Library
//!
//! Coordination layer between elementary streams and stateful hardware
//! decoders: input submission, codec-specific data, timestamp correction,
//! flush and restart, and a dedicated output thread feeding a sink.

pub mod adapter;
pub mod config;
pub mod device;
pub mod engine;
pub mod media;
pub mod utils;

pub use adapter::{ParameterSetParser, PassthroughParser, StreamFormat};
pub use config::EngineConfig;
pub use device::{DeviceBinding, DeviceError, LoopbackDevice};
pub use engine::{DecodeEngine, EngineError, EngineState, EngineStats, StartOutcome, SubmitStatus};
pub use media::{Codec, CompressedUnit, FrameSink, UnitFlags, VideoFrame};
