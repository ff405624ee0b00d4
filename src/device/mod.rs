//! Device Bindings
//!
//! Contract between the decode engine and a stateful hardware decoder.
//! A binding owns the device's buffer slots; the engine dequeues, fills and
//! queues input slots, and dequeues, reads and releases output slots.
//!
//! Every method takes `&self`: the submit path and the output thread call
//! into the binding concurrently, and only `dequeue_input` and
//! `dequeue_output` are allowed to block.

pub mod loopback;
pub mod quirks;
pub mod registry;

pub use loopback::{LoopbackConfig, LoopbackDevice, LoopbackFactory};
pub use quirks::Quirks;
pub use registry::DeviceFactory;

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::media::Codec;

/// Device binding errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device rejected configuration: {0}")]
    Configure(String),

    #[error("device is not started")]
    NotStarted,

    #[error("invalid buffer index {0}")]
    InvalidIndex(usize),

    #[error("input too large for device buffer ({size} > {capacity})")]
    BufferTooSmall { size: usize, capacity: usize },

    #[error("no decoder available for {0}")]
    Unavailable(String),

    #[error("device failure: {0}")]
    Failure(String),
}

/// Static properties of a binding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Output pictures can stay in device memory
    pub direct_rendering: bool,
    /// Decoder copes with interlaced content
    pub interlaced: bool,
}

/// Stream shape the device is configured with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartFormat {
    Video {
        width: u32,
        height: u32,
        /// Clockwise rotation in degrees
        rotation: u32,
        direct_rendering: bool,
    },
    Audio {
        sample_rate: u32,
        channels: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartParams {
    pub codec: Codec,
    pub mime: &'static str,
    pub format: StartFormat,
}

/// Result of an input slot request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSlot {
    Index(usize),
    TryAgain,
}

/// Input handed to a dequeued slot. The binding copies `data` before returning.
#[derive(Debug, Clone, Copy)]
pub struct InputBuffer<'a> {
    pub data: &'a [u8],
    pub pts: Option<i64>,
    pub is_config: bool,
    pub eos: bool,
}

/// Result of an output dequeue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputEvent {
    Buffer(usize),
    TryAgain,
    FormatChanged,
    BuffersChanged,
}

/// Decoded output buffer
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    pub index: usize,
    pub pts: i64,
    /// Payload, absent when the picture stays in device memory
    pub data: Option<Bytes>,
    pub eos: bool,
}

/// Raw video output shape as reported by the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoOutputFormat {
    pub width: i32,
    pub height: i32,
    pub stride: i32,
    pub slice_height: i32,
    pub color_format: i32,
    pub crop_left: i32,
    pub crop_top: i32,
    pub crop_right: i32,
    pub crop_bottom: i32,
}

/// Raw audio output shape as reported by the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioOutputFormat {
    pub channels: i32,
    pub channel_mask: i32,
    pub sample_rate: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Video(VideoOutputFormat),
    Audio(AudioOutputFormat),
}

/// What `get_output` resolves an event into
#[derive(Debug, Clone)]
pub enum OutputDescriptor {
    Buffer(OutputBuffer),
    Format(OutputFormat),
}

/// A stateful hardware decoder
pub trait DeviceBinding: Send + Sync {
    /// Decoder component name, used for quirk lookup
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    fn start(&self, params: &StartParams) -> Result<(), DeviceError>;

    /// Stop the session. Wakes any thread blocked in a dequeue.
    fn stop(&self) -> Result<(), DeviceError>;

    /// Discard queued input and pending output. A blocked `dequeue_output`
    /// returns promptly; if none is blocked, the next one does.
    fn flush(&self) -> Result<(), DeviceError>;

    fn dequeue_input(&self, timeout: Duration) -> Result<InputSlot, DeviceError>;

    fn queue_input(&self, index: usize, buffer: InputBuffer<'_>) -> Result<(), DeviceError>;

    /// Wait for output. `None` waits until the device produces something,
    /// is flushed, or is stopped.
    fn dequeue_output(&self, timeout: Option<Duration>) -> Result<OutputEvent, DeviceError>;

    /// Resolve a dequeued event. `BuffersChanged` and `TryAgain` resolve to `None`.
    fn get_output(&self, event: &OutputEvent) -> Result<Option<OutputDescriptor>, DeviceError>;

    fn release_output(&self, index: usize, render: bool) -> Result<(), DeviceError>;
}
