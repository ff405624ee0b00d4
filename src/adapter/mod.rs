//! Stream Adapters
//!
//! Per-stream-type strategies plugged into the decode engine. An adapter
//! decides what the device must be started with, inspects each submitted
//! unit for parameter-set changes, resets its own state on flush, and turns
//! device output buffers into frames or samples.
//!
//! Hooks run with the engine lock held and must not block.

mod audio;
mod video;

pub use audio::AudioAdapter;
pub use video::VideoAdapter;

use std::sync::Arc;

use bytes::Bytes;

use crate::device::{Capabilities, DeviceBinding, OutputBuffer, OutputFormat, Quirks, StartParams};
use crate::engine::EngineError;
use crate::media::{
    AudioSample, Codec, CompressedUnit, CsdQueue, InflightTable, StreamKind, TimestampFifo,
    VideoFrame,
};

/// Description of the elementary stream to decode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFormat {
    pub codec: Codec,
    pub width: u32,
    pub height: u32,
    /// Clockwise rotation in degrees
    pub rotation: u32,
    pub sample_rate: u32,
    pub channels: u32,
    /// Out-of-band codec configuration from the container
    pub extradata: Option<Bytes>,
}

impl StreamFormat {
    pub fn video(codec: Codec, width: u32, height: u32) -> Self {
        Self {
            codec,
            width,
            height,
            rotation: 0,
            sample_rate: 0,
            channels: 0,
            extradata: None,
        }
    }

    pub fn audio(codec: Codec, sample_rate: u32, channels: u32) -> Self {
        Self {
            codec,
            width: 0,
            height: 0,
            rotation: 0,
            sample_rate,
            channels,
            extradata: None,
        }
    }

    pub fn with_extradata(mut self, extradata: impl Into<Bytes>) -> Self {
        self.extradata = Some(extradata.into());
        self
    }

    pub fn with_rotation(mut self, rotation: u32) -> Self {
        self.rotation = rotation % 360;
        self
    }
}

/// Parameter sets found in extradata or in-band
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSets {
    pub blobs: Vec<Bytes>,
    /// Coded size, 0 when the parser could not tell
    pub width: u32,
    pub height: u32,
}

/// Codec bitstream collaborator.
///
/// Splitting parameter sets and converting payloads between framings is
/// codec specific and lives outside the engine.
pub trait ParameterSetParser: Send {
    /// Split container extradata into CSD blobs. `None` sends it as one blob.
    fn parse_extradata(&mut self, extradata: &[u8]) -> Option<ParameterSets>;

    /// Parameter sets carried by this unit, if any
    fn inspect(&mut self, unit: &CompressedUnit) -> Option<ParameterSets>;

    /// Convert the payload into the framing the device expects
    fn rewrite(&mut self, data: Bytes) -> Bytes {
        data
    }
}

/// Parser that knows no bitstream syntax. Units flagged as codec config
/// are taken whole as a single parameter set.
#[derive(Debug, Default)]
pub struct PassthroughParser;

impl ParameterSetParser for PassthroughParser {
    fn parse_extradata(&mut self, _extradata: &[u8]) -> Option<ParameterSets> {
        None
    }

    fn inspect(&mut self, unit: &CompressedUnit) -> Option<ParameterSets> {
        if !unit.flags.codec_config || unit.data.is_empty() {
            return None;
        }
        Some(ParameterSets {
            blobs: vec![unit.data.clone()],
            ..Default::default()
        })
    }
}

/// Whether the device can be started now
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartDecision {
    Ready(StartParams),
    /// Wait for the stream to supply what is missing
    Defer(&'static str),
}

/// What the engine should do with a submitted unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputAction {
    /// Discard the unit
    pub drop: bool,
    /// Compatible parameter change: flush before sending
    pub flush: bool,
    /// Incompatible parameter change: stop and start before sending
    pub restart: bool,
}

impl InputAction {
    pub fn send() -> Self {
        Self::default()
    }

    pub fn drop_unit() -> Self {
        Self {
            drop: true,
            ..Default::default()
        }
    }
}

/// Engine state visible to `on_new_input`
pub struct InputContext<'a> {
    pub csd: &'a mut CsdQueue,
    /// Device session is running
    pub started: bool,
    pub capabilities: Capabilities,
}

/// Engine state visible to `process_output`
pub struct OutputContext<'a> {
    pub timestamps: &'a mut TimestampFifo,
    /// Outputs at or before this timestamp are dropped
    pub preroll_end: Option<i64>,
    pub device: &'a dyn DeviceBinding,
    pub inflight: &'a Arc<InflightTable>,
    pub direct_rendering: bool,
}

impl OutputContext<'_> {
    /// Hand a buffer back to the device without rendering it
    pub fn discard(&self, index: usize) {
        if let Err(e) = self.device.release_output(index, false) {
            log::warn!("Failed to release output buffer {}: {}", index, e);
        }
    }
}

/// Decoded output produced by an adapter
#[derive(Debug)]
pub enum Decoded {
    Video(VideoFrame),
    Audio(AudioSample),
}

pub trait StreamAdapter: Send {
    fn kind(&self) -> StreamKind;

    /// Quirks resolved for the bound decoder
    fn quirks(&self) -> Quirks;

    /// Build device start parameters, turning extradata into CSD on first use
    fn start_params(
        &mut self,
        csd: &mut CsdQueue,
        direct_rendering: bool,
    ) -> Result<StartDecision, EngineError>;

    /// Inspect and possibly rewrite a unit before it is sent
    fn on_new_input(
        &mut self,
        unit: &mut CompressedUnit,
        ctx: &mut InputContext<'_>,
    ) -> Result<InputAction, EngineError>;

    /// Reset per-generation state. Runs before the device is flushed.
    fn on_flush(&mut self, inflight: &InflightTable);

    /// Validate and adopt a new output format
    fn on_format(&mut self, format: &OutputFormat) -> Result<(), EngineError>;

    /// Turn one output buffer into a frame or sample, or drop it.
    /// The adapter owns the buffer: it releases or retains the slot.
    fn process_output(
        &mut self,
        buffer: OutputBuffer,
        ctx: &mut OutputContext<'_>,
    ) -> Result<Option<Decoded>, EngineError>;

    /// Whether accepted units push into the timestamp FIFO
    fn tracks_timestamps(&self) -> bool {
        true
    }
}

/// Create the adapter matching the stream's kind
pub fn for_stream(
    format: StreamFormat,
    decoder_name: &str,
    parser: Box<dyn ParameterSetParser>,
) -> Box<dyn StreamAdapter> {
    match format.codec.kind() {
        StreamKind::Video => Box::new(VideoAdapter::new(format, decoder_name, parser)),
        StreamKind::Audio => Box::new(AudioAdapter::new(format, decoder_name, parser)),
    }
}
