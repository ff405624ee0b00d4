//! Audio stream adapter
//!
//! Audio devices do not reorder, so output timestamps come from a running
//! clock seeded by the first input pts instead of the timestamp FIFO.

use log::{debug, info, warn};

use super::{
    Decoded, InputAction, InputContext, OutputContext, ParameterSetParser, StartDecision,
    StreamAdapter, StreamFormat,
};
use crate::device::{OutputBuffer, OutputFormat, Quirks, StartFormat, StartParams};
use crate::engine::EngineError;
use crate::media::{AudioSample, CompressedUnit, CsdQueue, InflightTable, StreamKind};
use crate::utils::AudioClock;

const MAX_CHANNELS: i32 = 8;
const BYTES_PER_SAMPLE: usize = 2;

pub struct AudioAdapter {
    format: StreamFormat,
    quirks: Quirks,
    parser: Box<dyn ParameterSetParser>,
    clock: AudioClock,
    /// Output channel count, known once the device reported its format
    channels: Option<u32>,
}

impl AudioAdapter {
    pub fn new(format: StreamFormat, decoder_name: &str, parser: Box<dyn ParameterSetParser>) -> Self {
        let quirks = Quirks::lookup(format.codec, decoder_name);
        debug!("Audio quirks for {} ({}): {:?}", decoder_name, format.codec, quirks);
        let clock = AudioClock::new(format.sample_rate);
        Self {
            format,
            quirks,
            parser,
            clock,
            channels: None,
        }
    }
}

impl StreamAdapter for AudioAdapter {
    fn kind(&self) -> StreamKind {
        StreamKind::Audio
    }

    fn quirks(&self) -> Quirks {
        self.quirks
    }

    fn start_params(
        &mut self,
        csd: &mut CsdQueue,
        _direct_rendering: bool,
    ) -> Result<StartDecision, EngineError> {
        if csd.is_empty() {
            if let Some(extradata) = self.format.extradata.clone().filter(|e| !e.is_empty()) {
                let blobs = self
                    .parser
                    .parse_extradata(&extradata)
                    .map(|sets| sets.blobs)
                    .unwrap_or_else(|| vec![extradata]);
                csd.replace_if_changed(blobs);
            }
        }

        if self.quirks.need_csd && csd.is_empty() {
            return Ok(StartDecision::Defer("waiting for codec-specific data"));
        }
        if self.quirks.need_channels && self.format.channels == 0 {
            return Ok(StartDecision::Defer("waiting for a valid channel count"));
        }

        self.channels = None;
        Ok(StartDecision::Ready(StartParams {
            codec: self.format.codec,
            mime: self.format.codec.mime(),
            format: StartFormat::Audio {
                sample_rate: self.format.sample_rate,
                channels: self.format.channels,
            },
        }))
    }

    fn on_new_input(
        &mut self,
        unit: &mut CompressedUnit,
        ctx: &mut InputContext<'_>,
    ) -> Result<InputAction, EngineError> {
        let mut action = InputAction::send();
        if let Some(sets) = self.parser.inspect(unit) {
            if ctx.csd.replace_if_changed(sets.blobs) {
                if ctx.started {
                    action.flush = true;
                } else {
                    action.restart = true;
                }
            }
        }
        if unit.flags.codec_config {
            action.drop = true;
            return Ok(action);
        }

        // the clock starts at the first timestamped unit
        if self.clock.date().is_none() {
            match unit.pts {
                Some(pts) => self.clock.set(pts),
                None => {
                    debug!("Waiting for a valid pts, dropping audio unit");
                    action.drop = true;
                    return Ok(action);
                }
            }
        }

        let data = std::mem::take(&mut unit.data);
        unit.data = self.parser.rewrite(data);
        Ok(action)
    }

    fn on_flush(&mut self, _inflight: &InflightTable) {
        self.clock.reset();
    }

    fn on_format(&mut self, format: &OutputFormat) -> Result<(), EngineError> {
        let OutputFormat::Audio(a) = format else {
            return Err(EngineError::Configuration("video format on an audio stream".into()));
        };
        if a.channels <= 0 || a.channels > MAX_CHANNELS || a.sample_rate <= 0 {
            return Err(EngineError::Unsupported(format!(
                "invalid audio properties: {} channels, {} Hz",
                a.channels, a.sample_rate
            )));
        }
        info!(
            "Output: {} channels (mask {:#x}), {} Hz",
            a.channels, a.channel_mask, a.sample_rate
        );
        self.channels = Some(a.channels as u32);
        self.clock.set_rate(a.sample_rate as u32);
        Ok(())
    }

    fn process_output(
        &mut self,
        buffer: OutputBuffer,
        ctx: &mut OutputContext<'_>,
    ) -> Result<Option<Decoded>, EngineError> {
        let Some(channels) = self.channels else {
            warn!("Audio buffer {} before output format, dropping", buffer.index);
            ctx.discard(buffer.index);
            return Ok(None);
        };
        let Some(data) = buffer.data else {
            warn!("Audio buffer {} has no data, dropping", buffer.index);
            ctx.discard(buffer.index);
            return Ok(None);
        };

        let frames = data.len() / (BYTES_PER_SAMPLE * channels as usize);
        if buffer.pts != 0 && Some(buffer.pts) != self.clock.date() {
            self.clock.set(buffer.pts);
        }
        let pts = match self.clock.date() {
            Some(date) => date,
            None => {
                self.clock.set(buffer.pts);
                buffer.pts
            }
        };
        let end = self.clock.increment(frames as u64).unwrap_or(pts);

        // trailing partial frame is not part of the sample
        let data = data.slice(..frames * BYTES_PER_SAMPLE * channels as usize);
        ctx.discard(buffer.index);

        if frames == 0 {
            return Ok(None);
        }
        Ok(Some(Decoded::Audio(AudioSample {
            pts,
            duration_us: end - pts,
            channels,
            sample_rate: self.clock.rate(),
            frames: frames as u32,
            data,
        })))
    }

    fn tracks_timestamps(&self) -> bool {
        false
    }
}
