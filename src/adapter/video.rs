//! Video stream adapter

use log::{debug, info, warn};

use super::{
    Decoded, InputAction, InputContext, OutputContext, ParameterSetParser, StartDecision,
    StreamAdapter, StreamFormat,
};
use crate::device::{OutputBuffer, OutputFormat, Quirks, StartFormat, StartParams, VideoOutputFormat};
use crate::engine::EngineError;
use crate::media::{
    Codec, CompressedUnit, CsdQueue, FramePayload, InflightTable, PixelFormat, StreamKind,
    VideoFrame, COLOR_FORMAT_TI_YUV420_PACKED_SEMIPLANAR,
};

/// Picture geometry derived from the device output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PictureShape {
    width: u32,
    height: u32,
    stride: u32,
    slice_height: u32,
    format: PixelFormat,
}

pub struct VideoAdapter {
    format: StreamFormat,
    quirks: Quirks,
    parser: Box<dyn ParameterSetParser>,
    direct_rendering: bool,
    shape: Option<PictureShape>,
}

impl VideoAdapter {
    pub fn new(format: StreamFormat, decoder_name: &str, parser: Box<dyn ParameterSetParser>) -> Self {
        let quirks = Quirks::lookup(format.codec, decoder_name);
        debug!("Video quirks for {} ({}): {:?}", decoder_name, format.codec, quirks);
        Self {
            format,
            quirks,
            parser,
            direct_rendering: false,
            shape: None,
        }
    }

    /// Current coded size
    pub fn size(&self) -> (u32, u32) {
        (self.format.width, self.format.height)
    }

    fn shape_from(&self, v: &VideoOutputFormat) -> Result<PictureShape, EngineError> {
        let format = if self.direct_rendering {
            PixelFormat::Opaque
        } else {
            PixelFormat::from_color_format(v.color_format).ok_or_else(|| {
                EngineError::Unsupported(format!("color format {:#x} not recognized", v.color_format))
            })?
        };

        let cropped = |end: i32, start: i32| end.checked_add(1).and_then(|e| e.checked_sub(start));
        let (width, height) = match (
            cropped(v.crop_right, v.crop_left),
            cropped(v.crop_bottom, v.crop_top),
        ) {
            (Some(w), Some(h)) if w > 1 && h > 1 => (w, h),
            _ => (v.width, v.height),
        };

        let mut stride = if v.stride <= 0 { v.width } else { v.stride };
        let mut slice_height = if v.slice_height <= 0 { v.height } else { v.slice_height };
        if v.color_format == COLOR_FORMAT_TI_YUV420_PACKED_SEMIPLANAR {
            slice_height = slice_height.saturating_sub(v.crop_top / 2);
        }
        if self.quirks.ignore_padding {
            slice_height = 0;
            stride = width;
        }

        if width <= 0 || height <= 0 {
            return Err(EngineError::Configuration(format!(
                "invalid output size {}x{}",
                width, height
            )));
        }

        Ok(PictureShape {
            width: width as u32,
            height: height as u32,
            stride: stride.max(0) as u32,
            slice_height: slice_height.max(0) as u32,
            format,
        })
    }
}

impl StreamAdapter for VideoAdapter {
    fn kind(&self) -> StreamKind {
        StreamKind::Video
    }

    fn quirks(&self) -> Quirks {
        self.quirks
    }

    fn start_params(
        &mut self,
        csd: &mut CsdQueue,
        direct_rendering: bool,
    ) -> Result<StartDecision, EngineError> {
        if csd.is_empty() {
            if let Some(extradata) = self.format.extradata.clone().filter(|e| !e.is_empty()) {
                let blobs = match self.parser.parse_extradata(&extradata) {
                    Some(sets) => {
                        if sets.width > 0 && sets.height > 0 {
                            self.format.width = sets.width;
                            self.format.height = sets.height;
                        }
                        sets.blobs
                    }
                    None => vec![extradata],
                };
                csd.replace_if_changed(blobs);
            }
        }

        if self.quirks.need_csd && csd.is_empty() {
            if self.format.codec == Codec::Mpeg4Video {
                return Err(EngineError::Unsupported(
                    "late opening of MPEG-4 video is not handled".into(),
                ));
            }
            return Ok(StartDecision::Defer("waiting for codec-specific data"));
        }

        if self.format.width == 0 || self.format.height == 0 {
            if self.format.codec == Codec::H264 || self.quirks.need_size {
                return Ok(StartDecision::Defer("waiting for a valid video size"));
            }
            return Err(EngineError::Configuration(format!(
                "invalid video size {}x{}",
                self.format.width, self.format.height
            )));
        }

        self.direct_rendering = direct_rendering;
        self.shape = None;
        Ok(StartDecision::Ready(StartParams {
            codec: self.format.codec,
            mime: self.format.codec.mime(),
            format: StartFormat::Video {
                width: self.format.width,
                height: self.format.height,
                rotation: self.format.rotation,
                direct_rendering,
            },
        }))
    }

    fn on_new_input(
        &mut self,
        unit: &mut CompressedUnit,
        ctx: &mut InputContext<'_>,
    ) -> Result<InputAction, EngineError> {
        if unit.flags.interlaced && !(self.quirks.support_interlaced || ctx.capabilities.interlaced) {
            return Err(EngineError::Unsupported(
                "decoder does not support interlaced content".into(),
            ));
        }

        let mut action = InputAction::send();
        if let Some(sets) = self.parser.inspect(unit) {
            let size_changed = sets.width > 0
                && sets.height > 0
                && (sets.width, sets.height) != (self.format.width, self.format.height);
            if size_changed {
                info!(
                    "Video size changed {}x{} -> {}x{}",
                    self.format.width, self.format.height, sets.width, sets.height
                );
                self.format.width = sets.width;
                self.format.height = sets.height;
            }

            if ctx.csd.replace_if_changed(sets.blobs) {
                if size_changed || !ctx.started {
                    debug!("Parameter sets changed, restarting decoder");
                    action.restart = true;
                } else {
                    debug!("Parameter sets changed, flushing decoder");
                    action.flush = true;
                }
            }
        }

        // config-only units are consumed through the CSD queue
        if unit.flags.codec_config {
            action.drop = true;
            return Ok(action);
        }

        let data = std::mem::take(&mut unit.data);
        unit.data = self.parser.rewrite(data);
        Ok(action)
    }

    fn on_flush(&mut self, inflight: &InflightTable) {
        if self.direct_rendering {
            inflight.invalidate_all();
        }
    }

    fn on_format(&mut self, format: &OutputFormat) -> Result<(), EngineError> {
        let OutputFormat::Video(v) = format else {
            return Err(EngineError::Configuration("audio format on a video stream".into()));
        };
        let shape = self.shape_from(v)?;
        info!(
            "Output: {:?} {}x{} stride {} slice height {}, crop {} {} {} {}",
            shape.format,
            shape.width,
            shape.height,
            shape.stride,
            shape.slice_height,
            v.crop_left,
            v.crop_top,
            v.crop_right,
            v.crop_bottom
        );
        self.shape = Some(shape);
        Ok(())
    }

    fn process_output(
        &mut self,
        buffer: OutputBuffer,
        ctx: &mut OutputContext<'_>,
    ) -> Result<Option<Decoded>, EngineError> {
        // one slot per output, popped before any drop decision
        let forced = ctx.timestamps.pop();

        let Some(shape) = self.shape else {
            warn!("Output buffer {} before output format, dropping", buffer.index);
            ctx.discard(buffer.index);
            return Ok(None);
        };

        let pts = forced.unwrap_or(buffer.pts);
        if ctx.preroll_end.map_or(false, |end| pts <= end) {
            ctx.discard(buffer.index);
            return Ok(None);
        }

        let payload = if ctx.direct_rendering {
            FramePayload::Direct(ctx.inflight.insert(buffer.index))
        } else {
            let Some(data) = buffer.data else {
                warn!("Output buffer {} has no data, dropping", buffer.index);
                ctx.discard(buffer.index);
                return Ok(None);
            };
            let data = data.to_vec();
            ctx.discard(buffer.index);
            FramePayload::Copied {
                data,
                stride: shape.stride,
                slice_height: shape.slice_height,
            }
        };

        Ok(Some(Decoded::Video(VideoFrame {
            width: shape.width,
            height: shape.height,
            pts,
            format: shape.format,
            payload,
        })))
    }
}
