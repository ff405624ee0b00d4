//! Media Types
//!
//! Compressed input units, decoded frames and samples, and the bookkeeping
//! the engine keeps alongside the device: CSD, timestamps and held pictures.

mod codec;
pub mod csd;
pub mod inflight;
pub mod sink;
pub mod timestamp;

pub use codec::{Codec, StreamKind};
pub use csd::{CsdEntry, CsdQueue};
pub use inflight::{DirectBuffer, InflightTable};
pub use sink::{ChannelSink, DecodedOutput, FrameSink, LatestFrame};
pub use timestamp::TimestampFifo;

use std::sync::Arc;

use bytes::Bytes;

/// Per-unit stream flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitFlags {
    /// Stream is discontinuous before this unit
    pub discontinuity: bool,
    /// Payload is known to be damaged
    pub corrupted: bool,
    /// Payload carries codec configuration only
    pub codec_config: bool,
    /// Decode only to prime the decoder, do not output
    pub preroll: bool,
    /// Content is interlaced
    pub interlaced: bool,
}

/// One compressed access unit submitted by the caller
#[derive(Debug, Clone)]
pub struct CompressedUnit {
    pub data: Bytes,
    /// Presentation timestamp (us)
    pub pts: Option<i64>,
    /// Decode timestamp (us)
    pub dts: Option<i64>,
    pub flags: UnitFlags,
}

impl CompressedUnit {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            pts: None,
            dts: None,
            flags: UnitFlags::default(),
        }
    }

    pub fn with_pts(mut self, pts: i64) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn with_dts(mut self, dts: i64) -> Self {
        self.dts = Some(dts);
        self
    }

    pub fn with_flags(mut self, flags: UnitFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Best timestamp for the device: pts, else dts
    pub fn timestamp(&self) -> Option<i64> {
        self.pts.or(self.dts)
    }
}

/// Pixel layout of a decoded picture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    /// YUV 4:2:0 planar (Y, U, V separate planes)
    #[default]
    YUV420P,
    /// Y plane + interleaved UV plane
    NV12,
    /// Y plane + interleaved VU plane
    NV21,
    YUYV,
    YVYU,
    UYVY,
    VYUY,
    /// Picture stays in device memory
    Opaque,
}

impl PixelFormat {
    /// Map an OMX color format reported by the device
    pub fn from_color_format(color_format: i32) -> Option<Self> {
        let format = match color_format {
            19 | 20 => PixelFormat::YUV420P,
            21 => PixelFormat::NV12,
            25 => PixelFormat::YUYV,
            26 => PixelFormat::YVYU,
            27 => PixelFormat::UYVY,
            28 => PixelFormat::VYUY,
            COLOR_FORMAT_QCOM_YVU420_SEMIPLANAR => PixelFormat::NV21,
            COLOR_FORMAT_TI_YUV420_PACKED_SEMIPLANAR
            | COLOR_FORMAT_QCOM_YUV420_TILED
            | COLOR_FORMAT_QCOM_YUV420_SEMIPLANAR_32M => PixelFormat::NV12,
            _ => return None,
        };
        Some(format)
    }
}

pub const COLOR_FORMAT_QCOM_YVU420_SEMIPLANAR: i32 = 0x7FA3_0C00;
pub const COLOR_FORMAT_QCOM_YUV420_TILED: i32 = 0x7FA3_0C03;
pub const COLOR_FORMAT_QCOM_YUV420_SEMIPLANAR_32M: i32 = 0x7FA3_0C04;
/// TI packed semi-planar; its slice height includes half the top crop
pub const COLOR_FORMAT_TI_YUV420_PACKED_SEMIPLANAR: i32 = 0x7F00_0100;

/// Picture data of a decoded frame
#[derive(Debug, Clone)]
pub enum FramePayload {
    /// Picture copied out of the device
    Copied {
        data: Vec<u8>,
        stride: u32,
        slice_height: u32,
    },
    /// Picture held in a device output slot
    Direct(Arc<DirectBuffer>),
}

/// Decoded video frame
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp (us)
    pub pts: i64,
    pub format: PixelFormat,
    pub payload: FramePayload,
}

impl VideoFrame {
    pub fn is_direct(&self) -> bool {
        matches!(self.payload, FramePayload::Direct(_))
    }
}

/// Decoded block of interleaved 16-bit PCM
#[derive(Debug, Clone)]
pub struct AudioSample {
    /// Presentation timestamp (us)
    pub pts: i64,
    pub duration_us: i64,
    pub channels: u32,
    pub sample_rate: u32,
    /// Samples per channel
    pub frames: u32,
    pub data: Bytes,
}
