//! Codec identifiers and their device MIME types

use serde::{Deserialize, Serialize};

/// Elementary stream category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Video,
    Audio,
}

/// Compressed formats the bridge knows how to hand to a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    // Video
    Hevc,
    H264,
    H263,
    Mpeg4Video,
    Wmv3,
    Vc1,
    Vp8,
    Vp9,
    // Audio
    AmrNb,
    AmrWb,
    Mp3,
    Mp2,
    Aac,
    Qcelp,
    Vorbis,
    Opus,
    Alaw,
    Mulaw,
    Flac,
    Gsm,
    Ac3,
    Eac3,
    Alac,
    Dts,
}

impl Codec {
    pub const ALL: [Codec; 24] = [
        Codec::Hevc,
        Codec::H264,
        Codec::H263,
        Codec::Mpeg4Video,
        Codec::Wmv3,
        Codec::Vc1,
        Codec::Vp8,
        Codec::Vp9,
        Codec::AmrNb,
        Codec::AmrWb,
        Codec::Mp3,
        Codec::Mp2,
        Codec::Aac,
        Codec::Qcelp,
        Codec::Vorbis,
        Codec::Opus,
        Codec::Alaw,
        Codec::Mulaw,
        Codec::Flac,
        Codec::Gsm,
        Codec::Ac3,
        Codec::Eac3,
        Codec::Alac,
        Codec::Dts,
    ];

    /// MIME type the device is configured with
    pub fn mime(&self) -> &'static str {
        match self {
            Codec::Hevc => "video/hevc",
            Codec::H264 => "video/avc",
            Codec::H263 => "video/3gpp",
            Codec::Mpeg4Video => "video/mp4v-es",
            Codec::Wmv3 => "video/x-ms-wmv",
            Codec::Vc1 => "video/wvc1",
            Codec::Vp8 => "video/x-vnd.on2.vp8",
            Codec::Vp9 => "video/x-vnd.on2.vp9",
            Codec::AmrNb => "audio/3gpp",
            Codec::AmrWb => "audio/amr-wb",
            Codec::Mp3 => "audio/mpeg",
            Codec::Mp2 => "audio/mpeg-L2",
            Codec::Aac => "audio/mp4a-latm",
            Codec::Qcelp => "audio/qcelp",
            Codec::Vorbis => "audio/vorbis",
            Codec::Opus => "audio/opus",
            Codec::Alaw => "audio/g711-alaw",
            Codec::Mulaw => "audio/g711-mlaw",
            Codec::Flac => "audio/flac",
            Codec::Gsm => "audio/gsm",
            Codec::Ac3 => "audio/ac3",
            Codec::Eac3 => "audio/eac3",
            Codec::Alac => "audio/alac",
            Codec::Dts => "audio/vnd.dts",
        }
    }

    pub fn kind(&self) -> StreamKind {
        match self {
            Codec::Hevc
            | Codec::H264
            | Codec::H263
            | Codec::Mpeg4Video
            | Codec::Wmv3
            | Codec::Vc1
            | Codec::Vp8
            | Codec::Vp9 => StreamKind::Video,
            _ => StreamKind::Audio,
        }
    }

    /// Reverse lookup by MIME type. "audio/mpeg" maps to MP3.
    pub fn from_mime(mime: &str) -> Option<Codec> {
        Self::ALL.iter().copied().find(|codec| codec.mime() == mime)
    }

    /// Parse a short codec name such as "h264" or "aac"
    pub fn from_name(name: &str) -> Option<Codec> {
        let codec = match name.to_ascii_lowercase().as_str() {
            "hevc" | "h265" => Codec::Hevc,
            "h264" | "avc" => Codec::H264,
            "h263" => Codec::H263,
            "mp4v" | "mpeg4" => Codec::Mpeg4Video,
            "wmv3" => Codec::Wmv3,
            "vc1" => Codec::Vc1,
            "vp8" => Codec::Vp8,
            "vp9" => Codec::Vp9,
            "amr-nb" | "amrnb" => Codec::AmrNb,
            "amr-wb" | "amrwb" => Codec::AmrWb,
            "mp3" | "mpga" => Codec::Mp3,
            "mp2" => Codec::Mp2,
            "aac" | "mp4a" => Codec::Aac,
            "qcelp" => Codec::Qcelp,
            "vorbis" => Codec::Vorbis,
            "opus" => Codec::Opus,
            "alaw" => Codec::Alaw,
            "mulaw" | "ulaw" => Codec::Mulaw,
            "flac" => Codec::Flac,
            "gsm" => Codec::Gsm,
            "ac3" | "a52" => Codec::Ac3,
            "eac3" => Codec::Eac3,
            "alac" => Codec::Alac,
            "dts" => Codec::Dts,
            _ => return None,
        };
        Some(codec)
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mime())
    }
}
