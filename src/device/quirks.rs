//! Decoder quirks
//!
//! Behaviour flags derived from the codec and the decoder component name.

use crate::media::Codec;

/// Quirk flags for one decoder/codec pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quirks {
    /// Device must receive codec-specific data before any input
    pub need_csd: bool,
    /// Video size must be known before start
    pub need_size: bool,
    /// Channel count must be known before start
    pub need_channels: bool,
    /// Reported stride/slice height must be ignored
    pub ignore_padding: bool,
    /// Decoder handles interlaced content
    pub support_interlaced: bool,
}

impl Quirks {
    /// Look up the quirks for `codec` decoded by the component `name`
    pub fn lookup(codec: Codec, name: &str) -> Self {
        let mut quirks = Quirks {
            need_csd: matches!(
                codec,
                Codec::H264 | Codec::Vc1 | Codec::Vorbis | Codec::Aac
            ),
            ..Default::default()
        };

        for (prefix, flag) in NAME_PREFIX_QUIRKS {
            if name.starts_with(prefix) {
                quirks.set(*flag);
            }
        }
        quirks
    }

    fn set(&mut self, flag: Flag) {
        match flag {
            Flag::NeedCsd => self.need_csd = true,
            Flag::NeedChannels => self.need_channels = true,
            Flag::IgnorePadding => self.ignore_padding = true,
            Flag::SupportInterlaced => self.support_interlaced = true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Flag {
    NeedCsd,
    NeedChannels,
    IgnorePadding,
    SupportInterlaced,
}

const NAME_PREFIX_QUIRKS: &[(&str, Flag)] = &[
    ("OMX.MTK.VIDEO.DECODER.MPEG4", Flag::NeedCsd),
    ("OMX.Marvell", Flag::NeedChannels),
    // decoders known to report bogus padding
    ("OMX.SEC.avc.dec", Flag::IgnorePadding),
    ("OMX.SEC.avcdec", Flag::IgnorePadding),
    ("OMX.SEC.MPEG4.Decoder", Flag::IgnorePadding),
    ("OMX.SEC.mpeg4.dec", Flag::IgnorePadding),
    ("OMX.SEC.vc1.dec", Flag::IgnorePadding),
    ("OMX.amlogic.avc.decoder.awesome", Flag::SupportInterlaced),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_quirks() {
        assert!(Quirks::lookup(Codec::H264, "OMX.qcom.video.decoder.avc").need_csd);
        assert!(Quirks::lookup(Codec::Vc1, "any").need_csd);
        assert!(Quirks::lookup(Codec::Aac, "any").need_csd);
        assert!(!Quirks::lookup(Codec::Hevc, "any").need_csd);
        assert!(!Quirks::lookup(Codec::Vp8, "any").need_size);
    }

    #[test]
    fn test_name_quirks() {
        assert!(Quirks::lookup(Codec::Mpeg4Video, "OMX.MTK.VIDEO.DECODER.MPEG4").need_csd);
        assert!(Quirks::lookup(Codec::Mp3, "OMX.Marvell.audio.mp3").need_channels);
        assert!(Quirks::lookup(Codec::H264, "OMX.SEC.avc.dec").ignore_padding);
        assert!(!Quirks::lookup(Codec::H264, "OMX.SEC.AVC.Decoder").ignore_padding);
        assert!(Quirks::lookup(Codec::H264, "OMX.amlogic.avc.decoder.awesome.secure").support_interlaced);
    }
}
