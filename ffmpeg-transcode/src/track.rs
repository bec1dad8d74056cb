use std::fmt::{Display, Formatter};

use ffmpeg_next::{codec, media};
use serde::{Deserialize, Serialize};

/// Logical codec of a track, independent of which implementation decodes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecId {
    H264,
    H265,
    Aac,
    G711A,
    G711U,
    Opus,
    Jpeg,
    Vp8,
    Vp9,
}

impl CodecId {
    pub const ALL: [CodecId; 9] = [
        CodecId::H264,
        CodecId::H265,
        CodecId::Aac,
        CodecId::G711A,
        CodecId::G711U,
        CodecId::Opus,
        CodecId::Jpeg,
        CodecId::Vp8,
        CodecId::Vp9,
    ];

    /// The FFmpeg codec id a concrete implementation must report to count as
    /// this codec.
    pub fn av_id(self) -> codec::Id {
        match self {
            CodecId::H264 => codec::Id::H264,
            CodecId::H265 => codec::Id::HEVC,
            CodecId::Aac => codec::Id::AAC,
            CodecId::G711A => codec::Id::PCM_ALAW,
            CodecId::G711U => codec::Id::PCM_MULAW,
            CodecId::Opus => codec::Id::OPUS,
            CodecId::Jpeg => codec::Id::MJPEG,
            CodecId::Vp8 => codec::Id::VP8,
            CodecId::Vp9 => codec::Id::VP9,
        }
    }

    pub fn medium(self) -> media::Type {
        match self {
            CodecId::Aac | CodecId::G711A | CodecId::G711U | CodecId::Opus => media::Type::Audio,
            _ => media::Type::Video,
        }
    }

    pub fn is_video(self) -> bool {
        self.medium() == media::Type::Video
    }

    pub fn name(self) -> &'static str {
        match self {
            CodecId::H264 => "H264",
            CodecId::H265 => "H265",
            CodecId::Aac => "AAC",
            CodecId::G711A => "G711A",
            CodecId::G711U => "G711U",
            CodecId::Opus => "Opus",
            CodecId::Jpeg => "JPEG",
            CodecId::Vp8 => "VP8",
            CodecId::Vp9 => "VP9",
        }
    }
}

impl Display for CodecId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Stream description handed over by the plugin layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    codec: CodecId,
    width: u32,
    height: u32,
    channels: u32,
    sample_rate: u32,
}

impl Track {
    pub fn video(codec: CodecId, width: u32, height: u32) -> Self {
        Self {
            codec,
            width,
            height,
            channels: 0,
            sample_rate: 0,
        }
    }

    pub fn audio(codec: CodecId, channels: u32, sample_rate: u32) -> Self {
        Self {
            codec,
            width: 0,
            height: 0,
            channels,
            sample_rate,
        }
    }

    pub fn codec(&self) -> CodecId {
        self.codec
    }

    pub fn is_video(&self) -> bool {
        self.codec.is_video()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
