use std::fmt::{Display, Formatter};
use std::sync::Arc;

use bytes::Bytes;
use ffmpeg_next::ffi::AV_NOPTS_VALUE;

use crate::pool::Pooled;

/// Decoded or converted picture/audio buffer handed to callbacks.
#[derive(Clone)]
pub enum RawFrame {
    Video(RawVideoFrame),
    Audio(RawAudioFrame),
}

impl RawFrame {
    pub fn pts(&self) -> Option<i64> {
        match self {
            RawFrame::Video(frame) => frame.pts(),
            RawFrame::Audio(frame) => frame.pts(),
        }
    }

    pub fn dts(&self) -> Option<i64> {
        match self {
            RawFrame::Video(frame) => frame.dts(),
            RawFrame::Audio(frame) => frame.dts(),
        }
    }

    pub fn as_video(&self) -> Option<&RawVideoFrame> {
        match self {
            RawFrame::Video(frame) => Some(frame),
            RawFrame::Audio(_) => None,
        }
    }

    pub fn as_audio(&self) -> Option<&RawAudioFrame> {
        match self {
            RawFrame::Audio(frame) => Some(frame),
            RawFrame::Video(_) => None,
        }
    }
}

pub(crate) fn frame_dts(frame: &ffmpeg_next::Frame) -> Option<i64> {
    let dts = unsafe { (*frame.as_ptr()).pkt_dts };
    (dts != AV_NOPTS_VALUE).then_some(dts)
}

pub(crate) fn set_frame_dts(frame: &mut ffmpeg_next::Frame, dts: Option<i64>) {
    unsafe {
        (*frame.as_mut_ptr()).pkt_dts = dts.unwrap_or(AV_NOPTS_VALUE);
    }
}

/// Copies pts and dts from `src` onto `dst`.
pub(crate) fn copy_timestamps(src: &ffmpeg_next::Frame, dst: &mut ffmpeg_next::Frame) {
    dst.set_pts(src.pts());
    set_frame_dts(dst, frame_dts(src));
}

/// Shared handle to a pooled video frame. Clones refer to the same frame;
/// use [`RawVideoFrame::ptr_eq`] to test identity.
#[derive(Clone)]
pub struct RawVideoFrame {
    frame: Arc<Pooled<ffmpeg_next::frame::Video>>,
}

impl RawVideoFrame {
    pub(crate) fn from_pooled(frame: Pooled<ffmpeg_next::frame::Video>) -> Self {
        Self {
            frame: Arc::new(frame),
        }
    }

    pub fn width(&self) -> u32 {
        self.frame.width()
    }

    pub fn height(&self) -> u32 {
        self.frame.height()
    }

    pub fn format(&self) -> ffmpeg_next::format::Pixel {
        self.frame.format()
    }

    pub fn pts(&self) -> Option<i64> {
        self.frame.pts()
    }

    pub fn dts(&self) -> Option<i64> {
        frame_dts(&self.frame)
    }

    pub fn is_key(&self) -> bool {
        self.frame.is_key()
    }

    pub fn as_video(&self) -> &ffmpeg_next::frame::Video {
        &self.frame
    }

    /// Copies plane `index` out of the frame.
    pub fn data(&self, index: usize) -> Bytes {
        Bytes::copy_from_slice(self.frame.data(index))
    }

    pub fn ptr_eq(&self, other: &RawVideoFrame) -> bool {
        Arc::ptr_eq(&self.frame, &other.frame)
    }
}

impl From<ffmpeg_next::frame::Video> for RawVideoFrame {
    fn from(frame: ffmpeg_next::frame::Video) -> Self {
        Self::from_pooled(Pooled::detached(frame))
    }
}

/// Shared handle to a pooled audio frame.
#[derive(Clone)]
pub struct RawAudioFrame {
    frame: Arc<Pooled<ffmpeg_next::frame::Audio>>,
}

impl RawAudioFrame {
    pub(crate) fn from_pooled(frame: Pooled<ffmpeg_next::frame::Audio>) -> Self {
        Self {
            frame: Arc::new(frame),
        }
    }

    pub fn pts(&self) -> Option<i64> {
        self.frame.pts()
    }

    pub fn dts(&self) -> Option<i64> {
        frame_dts(&self.frame)
    }

    pub fn format(&self) -> ffmpeg_next::format::Sample {
        self.frame.format()
    }

    pub fn rate(&self) -> u32 {
        self.frame.rate()
    }

    pub fn channel_layout(&self) -> ffmpeg_next::ChannelLayout {
        self.frame.channel_layout()
    }

    pub fn samples(&self) -> usize {
        self.frame.samples()
    }

    pub fn as_audio(&self) -> &ffmpeg_next::frame::Audio {
        &self.frame
    }

    pub fn ptr_eq(&self, other: &RawAudioFrame) -> bool {
        Arc::ptr_eq(&self.frame, &other.frame)
    }
}

impl From<ffmpeg_next::frame::Audio> for RawAudioFrame {
    fn from(frame: ffmpeg_next::frame::Audio) -> Self {
        Self::from_pooled(Pooled::detached(frame))
    }
}

/// A compressed frame as produced by a demuxer or bitstream splitter.
pub trait MediaFrame: Send + Sync {
    fn data(&self) -> &[u8];
    /// Decode timestamp in milliseconds.
    fn dts(&self) -> i64;
    /// Presentation timestamp in milliseconds.
    fn pts(&self) -> i64;
    fn key_frame(&self) -> bool;

    /// False when the payload points into memory the producer will reuse,
    /// so the frame must be copied before crossing a thread boundary.
    fn cacheable(&self) -> bool {
        true
    }
}

pub type FramePtr = Arc<dyn MediaFrame>;

/// Returns `frame` itself if it may be kept, otherwise an owned snapshot.
pub fn cacheable_frame(frame: &FramePtr) -> FramePtr {
    if frame.cacheable() {
        return Arc::clone(frame);
    }
    Arc::new(EncodedFrame::snapshot(frame.as_ref()))
}

#[derive(Debug, Clone, Default)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub pts: i64,
    pub dts: i64,
    pub is_key: bool,
    cacheable: bool,
}

impl EncodedFrame {
    pub fn new(data: impl Into<Bytes>, dts: i64, pts: i64, is_key: bool) -> Self {
        Self {
            data: data.into(),
            pts,
            dts,
            is_key,
            cacheable: true,
        }
    }

    /// A frame whose payload lives in a buffer the producer recycles, e.g. a
    /// slice of a socket read buffer.
    pub fn transient(data: Bytes, dts: i64, pts: i64, is_key: bool) -> Self {
        Self {
            data,
            pts,
            dts,
            is_key,
            cacheable: false,
        }
    }

    pub fn snapshot(frame: &dyn MediaFrame) -> Self {
        Self::new(
            Bytes::copy_from_slice(frame.data()),
            frame.dts(),
            frame.pts(),
            frame.key_frame(),
        )
    }

    pub(crate) fn from_packet(packet: &ffmpeg_next::Packet) -> Self {
        Self::new(
            packet
                .data()
                .map(Bytes::copy_from_slice)
                .unwrap_or_default(),
            packet.dts().unwrap_or(0),
            packet.pts().unwrap_or(0),
            packet.is_key(),
        )
    }
}

impl MediaFrame for EncodedFrame {
    fn data(&self) -> &[u8] {
        &self.data
    }

    fn dts(&self) -> i64 {
        self.dts
    }

    fn pts(&self) -> i64 {
        self.pts
    }

    fn key_frame(&self) -> bool {
        self.is_key
    }

    fn cacheable(&self) -> bool {
        self.cacheable
    }
}

impl Display for EncodedFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "EncodedFrame data_len: {}, pts: {}, dts: {}, is_key: {}",
            self.data.len(),
            self.pts,
            self.dts,
            self.is_key
        )
    }
}
