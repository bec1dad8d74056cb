use ffmpeg_next::{ChannelLayout, ffi, format::Sample, frame::Audio, software::resampling};

use crate::frame::{RawAudioFrame, copy_timestamps};
use crate::pool::{DEFAULT_POOL_SIZE, FramePool};

struct Swr(resampling::Context);

unsafe impl Send for Swr {}

/// Converts decoded audio to one sample format, channel layout and rate.
///
/// The conversion context is built from the first frame that needs it and
/// kept for the lifetime of the resampler: a stream that changes its input
/// parameters afterwards gets `None` back.
pub struct Resampler {
    format: Sample,
    layout: ChannelLayout,
    rate: u32,
    swr: Option<Swr>,
    pool: FramePool<Audio>,
}

impl Resampler {
    pub fn new(format: Sample, layout: ChannelLayout, rate: u32) -> Self {
        Self {
            format,
            layout,
            rate,
            swr: None,
            pool: FramePool::new(DEFAULT_POOL_SIZE, Audio::empty),
        }
    }

    fn is_target(&self, frame: &RawAudioFrame) -> bool {
        frame.format() == self.format
            && frame.channel_layout() == self.layout
            && frame.rate() == self.rate
    }

    pub fn input_frame(&mut self, frame: &RawAudioFrame) -> Option<RawAudioFrame> {
        if self.is_target(frame) {
            return Some(frame.clone());
        }

        if self.swr.is_none() {
            match resampling::Context::get(
                frame.format(),
                frame.channel_layout(),
                frame.rate(),
                self.format,
                self.layout,
                self.rate,
            ) {
                Ok(context) => {
                    log::info!(
                        "swr context created: {:?} {}Hz -> {:?} {}Hz",
                        frame.format(),
                        frame.rate(),
                        self.format,
                        self.rate
                    );
                    self.swr = Some(Swr(context));
                }
                Err(e) => {
                    log::warn!("swr context create failed: {}", e);
                    return None;
                }
            }
        }
        let swr = self.swr.as_mut()?;

        let mut out = self.pool.obtain();
        unsafe {
            ffi::av_frame_unref(out.as_mut_ptr());
        }
        out.set_format(self.format);
        out.set_channel_layout(self.layout);
        out.set_rate(self.rate);
        copy_timestamps(frame.as_audio(), &mut out);

        let ret = unsafe {
            ffi::swr_convert_frame(swr.0.as_mut_ptr(), out.as_mut_ptr(), frame.as_audio().as_ptr())
        };
        if ret != 0 {
            log::warn!("swr_convert_frame failed: {}", ffmpeg_next::Error::from(ret));
            return None;
        }
        Some(RawAudioFrame::from_pooled(out))
    }
}
