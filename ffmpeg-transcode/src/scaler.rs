use ffmpeg_next::{
    ffi,
    format::Pixel,
    frame::Video,
    software::scaling::{self, flag::Flags},
};

use crate::frame::{RawVideoFrame, copy_timestamps};
use crate::pool::{DEFAULT_POOL_SIZE, FramePool};

/// Row alignment of buffers handed to the scaler.
const ALIGN: i32 = 32;

struct Scaler {
    context: scaling::Context,
    /// Source format and size the context was built for.
    source: (Pixel, u32, u32),
}

unsafe impl Send for Scaler {}

/// Converts decoded pictures to one pixel format and size. A width or height
/// of 0 keeps the source dimension.
pub struct Rescaler {
    format: Pixel,
    width: u32,
    height: u32,
    scaler: Option<Scaler>,
    pool: FramePool<Video>,
}

impl Rescaler {
    pub fn new(format: Pixel, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
            scaler: None,
            pool: FramePool::new(DEFAULT_POOL_SIZE, Video::empty),
        }
    }

    pub fn format(&self) -> Pixel {
        self.format
    }

    fn target_size(&self, frame: &RawVideoFrame) -> (u32, u32) {
        let width = if self.width == 0 { frame.width() } else { self.width };
        let height = if self.height == 0 { frame.height() } else { self.height };
        (width, height)
    }

    fn is_target(&self, frame: &RawVideoFrame) -> bool {
        frame.format() == self.format
            && (self.width == 0 || frame.width() == self.width)
            && (self.height == 0 || frame.height() == self.height)
    }

    fn prepare(&mut self, frame: &RawVideoFrame) -> Option<&mut Scaler> {
        let source = (frame.format(), frame.width(), frame.height());
        let rebuild = self.scaler.as_ref().is_none_or(|s| s.source != source);
        if rebuild {
            let (width, height) = self.target_size(frame);
            self.scaler = None;
            match scaling::Context::get(
                source.0,
                source.1,
                source.2,
                self.format,
                width,
                height,
                Flags::FAST_BILINEAR,
            ) {
                Ok(context) => {
                    log::info!(
                        "sws context created: {:?} {}x{} -> {:?} {}x{}",
                        source.0,
                        source.1,
                        source.2,
                        self.format,
                        width,
                        height
                    );
                    self.scaler = Some(Scaler { context, source });
                }
                Err(e) => {
                    log::warn!("sws context create failed: {}", e);
                    return None;
                }
            }
        }
        self.scaler.as_mut()
    }

    /// Returns `frame` itself when it already has the target format and size,
    /// otherwise a converted copy carrying the same timestamps. `None` if the
    /// conversion failed.
    pub fn input_frame(&mut self, frame: &RawVideoFrame) -> Option<RawVideoFrame> {
        if self.is_target(frame) {
            return Some(frame.clone());
        }

        let (width, height) = self.target_size(frame);
        let format = self.format;
        let mut out = self.pool.obtain();
        if out.is_empty() || out.format() != format || out.width() != width || out.height() != height {
            *out = Video::new(format, width, height);
        } else if unsafe { ffi::av_frame_make_writable(out.as_mut_ptr()) } < 0 {
            // an encoder may still reference the last picture; never scale over it
            *out = Video::new(format, width, height);
        }

        let scaler = self.prepare(frame)?;
        let src = frame.as_video();
        let ret = unsafe {
            let dst = out.as_mut_ptr();
            ffi::sws_scale(
                scaler.context.as_mut_ptr(),
                (*src.as_ptr()).data.as_ptr() as *const *const u8,
                (*src.as_ptr()).linesize.as_ptr(),
                0,
                src.height() as i32,
                (*dst).data.as_ptr(),
                (*dst).linesize.as_ptr(),
            )
        };
        if ret <= 0 {
            log::warn!("sws_scale failed: {}", ffmpeg_next::Error::from(ret));
            return None;
        }

        copy_timestamps(src, &mut out);
        Some(RawVideoFrame::from_pooled(out))
    }

    /// Scales `frame` straight into `dst`, laid out with 32-byte aligned rows.
    /// Returns the number of output rows written.
    pub fn convert_into(&mut self, frame: &RawVideoFrame, dst: &mut [u8]) -> Option<i32> {
        let (width, height) = self.target_size(frame);
        let format: ffi::AVPixelFormat = self.format.into();
        let needed = unsafe { ffi::av_image_get_buffer_size(format, width as i32, height as i32, ALIGN) };
        if needed < 0 || dst.len() < needed as usize {
            log::warn!("output buffer too small: {} < {}", dst.len(), needed);
            return None;
        }

        let mut data: [*mut u8; 4] = [std::ptr::null_mut(); 4];
        let mut linesize = [0i32; 4];
        let ret = unsafe {
            ffi::av_image_fill_arrays(
                data.as_mut_ptr(),
                linesize.as_mut_ptr(),
                dst.as_mut_ptr(),
                format,
                width as i32,
                height as i32,
                ALIGN,
            )
        };
        if ret < 0 {
            log::warn!("av_image_fill_arrays failed: {}", ffmpeg_next::Error::from(ret));
            return None;
        }

        let scaler = self.prepare(frame)?;
        let src = frame.as_video();
        let ret = unsafe {
            ffi::sws_scale(
                scaler.context.as_mut_ptr(),
                (*src.as_ptr()).data.as_ptr() as *const *const u8,
                (*src.as_ptr()).linesize.as_ptr(),
                0,
                src.height() as i32,
                data.as_ptr(),
                linesize.as_ptr(),
            )
        };
        if ret <= 0 {
            log::warn!("sws_scale failed: {}", ffmpeg_next::Error::from(ret));
            return None;
        }
        Some(ret)
    }
}
