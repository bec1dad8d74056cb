use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ffmpeg_next::{Dictionary, Rational, codec, ffi, format::Pixel};

use crate::{
    codec::{CodecInfo, Negotiator},
    config::{DEFAULT_MAX_ASYNC_TASKS, TranscodeConfig},
    frame::{EncodedFrame, RawVideoFrame},
    hw::{is_hw_codec, pixel_format_for_encoder},
    scaler::Rescaler,
    task::TaskManager,
    track::CodecId,
};

pub type EncodeCallback = Box<dyn FnMut(EncodedFrame) + Send>;

#[derive(Debug, Clone)]
pub struct Settings {
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
    pub keyframe_interval: u32,
    /// 0 leaves the codec default.
    pub bit_rate: usize,
    /// Format of the pictures fed in; the encoder may pick another one.
    pub pixel_format: Pixel,
    /// 0 = auto.
    pub thread_count: usize,
    pub preferred: Vec<String>,
    pub max_async_tasks: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            frame_rate: Rational(25, 1),
            keyframe_interval: 25,
            bit_rate: 0,
            pixel_format: Pixel::YUV420P,
            thread_count: 0,
            preferred: Vec::new(),
            max_async_tasks: DEFAULT_MAX_ASYNC_TASKS,
        }
    }
}

impl Settings {
    pub fn from_config(config: &TranscodeConfig) -> Self {
        Self {
            thread_count: config.encode_threads,
            max_async_tasks: config.max_async_tasks,
            ..Default::default()
        }
    }
}

fn open_encoder(info: &CodecInfo, settings: &Settings) -> anyhow::Result<codec::encoder::Video> {
    let implementation = ffmpeg_next::encoder::find_by_name(&info.name)
        .ok_or_else(|| anyhow::anyhow!("encoder {} not found", info.name))?;
    let mut encoder = codec::Context::new_with_codec(implementation).encoder().video()?;
    encoder.set_width(settings.width);
    encoder.set_height(settings.height);
    encoder.set_format(pixel_format_for_encoder(settings.pixel_format, &info.name));
    encoder.set_frame_rate(Some(settings.frame_rate));
    // pts are milliseconds
    encoder.set_time_base(Rational(1, 1000));
    encoder.set_gop(settings.keyframe_interval);
    encoder.set_max_b_frames(0);
    if settings.bit_rate > 0 {
        encoder.set_bit_rate(settings.bit_rate);
    }
    unsafe {
        (*encoder.as_mut_ptr()).flags |= ffi::AV_CODEC_FLAG_LOW_DELAY as i32;
    }

    let mut threads = settings.thread_count;
    if threads > 0 {
        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        threads = threads.min(cores);
    }
    let mut opts = Dictionary::new();
    opts.set("threads", &if threads == 0 { "auto".to_string() } else { threads.to_string() });
    opts.set("strict", "-2");
    if !is_hw_codec(&info.name) {
        opts.set("preset", "ultrafast");
        opts.set("tune", "zerolatency");
    }
    Ok(encoder.open_as_with(implementation, opts)?)
}

struct EncoderCore {
    encoder: codec::encoder::Video,
    rescaler: Rescaler,
    on_encode: Option<EncodeCallback>,
    name: String,
}

impl EncoderCore {
    fn drain(&mut self) {
        let mut packet = ffmpeg_next::Packet::empty();
        loop {
            match self.encoder.receive_packet(&mut packet) {
                Ok(()) => {
                    let frame = EncodedFrame::from_packet(&packet);
                    if let Some(on_encode) = self.on_encode.as_mut() {
                        on_encode(frame);
                    }
                }
                Err(ffmpeg_next::Error::Eof) => break,
                Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                    break;
                }
                Err(e) => {
                    log::warn!("receive packet from {} failed: {}", self.name, e);
                    break;
                }
            }
        }
    }

    fn encode(&mut self, frame: &RawVideoFrame) -> bool {
        let Some(picture) = self.rescaler.input_frame(frame) else {
            return false;
        };
        if let Err(e) = self.encoder.send_frame(picture.as_video()) {
            log::warn!("send frame to {} failed: {}", self.name, e);
            return false;
        }
        self.drain();
        true
    }

    fn flush(&mut self) {
        if let Err(e) = self.encoder.send_eof() {
            log::debug!("{} already drained: {}", self.name, e);
            return;
        }
        self.drain();
    }
}

/// Compresses raw pictures of one video track into [`EncodedFrame`]s delivered
/// to the [`Encoder::set_on_encode`] callback. Input is converted to the
/// encoder's pixel format and size first.
pub struct Encoder {
    tasks: TaskManager,
    core: Arc<Mutex<EncoderCore>>,
    name: String,
}

impl Encoder {
    pub fn new(codec: CodecId, settings: &Settings, negotiator: &Negotiator) -> anyhow::Result<Self> {
        anyhow::ensure!(codec.is_video(), "encoder only supports video, got {}", codec);
        let selection = negotiator.select_encoder(codec, &settings.preferred)?;

        // try the negotiated encoder first, then retry with the software default
        let mut current = selection.chosen;
        let encoder = loop {
            match open_encoder(&current, settings) {
                Ok(encoder) => break encoder,
                Err(e) => match &selection.default {
                    Some(default) if default.name != current.name => {
                        log::warn!(
                            "encoder {} failed: {:#}, falling back to {}",
                            current.name,
                            e,
                            default.name
                        );
                        current = default.clone();
                    }
                    _ => return Err(e.context(format!("open encoder {} failed", current.name))),
                },
            }
        };
        log::info!("encoder opened successfully: {}", current.name);

        let mut tasks = TaskManager::new();
        tasks.set_max_task_size(settings.max_async_tasks)?;

        let rescaler = Rescaler::new(encoder.format(), encoder.width(), encoder.height());
        Ok(Self {
            tasks,
            core: Arc::new(Mutex::new(EncoderCore {
                encoder,
                rescaler,
                on_encode: None,
                name: current.name.clone(),
            })),
            name: current.name,
        })
    }

    fn lock(&self) -> MutexGuard<'_, EncoderCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn codec_name(&self) -> &str {
        &self.name
    }

    pub fn pixel_format(&self) -> Pixel {
        self.lock().rescaler.format()
    }

    pub fn is_async(&self) -> bool {
        self.tasks.is_enabled()
    }

    pub fn set_on_encode<F>(&self, on_encode: F)
    where
        F: FnMut(EncodedFrame) + Send + 'static,
    {
        self.lock().on_encode = Some(Box::new(on_encode));
    }

    /// Encodes `frame`, on the encoder thread when `async_input` is set. Under
    /// load the oldest queued picture is dropped, never the newest.
    pub fn input_frame(&mut self, frame: &RawVideoFrame, async_input: bool) -> bool {
        if async_input && !self.tasks.is_enabled() {
            if let Err(e) = self.tasks.start_thread("encoder thread") {
                log::warn!("{:#}", e);
            }
        }
        if !async_input || !self.tasks.is_enabled() {
            return self.lock().encode(frame);
        }

        let frame = frame.clone();
        let core = Arc::clone(&self.core);
        self.tasks.add_encode_task(move || {
            core.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .encode(&frame);
            Ok(())
        })
    }

    /// Encodes everything still queued and drains the codec.
    pub fn flush(&mut self) {
        self.tasks.stop_thread(false);
        self.lock().flush();
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        self.tasks.stop_thread(true);
    }
}
