use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use ffmpeg_next::{Packet, media, packet};

use crate::{
    codec::{DecodeSession, Negotiator, OpenParams},
    config::{DEFAULT_MAX_ASYNC_TASKS, TranscodeConfig},
    frame::{FramePtr, MediaFrame, RawAudioFrame, RawFrame, RawVideoFrame, cacheable_frame},
    merge::{DtsMerger, FrameMerger},
    pool::{DEFAULT_POOL_SIZE, FramePool},
    task::TaskManager,
    track::Track,
};

/// Output lagging its input by more than this is stale on a live source.
pub const MAX_DELAY_SECOND: i64 = 3;
/// Startup backlog is never treated as stale.
pub const LIVE_GRACE: Duration = Duration::from_secs(10);

pub type DecodeCallback = Box<dyn FnMut(RawFrame) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Open,
    Decoding,
    Flushing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct DecoderOptions {
    /// 0 = auto.
    pub thread_count: usize,
    /// Implementation names tried before the built-in priority list.
    pub preferred: Vec<String>,
    pub max_async_tasks: usize,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            thread_count: 0,
            preferred: Vec::new(),
            max_async_tasks: DEFAULT_MAX_ASYNC_TASKS,
        }
    }
}

impl DecoderOptions {
    pub fn from_config(config: &TranscodeConfig) -> Self {
        Self {
            thread_count: config.decode_threads,
            preferred: Vec::new(),
            max_async_tasks: config.max_async_tasks,
        }
    }
}

enum FrameSource {
    Video(FramePool<ffmpeg_next::frame::Video>),
    Audio(FramePool<ffmpeg_next::frame::Audio>),
}

impl FrameSource {
    fn new(medium: media::Type) -> Self {
        match medium {
            media::Type::Audio => {
                FrameSource::Audio(FramePool::new(DEFAULT_POOL_SIZE, ffmpeg_next::frame::Audio::empty))
            }
            _ => FrameSource::Video(FramePool::new(DEFAULT_POOL_SIZE, ffmpeg_next::frame::Video::empty)),
        }
    }

    fn receive(&self, session: &mut dyn DecodeSession) -> Result<RawFrame, ffmpeg_next::Error> {
        match self {
            FrameSource::Video(pool) => {
                let mut frame = pool.obtain();
                session.receive_frame(&mut frame)?;
                Ok(RawFrame::Video(RawVideoFrame::from_pooled(frame)))
            }
            FrameSource::Audio(pool) => {
                let mut frame = pool.obtain();
                session.receive_frame(&mut frame)?;
                Ok(RawFrame::Audio(RawAudioFrame::from_pooled(frame)))
            }
        }
    }
}

fn is_again(err: &ffmpeg_next::Error) -> bool {
    matches!(err, ffmpeg_next::Error::Other { errno } if *errno == ffmpeg_next::util::error::EAGAIN)
}

struct DecoderCore {
    session: Box<dyn DecodeSession>,
    frames: FrameSource,
    /// Decoded but not yet handed to the callback.
    ready: Vec<RawFrame>,
    merger: Option<Box<dyn FrameMerger>>,
    do_merge: bool,
    started: Instant,
    state: DecoderState,
}

impl DecoderCore {
    fn emit(&mut self, frame: RawFrame) {
        self.ready.push(frame);
    }

    fn input_frame(&mut self, frame: &dyn MediaFrame, live: bool, enable_merge: bool) -> bool {
        if self.state == DecoderState::Closed {
            return false;
        }
        if self.do_merge && enable_merge {
            if let Some(mut merger) = self.merger.take() {
                let accepted = merger.input_frame(frame, &mut |dts: i64, pts: i64, data: &[u8], key: bool| {
                    self.decode_frame(data, dts, pts, live, key);
                });
                self.merger = Some(merger);
                return accepted;
            }
        }
        self.decode_frame(frame.data(), frame.dts(), frame.pts(), live, frame.key_frame())
    }

    fn decode_frame(&mut self, data: &[u8], dts: i64, pts: i64, live: bool, key: bool) -> bool {
        if self.state == DecoderState::Closed {
            return false;
        }
        if self.state == DecoderState::Open {
            self.state = DecoderState::Decoding;
        }

        let mut pkt = Packet::copy(data);
        pkt.set_dts(Some(dts));
        pkt.set_pts(Some(pts));
        if key {
            pkt.set_flags(packet::Flags::KEY);
        }

        if let Err(e) = self.session.send_packet(&pkt) {
            if e != ffmpeg_next::Error::InvalidData {
                log::warn!("send packet to {} failed: {}", self.session.name(), e);
            }
            return false;
        }

        loop {
            let frame = match self.frames.receive(self.session.as_mut()) {
                Ok(frame) => frame,
                Err(e) if is_again(&e) || e == ffmpeg_next::Error::Eof => break,
                Err(e) => {
                    log::warn!("receive frame from {} failed: {}", self.session.name(), e);
                    break;
                }
            };
            let frame_pts = frame.pts().unwrap_or(pts);
            if live
                && pts - frame_pts > MAX_DELAY_SECOND * 1000
                && self.started.elapsed() > LIVE_GRACE
            {
                log::warn!(
                    "drop frame older than {} seconds while decoding: {} {}",
                    MAX_DELAY_SECOND,
                    pts,
                    frame_pts
                );
                continue;
            }
            self.emit(frame);
        }
        true
    }

    fn flush(&mut self) {
        if self.state == DecoderState::Closed {
            return;
        }
        self.state = DecoderState::Flushing;

        if self.do_merge {
            if let Some(mut merger) = self.merger.take() {
                merger.flush(&mut |dts: i64, pts: i64, data: &[u8], key: bool| {
                    self.decode_frame(data, dts, pts, false, key);
                });
                self.merger = Some(merger);
            }
        }

        loop {
            match self.frames.receive(self.session.as_mut()) {
                Ok(frame) => self.emit(frame),
                Err(e) if is_again(&e) => {
                    if let Err(e) = self.session.send_eof() {
                        log::warn!("drain {} failed: {}", self.session.name(), e);
                        break;
                    }
                }
                Err(ffmpeg_next::Error::Eof) => break,
                Err(e) => {
                    log::warn!("receive frame from {} failed: {}", self.session.name(), e);
                    break;
                }
            }
        }
        self.state = DecoderState::Closed;
    }
}

/// Turns compressed access units of one track into raw frames delivered to
/// the [`Decoder::set_on_decode`] callback.
pub struct Decoder {
    tasks: TaskManager,
    core: Arc<Mutex<DecoderCore>>,
    delivery: Arc<Mutex<Delivery>>,
    medium: media::Type,
    name: String,
}

impl Decoder {
    pub fn new(
        track: &Track,
        options: &DecoderOptions,
        negotiator: &Negotiator,
    ) -> anyhow::Result<Self> {
        let codec = track.codec();
        let selection = negotiator.select_decoder(codec, &options.preferred)?;
        let mut params = OpenParams::from_track(track, options.thread_count);
        negotiator.registry().family(codec)?.configure(&mut params);

        let mut current = selection.chosen;
        let session = loop {
            match negotiator.backend().open_decoder(&current, &params) {
                Ok(session) => break session,
                Err(e) => match &selection.default {
                    Some(default) if default.name != current.name => {
                        log::warn!(
                            "open decoder {} failed: {:#}, retry with {}",
                            current.name,
                            e,
                            default.name
                        );
                        current = default.clone();
                    }
                    _ => return Err(e.context(format!("open decoder {} failed", current.name))),
                },
            }
        };

        let mut tasks = TaskManager::new();
        tasks.set_max_task_size(options.max_async_tasks)?;

        let do_merge = session.needs_merge();
        let core = DecoderCore {
            session,
            frames: FrameSource::new(params.medium),
            ready: Vec::new(),
            merger: Some(Box::new(DtsMerger::new())),
            do_merge,
            started: Instant::now(),
            state: DecoderState::Open,
        };

        Ok(Self {
            tasks,
            core: Arc::new(Mutex::new(core)),
            delivery: Arc::new(Mutex::new(Delivery::default())),
            medium: params.medium,
            name: current.name,
        })
    }

    fn lock(&self) -> MutexGuard<'_, DecoderCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run<R>(&self, op: impl FnOnce(&mut DecoderCore) -> R) -> R {
        run_core(&self.core, &self.delivery, op)
    }

    /// Name of the implementation that was opened.
    pub fn codec_name(&self) -> &str {
        &self.name
    }

    pub fn medium(&self) -> media::Type {
        self.medium
    }

    pub fn state(&self) -> DecoderState {
        self.lock().state
    }

    /// Whether fragmented input is merged before decoding.
    pub fn needs_merge(&self) -> bool {
        self.lock().do_merge
    }

    pub fn is_async(&self) -> bool {
        self.tasks.is_enabled()
    }

    /// Registers the only receiver of decoded frames. With async input it is
    /// called from the decoder thread. The decoder is unlocked while it runs,
    /// so the callback may use the decoder, including replacing itself.
    pub fn set_on_decode<F>(&self, on_decode: F)
    where
        F: FnMut(RawFrame) + Send + 'static,
    {
        lock_delivery(&self.delivery).callback = Some(Box::new(on_decode));
    }

    pub fn set_merger(&self, merger: Box<dyn FrameMerger>) {
        self.lock().merger = Some(merger);
    }

    /// Decodes one whole access unit on the calling thread. Returns false if
    /// the codec refused it.
    pub fn decode_frame(&self, data: &[u8], dts: i64, pts: i64, live: bool, key: bool) -> bool {
        self.run(|core| core.decode_frame(data, dts, pts, live, key))
    }

    /// Feeds one input frame. With `async_input` video frames are decoded on
    /// the decoder thread; false then means the frame was dropped because the
    /// thread is behind.
    pub fn input_frame(
        &mut self,
        frame: &FramePtr,
        live: bool,
        async_input: bool,
        enable_merge: bool,
    ) -> bool {
        if async_input && !self.tasks.is_enabled() && self.medium == media::Type::Video {
            if let Err(e) = self.tasks.start_thread("decoder thread") {
                log::warn!("{:#}", e);
            }
        }

        if !async_input || !self.tasks.is_enabled() {
            return self.run(|core| core.input_frame(frame.as_ref(), live, enable_merge));
        }

        let cached = cacheable_frame(frame);
        let core = Arc::clone(&self.core);
        let delivery = Arc::clone(&self.delivery);
        self.tasks.add_decode_task(frame.key_frame(), move || {
            run_core(&core, &delivery, |core| {
                core.input_frame(cached.as_ref(), live, enable_merge)
            });
            Ok(())
        })
    }

    /// Runs queued work, then drains the codec. No input is accepted afterwards.
    pub fn flush(&mut self) {
        self.tasks.stop_thread(false);
        self.run(DecoderCore::flush);
    }

    #[cfg(test)]
    fn backdate(&self, by: Duration) {
        if let Some(started) = Instant::now().checked_sub(by) {
            self.lock().started = started;
        }
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.tasks.stop_thread(true);
        self.run(DecoderCore::flush);
    }
}

/// Decoded frames waiting for the callback. Whoever finds it idle delivers
/// the whole backlog, including frames queued meanwhile by other threads or
/// by the callback itself.
#[derive(Default)]
struct Delivery {
    callback: Option<DecodeCallback>,
    backlog: VecDeque<RawFrame>,
    busy: bool,
}

fn lock_delivery(delivery: &Mutex<Delivery>) -> MutexGuard<'_, Delivery> {
    delivery.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds the callback while it runs; gives it back even if it panics.
struct Delivering<'a> {
    delivery: &'a Mutex<Delivery>,
    callback: Option<DecodeCallback>,
}

impl Drop for Delivering<'_> {
    fn drop(&mut self) {
        let mut delivery = lock_delivery(self.delivery);
        if delivery.callback.is_none() {
            delivery.callback = self.callback.take();
        }
        delivery.busy = false;
    }
}

fn deliver(delivery: &Mutex<Delivery>, frames: Vec<RawFrame>) {
    let mut active = {
        let mut state = lock_delivery(delivery);
        state.backlog.extend(frames);
        if state.busy || state.backlog.is_empty() {
            return;
        }
        state.busy = true;
        Delivering {
            delivery,
            callback: state.callback.take(),
        }
    };
    loop {
        let frame = {
            let mut state = lock_delivery(delivery);
            // replaced from inside the callback
            if let Some(callback) = state.callback.take() {
                active.callback = Some(callback);
            }
            match state.backlog.pop_front() {
                Some(frame) => frame,
                None => return,
            }
        };
        if let Some(on_decode) = active.callback.as_mut() {
            on_decode(frame);
        }
    }
}

/// Runs `op` on the locked core, then delivers what it decoded with the core
/// unlocked.
fn run_core<R>(
    core: &Mutex<DecoderCore>,
    delivery: &Mutex<Delivery>,
    op: impl FnOnce(&mut DecoderCore) -> R,
) -> R {
    let (result, frames) = {
        let mut core = core.lock().unwrap_or_else(PoisonError::into_inner);
        let result = op(&mut *core);
        (result, std::mem::take(&mut core.ready))
    };
    deliver(delivery, frames);
    result
}

#[cfg(test)]
#[path = "decoder_test.rs"]
mod decoder_test;
