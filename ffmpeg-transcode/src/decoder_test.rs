use std::collections::VecDeque;
use std::sync::mpsc;

use ffmpeg_next::{codec, format::Pixel};

use super::*;
use crate::codec::{Candidate, CodecBackend, CodecInfo, FfmpegBackend};
use crate::frame::{EncodedFrame, set_frame_dts};
use crate::hw::{CapabilityProbe, Capabilities};
use crate::track::CodecId;

/// First payload byte that makes the scripted codec reject a packet as corrupt.
const CORRUPT: u8 = 0xff;

#[derive(Default)]
struct Script {
    /// Implementations that fail to open.
    broken: Vec<&'static str>,
    needs_merge: bool,
    /// Frames held back inside the codec until it is drained.
    delay: usize,
}

#[derive(Default)]
struct Recorder {
    opened: Vec<String>,
    packets: Vec<Vec<u8>>,
}

/// A codec library whose sessions output one frame per packet, stamped with
/// the packet's dts as pts (decode order), `delay` packets late.
struct ScriptedBackend {
    catalog: Vec<(&'static str, codec::Id)>,
    script: Script,
    recorder: Arc<Mutex<Recorder>>,
}

impl ScriptedBackend {
    fn lookup(&self, candidate: &Candidate) -> Option<CodecInfo> {
        self.catalog
            .iter()
            .find(|(name, id)| match candidate {
                Candidate::Name(wanted) => wanted == name,
                Candidate::Id(wanted) => wanted == id,
            })
            .map(|(name, id)| CodecInfo {
                name: name.to_string(),
                id: *id,
            })
    }
}

impl CodecBackend for ScriptedBackend {
    fn find_decoder(&self, candidate: &Candidate) -> Option<CodecInfo> {
        self.lookup(candidate)
    }

    fn find_encoder(&self, _candidate: &Candidate) -> Option<CodecInfo> {
        None
    }

    fn open_decoder(
        &self,
        info: &CodecInfo,
        _params: &OpenParams,
    ) -> anyhow::Result<Box<dyn DecodeSession>> {
        self.recorder.lock().unwrap().opened.push(info.name.clone());
        if self.script.broken.contains(&info.name.as_str()) {
            anyhow::bail!("Operation not permitted");
        }
        Ok(Box::new(ScriptedSession {
            name: info.name.clone(),
            needs_merge: self.script.needs_merge,
            delay: self.script.delay,
            pending: VecDeque::new(),
            draining: false,
            recorder: Arc::clone(&self.recorder),
        }))
    }
}

struct ScriptedSession {
    name: String,
    needs_merge: bool,
    delay: usize,
    pending: VecDeque<i64>,
    draining: bool,
    recorder: Arc<Mutex<Recorder>>,
}

impl DecodeSession for ScriptedSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn needs_merge(&self) -> bool {
        self.needs_merge
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<(), ffmpeg_next::Error> {
        let data = packet.data().unwrap_or_default();
        if data.first() == Some(&CORRUPT) {
            return Err(ffmpeg_next::Error::InvalidData);
        }
        self.recorder.lock().unwrap().packets.push(data.to_vec());
        self.pending.push_back(packet.dts().unwrap_or(0));
        Ok(())
    }

    fn send_eof(&mut self) -> Result<(), ffmpeg_next::Error> {
        if self.draining {
            return Err(ffmpeg_next::Error::Eof);
        }
        self.draining = true;
        Ok(())
    }

    fn receive_frame(&mut self, frame: &mut ffmpeg_next::Frame) -> Result<(), ffmpeg_next::Error> {
        if !self.draining && self.pending.len() <= self.delay {
            return Err(ffmpeg_next::Error::Other {
                errno: ffmpeg_next::util::error::EAGAIN,
            });
        }
        let Some(ts) = self.pending.pop_front() else {
            return Err(ffmpeg_next::Error::Eof);
        };
        frame.set_pts(Some(ts));
        set_frame_dts(frame, Some(ts));
        Ok(())
    }
}

struct Harness {
    recorder: Arc<Mutex<Recorder>>,
    negotiator: Negotiator,
}

fn harness(caps: Capabilities, script: Script) -> Harness {
    let recorder = Arc::new(Mutex::new(Recorder::default()));
    let backend = ScriptedBackend {
        catalog: vec![
            ("h264", codec::Id::H264),
            ("h264_cuvid", codec::Id::H264),
            ("aac", codec::Id::AAC),
        ],
        script,
        recorder: Arc::clone(&recorder),
    };
    Harness {
        recorder,
        negotiator: Negotiator::new(Arc::new(CapabilityProbe::fixed(caps)), Arc::new(backend)),
    }
}

fn h264() -> Track {
    Track::video(CodecId::H264, 1280, 720)
}

/// Collects the pts of every decoded frame.
fn collect(decoder: &Decoder) -> Arc<Mutex<Vec<i64>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    decoder.set_on_decode(move |frame| sink.lock().unwrap().push(frame.pts().unwrap_or(-1)));
    seen
}

#[test]
fn test_open_falls_back_to_default() -> anyhow::Result<()> {
    let h = harness(
        Capabilities {
            nvidia: true,
            ..Default::default()
        },
        Script {
            broken: vec!["h264_cuvid"],
            ..Default::default()
        },
    );
    let decoder = Decoder::new(&h264(), &DecoderOptions::default(), &h.negotiator)?;

    assert_eq!(decoder.codec_name(), "h264");
    assert_eq!(decoder.state(), DecoderState::Open);
    assert_eq!(h.recorder.lock().unwrap().opened, vec!["h264_cuvid", "h264"]);
    Ok(())
}

#[test]
fn test_open_failure_without_fallback_is_fatal() {
    let h = harness(
        Capabilities::default(),
        Script {
            broken: vec!["h264"],
            ..Default::default()
        },
    );
    let err = match Decoder::new(&h264(), &DecoderOptions::default(), &h.negotiator) {
        Ok(_) => panic!("decoder must not open"),
        Err(err) => err,
    };
    assert_eq!(err.to_string(), "open decoder h264 failed");
    assert!(format!("{:#}", err).contains("Operation not permitted"));
    assert_eq!(h.recorder.lock().unwrap().opened, vec!["h264"]);
}

#[test]
fn test_no_decoder_is_fatal() {
    let h = harness(Capabilities::default(), Script::default());
    let track = Track::video(CodecId::Vp8, 640, 360);
    assert!(Decoder::new(&track, &DecoderOptions::default(), &h.negotiator).is_err());
}

#[test]
fn test_live_drop_after_grace_period() -> anyhow::Result<()> {
    let h = harness(Capabilities::default(), Script::default());
    let decoder = Decoder::new(&h264(), &DecoderOptions::default(), &h.negotiator)?;
    let seen = collect(&decoder);
    decoder.backdate(LIVE_GRACE + Duration::from_secs(1));

    // frame pts 0 while input pts is 5000: 5 s behind
    assert!(decoder.decode_frame(&[1], 0, 5000, true, true));
    // exactly at the threshold is still emitted
    assert!(decoder.decode_frame(&[2], 1000, 4000, true, false));
    // recorded sources keep everything
    assert!(decoder.decode_frame(&[3], 2000, 9000, false, false));

    assert_eq!(*seen.lock().unwrap(), vec![1000, 2000]);
    Ok(())
}

#[test]
fn test_live_lag_kept_during_startup() -> anyhow::Result<()> {
    let h = harness(Capabilities::default(), Script::default());
    let decoder = Decoder::new(&h264(), &DecoderOptions::default(), &h.negotiator)?;
    let seen = collect(&decoder);

    assert!(decoder.decode_frame(&[1], 0, 5000, true, true));
    assert_eq!(*seen.lock().unwrap(), vec![0]);
    assert_eq!(decoder.state(), DecoderState::Decoding);
    Ok(())
}

#[test]
fn test_invalid_data_is_skipped() -> anyhow::Result<()> {
    let h = harness(Capabilities::default(), Script::default());
    let decoder = Decoder::new(&h264(), &DecoderOptions::default(), &h.negotiator)?;
    let seen = collect(&decoder);

    assert!(!decoder.decode_frame(&[CORRUPT, 0, 1], 0, 0, false, true));
    assert!(decoder.decode_frame(&[0, 0, 1], 40, 40, false, true));
    assert_eq!(*seen.lock().unwrap(), vec![40]);
    Ok(())
}

#[test]
fn test_merge_routing() -> anyhow::Result<()> {
    let h = harness(
        Capabilities::default(),
        Script {
            needs_merge: true,
            ..Default::default()
        },
    );
    let mut decoder = Decoder::new(&h264(), &DecoderOptions::default(), &h.negotiator)?;
    assert!(decoder.needs_merge());
    let seen = collect(&decoder);

    let chunk = |data: &[u8], dts: i64, key: bool| -> FramePtr {
        Arc::new(EncodedFrame::new(data.to_vec(), dts, dts, key))
    };
    assert!(decoder.input_frame(&chunk(&[1, 2], 0, true), false, false, true));
    assert!(decoder.input_frame(&chunk(&[3], 0, false), false, false, true));
    assert!(h.recorder.lock().unwrap().packets.is_empty());

    assert!(decoder.input_frame(&chunk(&[4], 40, false), false, false, true));
    assert_eq!(h.recorder.lock().unwrap().packets, vec![vec![1, 2, 3]]);

    // merging disabled by the caller goes straight to the codec
    assert!(decoder.input_frame(&chunk(&[9], 80, false), false, false, false));
    assert_eq!(h.recorder.lock().unwrap().packets.last(), Some(&vec![9]));

    decoder.flush();
    assert_eq!(
        h.recorder.lock().unwrap().packets,
        vec![vec![1, 2, 3], vec![9], vec![4]]
    );
    assert_eq!(*seen.lock().unwrap(), vec![0, 80, 40]);
    Ok(())
}

#[test]
fn test_flush_recovers_buffered_frames() -> anyhow::Result<()> {
    let h = harness(
        Capabilities::default(),
        Script {
            delay: 2,
            ..Default::default()
        },
    );
    let mut decoder = Decoder::new(&h264(), &DecoderOptions::default(), &h.negotiator)?;
    let seen = collect(&decoder);
    decoder.backdate(LIVE_GRACE + Duration::from_secs(1));

    for dts in [0, 40, 80] {
        assert!(decoder.decode_frame(&[1], dts, 10_000, true, dts == 0));
    }
    // the first frame is stale and dropped
    assert!(seen.lock().unwrap().is_empty());

    // no staleness filter while draining
    decoder.flush();
    assert_eq!(*seen.lock().unwrap(), vec![40, 80]);
    assert_eq!(decoder.state(), DecoderState::Closed);

    let frame: FramePtr = Arc::new(EncodedFrame::new(vec![1u8], 120, 120, true));
    assert!(!decoder.input_frame(&frame, false, false, false));
    assert!(!decoder.decode_frame(&[1], 120, 120, false, true));
    Ok(())
}

#[test]
fn test_callback_may_feed_decoder() -> anyhow::Result<()> {
    let h = harness(Capabilities::default(), Script::default());
    let decoder = Arc::new(Decoder::new(&h264(), &DecoderOptions::default(), &h.negotiator)?);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    let weak = Arc::downgrade(&decoder);
    decoder.set_on_decode(move |frame| {
        let pts = frame.pts().unwrap_or(-1);
        let Some(decoder) = weak.upgrade() else {
            return;
        };
        sink.lock().unwrap().push((pts, decoder.state()));
        if pts == 0 {
            // delivered once this call returns
            assert!(decoder.decode_frame(&[1], 40, 40, false, false));
        }
    });

    assert!(decoder.decode_frame(&[1], 0, 0, false, true));
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(0, DecoderState::Decoding), (40, DecoderState::Decoding)]
    );
    Ok(())
}

#[test]
fn test_callback_may_replace_itself() -> anyhow::Result<()> {
    let h = harness(Capabilities::default(), Script::default());
    let decoder = Arc::new(Decoder::new(&h264(), &DecoderOptions::default(), &h.negotiator)?);
    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));

    let (first_sink, second_sink) = (Arc::clone(&first), Arc::clone(&second));
    let weak = Arc::downgrade(&decoder);
    decoder.set_on_decode(move |frame| {
        first_sink.lock().unwrap().push(frame.pts().unwrap_or(-1));
        if let Some(decoder) = weak.upgrade() {
            let sink = Arc::clone(&second_sink);
            decoder.set_on_decode(move |frame| sink.lock().unwrap().push(frame.pts().unwrap_or(-1)));
        }
    });

    assert!(decoder.decode_frame(&[1], 0, 0, false, true));
    assert!(decoder.decode_frame(&[1], 40, 40, false, false));
    assert_eq!(*first.lock().unwrap(), vec![0]);
    assert_eq!(*second.lock().unwrap(), vec![40]);
    Ok(())
}

#[test]
fn test_async_input_runs_on_decoder_thread() -> anyhow::Result<()> {
    let h = harness(Capabilities::default(), Script::default());
    let mut decoder = Decoder::new(&h264(), &DecoderOptions::default(), &h.negotiator)?;
    let (tx, rx) = mpsc::channel();
    decoder.set_on_decode(move |frame| {
        let on_worker = std::thread::current().name() == Some("decoder thread");
        let _ = tx.send((frame.pts(), on_worker));
    });

    let payload = bytes::Bytes::from_static(&[0, 0, 0, 1, 0x65]);
    let frame: FramePtr = Arc::new(EncodedFrame::transient(payload.clone(), 0, 0, true));
    assert!(decoder.input_frame(&frame, false, true, false));
    assert!(decoder.is_async());

    let (pts, on_worker) = rx.recv_timeout(Duration::from_secs(5))?;
    assert_eq!(pts, Some(0));
    assert!(on_worker);
    assert_eq!(h.recorder.lock().unwrap().packets, vec![payload.to_vec()]);

    decoder.flush();
    assert!(!decoder.is_async());
    Ok(())
}

#[test]
fn test_async_audio_stays_synchronous() -> anyhow::Result<()> {
    let h = harness(Capabilities::default(), Script::default());
    let track = Track::audio(CodecId::Aac, 2, 44100);
    let mut decoder = Decoder::new(&track, &DecoderOptions::default(), &h.negotiator)?;
    let seen = collect(&decoder);

    let frame: FramePtr = Arc::new(EncodedFrame::new(vec![0x21u8, 0x10], 23, 23, true));
    assert!(decoder.input_frame(&frame, false, true, false));
    assert!(!decoder.is_async());
    assert_eq!(*seen.lock().unwrap(), vec![23]);
    Ok(())
}

#[test]
fn test_invalid_async_bound_is_rejected() {
    let h = harness(Capabilities::default(), Script::default());
    let options = DecoderOptions {
        max_async_tasks: 2,
        ..Default::default()
    };
    assert!(Decoder::new(&h264(), &options, &h.negotiator).is_err());
}

fn ffmpeg_negotiator() -> Negotiator {
    crate::testing::init();
    Negotiator::new(Arc::new(CapabilityProbe::disabled()), Arc::new(FfmpegBackend))
}

#[test]
fn test_software_h264_without_hardware() -> anyhow::Result<()> {
    let negotiator = ffmpeg_negotiator();
    if FfmpegBackend.find_decoder(&Candidate::Id(codec::Id::H264)).is_none() {
        eprintln!("skip: h264 decoder not built");
        return Ok(());
    }
    let decoder = Decoder::new(&h264(), &DecoderOptions::default(), &negotiator)?;
    assert!(decoder.codec_name().starts_with("h264") || decoder.codec_name() == "libopenh264");
    assert!(!decoder.needs_merge());
    Ok(())
}

#[test]
fn test_decode_jpeg_keyframe() -> anyhow::Result<()> {
    let negotiator = ffmpeg_negotiator();
    let source = crate::testing::gray_frame(Pixel::YUVJ420P, 64, 48, 0);
    let Some(jpeg) = crate::testing::encode_jpeg(&source)? else {
        eprintln!("skip: mjpeg encoder not built");
        return Ok(());
    };

    let options = DecoderOptions {
        thread_count: 1,
        ..Default::default()
    };
    let track = Track::video(CodecId::Jpeg, 64, 48);
    let decoder = Decoder::new(&track, &options, &negotiator)?;
    assert_eq!(decoder.codec_name(), "mjpeg");

    let (tx, rx) = mpsc::channel();
    decoder.set_on_decode(move |frame| {
        let _ = tx.send(frame);
    });
    assert!(decoder.decode_frame(&jpeg, 40, 40, false, true));

    let frames: Vec<RawFrame> = rx.try_iter().collect();
    assert_eq!(frames.len(), 1);
    let video = frames[0].as_video().expect("video frame");
    assert_eq!((video.width(), video.height()), (64, 48));
    assert_eq!(video.pts(), Some(40));
    assert_eq!(video.dts(), Some(40));
    Ok(())
}

#[test]
fn test_jpeg_keyframe_through_input_frame() -> anyhow::Result<()> {
    let negotiator = ffmpeg_negotiator();
    let source = crate::testing::gray_frame(Pixel::YUVJ420P, 64, 48, 0);
    let Some(jpeg) = crate::testing::encode_jpeg(&source)? else {
        eprintln!("skip: mjpeg encoder not built");
        return Ok(());
    };

    let track = Track::video(CodecId::Jpeg, 64, 48);
    let mut decoder = Decoder::new(&track, &DecoderOptions::default(), &negotiator)?;
    // complete units are not held back waiting for the next dts
    assert!(!decoder.needs_merge());

    let (tx, rx) = mpsc::channel();
    decoder.set_on_decode(move |frame| {
        let _ = tx.send(frame.pts());
    });
    let frame: FramePtr = Arc::new(EncodedFrame::new(jpeg, 40, 40, true));
    assert!(decoder.input_frame(&frame, true, false, true));

    let seen: Vec<Option<i64>> = rx.try_iter().collect();
    assert_eq!(seen, vec![Some(40)]);
    Ok(())
}
