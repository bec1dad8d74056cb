use std::sync::{Arc, Mutex, PoisonError};

use ffmpeg_next::{format::Pixel, frame::Video};
use ffmpeg_transcode::{
    codec::{FfmpegBackend, Negotiator},
    config::TranscodeConfig,
    decoder::{Decoder, DecoderOptions},
    encoder::{Encoder, Settings},
    frame::{FramePtr, RawFrame, RawVideoFrame},
    hw::CapabilityProbe,
    sink::FrameSink,
    track::{CodecId, Track},
};
use futures::StreamExt;

const CHECK_WIDTH: u32 = 64;
const CHECK_HEIGHT: u32 = 48;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("ffmpeg_transcode", log::LevelFilter::Debug)
        .init();
}

fn load_config() -> anyhow::Result<TranscodeConfig> {
    match std::env::args().nth(1) {
        Some(path) => TranscodeConfig::load(&path),
        None => Ok(TranscodeConfig::default()),
    }
}

fn report_selections(negotiator: &Negotiator) {
    for codec in CodecId::ALL {
        match negotiator.select_decoder(codec, &[]) {
            Ok(selection) => log::info!("{} decoder: {}", codec, selection.chosen.name),
            Err(e) => log::warn!("{:#}", e),
        }
        if codec.is_video() {
            match negotiator.select_encoder(codec, &[]) {
                Ok(selection) => log::info!("{} encoder: {}", codec, selection.chosen.name),
                Err(e) => log::warn!("{:#}", e),
            }
        }
    }
}

/// Round-trips a few gray pictures through the JPEG encoder and the async
/// decoder, reading the decoded frames back from a [`FrameSink`] stream.
async fn check_pipeline(config: &TranscodeConfig, negotiator: &Negotiator) -> anyhow::Result<usize> {
    let settings = Settings {
        width: CHECK_WIDTH,
        height: CHECK_HEIGHT,
        ..Settings::from_config(config)
    };
    let mut encoder = Encoder::new(CodecId::Jpeg, &settings, negotiator)?;
    let encoded = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&encoded);
    encoder.set_on_encode(move |frame| {
        sink.lock().unwrap_or_else(PoisonError::into_inner).push(frame);
    });
    for pts in [0, 40, 80] {
        let mut picture = Video::new(Pixel::YUV420P, CHECK_WIDTH, CHECK_HEIGHT);
        for plane in 0..picture.planes() {
            picture.data_mut(plane).fill(128);
        }
        picture.set_pts(Some(pts));
        encoder.input_frame(&RawVideoFrame::from(picture), false);
    }
    encoder.flush();
    let packets = std::mem::take(&mut *encoded.lock().unwrap_or_else(PoisonError::into_inner));

    let track = Track::video(CodecId::Jpeg, CHECK_WIDTH, CHECK_HEIGHT);
    let mut decoder = Decoder::new(&track, &DecoderOptions::from_config(config), negotiator)?;
    let frames: FrameSink<RawFrame> = FrameSink::new(packets.len() + 1);
    decoder.set_on_decode(frames.callback());
    let reader = tokio::spawn(frames.stream().map(|frame| frame.pts()).collect::<Vec<_>>());

    for packet in packets {
        let packet: FramePtr = Arc::new(packet);
        decoder.input_frame(&packet, false, true, true);
    }
    decoder.flush();
    frames.close();

    let decoded = reader.await?;
    log::info!("pipeline check decoded pts {:?}", decoded);
    Ok(decoded.len())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let config = load_config()?;
    ffmpeg_transcode::init(&config)?;

    let probe = Arc::new(CapabilityProbe::new(&config));
    let caps = probe.capabilities();
    log::info!(
        "hardware: nvidia={} qsv={} amf={}",
        caps.nvidia,
        caps.qsv,
        caps.amf
    );

    let negotiator = Negotiator::new(probe, Arc::new(FfmpegBackend));
    report_selections(&negotiator);

    match check_pipeline(&config, &negotiator).await {
        Ok(count) => log::info!("pipeline check passed, {} frames", count),
        Err(e) => log::warn!("pipeline check failed: {:#}", e),
    }
    Ok(())
}
