use ffmpeg_next::{Packet, Rational, codec, format::Pixel, frame::Video};

use crate::config::TranscodeConfig;

pub(crate) fn init() {
    crate::init(&TranscodeConfig::default()).unwrap();
}

/// A mid-gray picture with pts and dts set.
pub(crate) fn gray_frame(format: Pixel, width: u32, height: u32, pts: i64) -> Video {
    let mut frame = Video::new(format, width, height);
    for plane in 0..frame.planes() {
        frame.data_mut(plane).fill(128);
    }
    frame.set_pts(Some(pts));
    crate::frame::set_frame_dts(&mut frame, Some(pts));
    frame
}

/// One JPEG access unit, or `None` when this FFmpeg build has no MJPEG encoder.
pub(crate) fn encode_jpeg(frame: &Video) -> anyhow::Result<Option<Vec<u8>>> {
    let Some(mjpeg) = ffmpeg_next::encoder::find(codec::Id::MJPEG) else {
        return Ok(None);
    };
    let mut encoder = codec::Context::new_with_codec(mjpeg).encoder().video()?;
    encoder.set_width(frame.width());
    encoder.set_height(frame.height());
    encoder.set_format(frame.format());
    encoder.set_time_base(Rational(1, 25));
    let mut encoder = encoder.open_as(mjpeg)?;

    encoder.send_frame(frame)?;
    encoder.send_eof()?;
    let mut packet = Packet::empty();
    encoder.receive_packet(&mut packet)?;
    Ok(packet.data().map(<[u8]>::to_vec))
}
