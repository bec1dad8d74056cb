use std::io::Write;
use std::path::Path;

use anyhow::Context as _;
use ffmpeg_next::{Packet, Rational, codec, format::Pixel};

use crate::frame::RawVideoFrame;
use crate::scaler::Rescaler;

/// Writes `frame` to `path` as a still image: JPEG when `format` is
/// `YUVJ420P`, PNG otherwise. The picture is converted to `format` first and
/// keeps its size. Missing parent directories are created.
pub fn save_frame(frame: &RawVideoFrame, path: impl AsRef<Path>, format: Pixel) -> anyhow::Result<()> {
    let path = path.as_ref();
    let id = if format == Pixel::YUVJ420P {
        codec::Id::MJPEG
    } else {
        codec::Id::PNG
    };
    let implementation = ffmpeg_next::encoder::find(id)
        .ok_or_else(|| anyhow::anyhow!("could not find {:?} encoder", id))?;

    let mut encoder = codec::Context::new_with_codec(implementation)
        .encoder()
        .video()
        .context("could not allocate image codec context")?;
    encoder.set_width(frame.width());
    encoder.set_height(frame.height());
    encoder.set_format(format);
    encoder.set_time_base(Rational(1, 1));
    let mut encoder = encoder
        .open_as(implementation)
        .context("could not open image codec")?;

    let picture = Rescaler::new(format, 0, 0)
        .input_frame(frame)
        .ok_or_else(|| anyhow::anyhow!("could not scale the frame"))?;
    encoder
        .send_frame(picture.as_video())
        .context("error sending a frame for encoding")?;
    encoder.send_eof()?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("could not open the file {}", path.display()))?;

    let mut packet = Packet::empty();
    while encoder.receive_packet(&mut packet).is_ok() {
        if let Some(data) = packet.data() {
            file.write_all(data)?;
        }
    }
    file.flush()?;
    log::debug!("screenshot saved: {}", path.display());
    Ok(())
}
