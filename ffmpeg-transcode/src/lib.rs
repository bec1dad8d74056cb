use std::sync::Once;

use crate::config::TranscodeConfig;

/// Registers FFmpeg components once per process and applies the codec
/// library verbosity switch from `config`. Safe to call more than once; only
/// the log level is re-applied on later calls.
pub fn init(config: &TranscodeConfig) -> anyhow::Result<()> {
    static REGISTER: Once = Once::new();
    let mut result = Ok(());
    REGISTER.call_once(|| {
        result = ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e));
    });
    result?;
    set_ffmpeg_log(config.enable_ffmpeg_log);
    Ok(())
}

/// Turns FFmpeg's own diagnostic output on or off at runtime.
pub fn set_ffmpeg_log(enabled: bool) {
    use ffmpeg_next::util::log::{Level, set_level};
    if enabled {
        set_level(Level::Info);
    } else {
        set_level(Level::Quiet);
    }
}

pub mod codec;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod frame;
pub mod hw;
pub mod merge;
pub mod pool;
pub mod resampler;
pub mod scaler;
pub mod sink;
pub mod snapshot;
pub mod task;
pub mod track;

#[cfg(test)]
mod testing;
