use std::path::Path;

use serde::{Deserialize, Serialize};

/// Default bound of an engine's async task queue.
pub const DEFAULT_MAX_ASYNC_TASKS: usize = 30;

/// Transcoding settings shared by every decoder/encoder of a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    /// Decoder thread-count hint; 0 lets the codec pick.
    pub decode_threads: usize,
    /// Encoder thread-count hint; 0 lets the codec pick.
    pub encode_threads: usize,
    /// Bound of the async task queue, must be within 3..=1000.
    pub max_async_tasks: usize,
    pub check_nvidia: bool,
    pub check_qsv: bool,
    pub check_amf: bool,
    /// Forward FFmpeg's own diagnostics.
    pub enable_ffmpeg_log: bool,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            decode_threads: 0,
            encode_threads: 0,
            max_async_tasks: DEFAULT_MAX_ASYNC_TASKS,
            check_nvidia: true,
            check_qsv: true,
            check_amf: true,
            enable_ffmpeg_log: false,
        }
    }
}

impl TranscodeConfig {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).map_err(|e| anyhow::anyhow!("parse transcode config: {}", e))
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read config {}: {}", path.display(), e))?;
        Self::from_json(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() -> anyhow::Result<()> {
        let config = TranscodeConfig::from_json(r#"{"check_nvidia": false, "decode_threads": 4}"#)?;
        assert!(!config.check_nvidia);
        assert!(config.check_qsv);
        assert_eq!(config.decode_threads, 4);
        assert_eq!(config.max_async_tasks, DEFAULT_MAX_ASYNC_TASKS);
        assert!(!config.enable_ffmpeg_log);
        Ok(())
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let err = TranscodeConfig::from_json("{ not json").unwrap_err();
        assert!(err.to_string().contains("parse transcode config"));
    }
}
