//! Conversion targets and transcoder invocation profiles
//!
//! The transcoder reads an encoded stream on stdin (`-i pipe:0`) and writes
//! the re-encoded or re-muxed result to stdout (`pipe:1`). Each target
//! format maps to a fixed argument set; video targets are remuxed with
//! `-c copy`, audio targets are re-encoded at 192k/44100.

use thiserror::Error;

/// Errors that can occur while driving the transcoder
#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("Transcoder not found in PATH")]
    TranscoderNotFound,

    #[error("Transcoder process failed: {0}")]
    ProcessError(String),

    #[error("Unknown target format: {0}")]
    UnknownFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ConversionResult<T> = Result<T, ConversionError>;

/// Supported conversion targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFormat {
    Mp3,
    Aac,
    Mp4,
    Webm,
}

impl TargetFormat {
    /// Parse from a user-supplied format string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "mp3" => Some(Self::Mp3),
            "aac" => Some(Self::Aac),
            "mp4" => Some(Self::Mp4),
            "webm" => Some(Self::Webm),
            _ => None,
        }
    }

    /// File extension for the converted output.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Aac => "aac",
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
        }
    }

    /// Whether this target only carries audio.
    pub fn is_audio(&self) -> bool {
        matches!(self, Self::Mp3 | Self::Aac)
    }

    /// Transcoder argument set between `-i pipe:0` and `pipe:1`.
    ///
    /// mp4 output over a pipe needs fragmented moov since the muxer cannot
    /// seek back to write the header.
    pub fn transcoder_args(&self) -> &'static [&'static str] {
        match self {
            Self::Mp3 => &["-vn", "-acodec", "libmp3lame", "-ab", "192k", "-ar", "44100", "-f", "mp3"],
            Self::Aac => &["-vn", "-acodec", "aac", "-ab", "192k", "-ar", "44100", "-f", "adts"],
            Self::Mp4 => &["-c", "copy", "-f", "mp4", "-movflags", "frag_keyframe+empty_moov"],
            Self::Webm => &["-c", "copy", "-f", "webm"],
        }
    }

    /// MIME type for the converted output.
    pub fn content_type(&self) -> &'static str {
        mime_for_ext(self.extension())
    }
}

/// Checks whether the transcoder binary is runnable. Used for startup
/// diagnostics only; conversion requests still fail per-request if the
/// binary disappears later.
pub async fn check_transcoder() -> bool {
    let mut cmd = tokio::process::Command::new(&*crate::core::config::TRANSCODER_BIN);
    cmd.arg("-version");
    crate::core::process::run_with_timeout(&mut cmd, "transcoder probe", std::time::Duration::from_secs(10))
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Container extension to MIME type table used for download responses.
pub fn mime_for_ext(ext: &str) -> &'static str {
    match ext.to_lowercase().as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "ogg" => "audio/ogg",
        "opus" => "audio/opus",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}
