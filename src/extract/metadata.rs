//! Metadata extraction (analyze mode)
//!
//! Runs the extractor in JSON-dump mode and normalizes its output into the
//! public `MediaInfo` model:
//!
//! - Manifest/storyboard entries and codec-less entries are dropped
//! - Container extensions are canonicalized (m4a/m4v -> mp4, webm family,
//!   ogg -> opus)
//! - Formats are deduplicated by (kind, ext, resolution) and ordered video
//!   first, then audio, each by descending resolution

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::core::config;
use crate::core::config::validation::ANALYZE_BUFFER_CAP;
use crate::core::process::run_with_timeout;
use crate::core::validation::is_url_allowed;
use crate::extract::errors::{classify_stderr, ExtractionError};

/// Whether a format carries video or only audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    Video,
    Audio,
}

/// One selectable format, normalized from extractor output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatDescriptor {
    #[serde(rename = "formatId")]
    pub format_id: String,
    #[serde(rename = "containerExt")]
    pub ext: String,
    /// "WxH" or "Np" for video, "audio" for audio-only, "unknown" otherwise
    pub resolution: String,
    /// Human-readable size, "~"-prefixed when approximate, or "unknown"
    pub filesize: String,
    pub kind: FormatKind,
}

/// Normalized metadata for one analyzed URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    pub title: String,
    pub thumbnail: Option<String>,
    /// "H:MM:SS", "M:SS", or "unknown"
    pub duration: String,
    pub formats: Vec<FormatDescriptor>,
}

impl MediaInfo {
    /// Looks up a format by its id.
    pub fn format(&self, format_id: &str) -> Option<&FormatDescriptor> {
        self.formats.iter().find(|f| f.format_id == format_id)
    }
}

// Raw extractor JSON. Only the fields the normalizer needs; everything else
// in the dump is ignored.
#[derive(Debug, Deserialize)]
struct RawMetadata {
    title: Option<String>,
    thumbnail: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    formats: Vec<RawFormat>,
}

#[derive(Debug, Default, Deserialize)]
struct RawFormat {
    format_id: Option<String>,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    resolution: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    filesize: Option<u64>,
    filesize_approx: Option<u64>,
    protocol: Option<String>,
}

/// Invoke the extractor in JSON-dump mode and normalize the result.
///
/// Playlists, warnings, and home-calls are disabled; stdout is read with a
/// 10 MiB cap and the whole operation is bounded by the 30 s analyze
/// timeout.
pub async fn analyze(url: &str) -> Result<MediaInfo, ExtractionError> {
    // Defense in depth: the edge validates first, but never spawn for a URL
    // the policy rejects.
    if !is_url_allowed(url) {
        return Err(ExtractionError::Unsupported("URL rejected by policy".to_string()));
    }

    let bin = &*config::EXTRACTOR_BIN;
    let mut child = Command::new(bin)
        .args([
            "--dump-json",
            "--no-playlist",
            "--no-warnings",
            "--no-call-home",
            url,
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExtractionError::ExtractorNotFound
            } else {
                ExtractionError::Failed(format!("failed to spawn extractor: {}", e))
            }
        })?;

    let mut stdout = child.stdout.take().ok_or_else(|| {
        ExtractionError::Failed("failed to capture extractor stdout".to_string())
    })?;
    let mut stderr = child.stderr.take().ok_or_else(|| {
        ExtractionError::Failed("failed to capture extractor stderr".to_string())
    })?;

    let run = async {
        let mut out = Vec::new();
        let mut err = Vec::new();
        // Read one past the cap so overflow is detectable. Both pipes are
        // drained concurrently; reading them in sequence can deadlock when
        // the extractor fills the other pipe's buffer.
        let mut limited = (&mut stdout).take(ANALYZE_BUFFER_CAP as u64 + 1);
        let (out_read, err_read) = tokio::join!(
            limited.read_to_end(&mut out),
            stderr.read_to_end(&mut err)
        );
        out_read
            .map_err(|e| ExtractionError::Failed(format!("failed reading extractor output: {}", e)))?;
        err_read
            .map_err(|e| ExtractionError::Failed(format!("failed reading extractor stderr: {}", e)))?;
        let status = child
            .wait()
            .await
            .map_err(|e| ExtractionError::Failed(format!("extractor wait failed: {}", e)))?;
        Ok::<_, ExtractionError>((out, err, status))
    };

    let (out, err, status) = tokio::time::timeout(config::timeouts::analyze(), run)
        .await
        .map_err(|_| ExtractionError::Timeout)??;

    if out.len() > ANALYZE_BUFFER_CAP {
        return Err(ExtractionError::InvalidOutput(
            "metadata output exceeded buffer cap".to_string(),
        ));
    }

    if !status.success() {
        let stderr_text = String::from_utf8_lossy(&err);
        log::warn!("Extractor analyze failed for {}: {}", url, stderr_text.trim());
        return Err(classify_stderr(&stderr_text));
    }

    let raw: RawMetadata = serde_json::from_slice(&out)
        .map_err(|e| ExtractionError::InvalidOutput(format!("metadata parse error: {}", e)))?;

    Ok(normalize(raw))
}

/// Returns the extractor's version string, if the binary is runnable.
///
/// Used for a startup log line only; failures are not fatal.
pub async fn binary_version() -> Option<String> {
    let mut cmd = Command::new(&*config::EXTRACTOR_BIN);
    cmd.arg("--version");
    run_with_timeout(&mut cmd, "extractor version probe", Duration::from_secs(10))
        .await
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|v| !v.is_empty())
}

// ======================== Normalization ========================

fn normalize(raw: RawMetadata) -> MediaInfo {
    let mut formats = Vec::new();

    for f in raw.formats {
        if let Some(desc) = normalize_format(&f) {
            formats.push(desc);
        }
    }

    let formats = dedup_formats(formats);
    let formats = order_formats(formats);

    MediaInfo {
        title: raw.title.filter(|t| !t.trim().is_empty()).unwrap_or_else(|| "Unknown".to_string()),
        thumbnail: raw.thumbnail,
        duration: format_duration(raw.duration),
        formats,
    }
}

fn codec_present(codec: &Option<String>) -> bool {
    match codec {
        Some(c) => !c.is_empty() && c != "none",
        None => false,
    }
}

fn is_manifest(f: &RawFormat) -> bool {
    if let Some(p) = &f.protocol {
        let p = p.to_lowercase();
        if p.contains("m3u8") || p.contains("dash") || p.contains("ism") {
            return true;
        }
    }
    matches!(f.ext.as_deref(), Some("m3u8") | Some("mhtml"))
}

fn canonical_ext(ext: &str) -> String {
    match ext {
        "m4a" | "m4v" => "mp4".to_string(),
        "webma" | "webmv" => "webm".to_string(),
        "ogg" => "opus".to_string(),
        other => other.to_string(),
    }
}

fn normalize_format(f: &RawFormat) -> Option<FormatDescriptor> {
    let format_id = f.format_id.as_deref().filter(|s| !s.is_empty())?;
    let ext = f.ext.as_deref().filter(|s| !s.is_empty())?;

    if is_manifest(f) {
        return None;
    }

    let has_video = codec_present(&f.vcodec);
    let has_audio = codec_present(&f.acodec);
    if !has_video && !has_audio {
        return None;
    }

    let kind = if has_video { FormatKind::Video } else { FormatKind::Audio };

    let resolution = match kind {
        FormatKind::Audio => "audio".to_string(),
        FormatKind::Video => {
            let derived = derive_resolution(f);
            // A video entry with no dimension hint at all is dropped
            derived?
        }
    };

    let filesize = match (f.filesize, f.filesize_approx) {
        (Some(exact), _) => human_size(exact),
        (None, Some(approx)) => format!("~{}", human_size(approx)),
        (None, None) => "unknown".to_string(),
    };

    Some(FormatDescriptor {
        format_id: format_id.to_string(),
        ext: canonical_ext(ext),
        resolution,
        filesize,
        kind,
    })
}

/// Resolution for a video entry: prefer the extractor's own string when it
/// already looks like "WxH" or "Np", else derive from the dimensions.
/// Returns None when no dimension hint exists.
fn derive_resolution(f: &RawFormat) -> Option<String> {
    if let Some(res) = f.resolution.as_deref() {
        if looks_like_resolution(res) {
            return Some(res.to_string());
        }
    }
    match (f.width, f.height) {
        (Some(w), Some(h)) => Some(format!("{}x{}", w, h)),
        (None, Some(h)) => Some(format!("{}p", h)),
        _ => None,
    }
}

fn looks_like_resolution(s: &str) -> bool {
    if let Some((w, h)) = s.split_once('x') {
        return !w.is_empty()
            && !h.is_empty()
            && w.chars().all(|c| c.is_ascii_digit())
            && h.chars().all(|c| c.is_ascii_digit());
    }
    s.len() > 1
        && s.ends_with('p')
        && s[..s.len() - 1].chars().all(|c| c.is_ascii_digit())
}

/// Collapse duplicates sharing (kind, ext, resolution), preferring the entry
/// with a known size.
fn dedup_formats(formats: Vec<FormatDescriptor>) -> Vec<FormatDescriptor> {
    let mut index: HashMap<(FormatKind, String, String), usize> = HashMap::new();
    let mut out: Vec<FormatDescriptor> = Vec::new();

    for f in formats {
        let key = (f.kind, f.ext.clone(), f.resolution.clone());
        match index.get(&key) {
            None => {
                index.insert(key, out.len());
                out.push(f);
            }
            Some(&i) => {
                if out[i].filesize == "unknown" && f.filesize != "unknown" {
                    out[i] = f;
                }
            }
        }
    }

    out
}

/// Order: video before audio; within each kind, descending numeric
/// resolution.
fn order_formats(mut formats: Vec<FormatDescriptor>) -> Vec<FormatDescriptor> {
    formats.sort_by(|a, b| {
        let kind_rank = |k: FormatKind| match k {
            FormatKind::Video => 0u8,
            FormatKind::Audio => 1u8,
        };
        kind_rank(a.kind)
            .cmp(&kind_rank(b.kind))
            .then_with(|| resolution_rank(&b.resolution).cmp(&resolution_rank(&a.resolution)))
    });
    formats
}

/// Numeric rank for sorting: vertical pixels for video strings, 0 for
/// "audio"/"unknown".
fn resolution_rank(res: &str) -> u64 {
    if let Some((_, h)) = res.split_once('x') {
        return h.parse().unwrap_or(0);
    }
    if let Some(n) = res.strip_suffix('p') {
        return n.parse().unwrap_or(0);
    }
    0
}

/// Human-readable size with two decimals, e.g. "42.13 MB".
fn human_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GB", b / GB)
    } else if b >= MB {
        format!("{:.2} MB", b / MB)
    } else if b >= KB {
        format!("{:.2} KB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

/// "H:MM:SS" above an hour, "M:SS" below, "unknown" when absent.
fn format_duration(duration: Option<f64>) -> String {
    let secs = match duration {
        Some(d) if d.is_finite() && d >= 0.0 => d.round() as u64,
        _ => return "unknown".to_string(),
    };

    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(v: serde_json::Value) -> RawMetadata {
        serde_json::from_value(v).expect("valid raw metadata")
    }

    // ==================== Normalization Tests ====================

    #[test]
    fn test_normalize_skips_incomplete_entries() {
        let info = normalize(raw(serde_json::json!({
            "title": "Clip",
            "formats": [
                {"ext": "mp4", "vcodec": "avc1", "height": 720},
                {"format_id": "1", "vcodec": "avc1", "height": 720},
                {"format_id": "2", "ext": "mp4", "vcodec": "none", "acodec": "none"},
            ]
        })));
        assert!(info.formats.is_empty());
    }

    #[test]
    fn test_normalize_skips_manifests() {
        let info = normalize(raw(serde_json::json!({
            "title": "Clip",
            "formats": [
                {"format_id": "hls-1", "ext": "mp4", "vcodec": "avc1", "height": 720,
                 "protocol": "m3u8_native"},
                {"format_id": "sb0", "ext": "mhtml", "vcodec": "none", "acodec": "none"},
                {"format_id": "22", "ext": "mp4", "vcodec": "avc1", "acodec": "mp4a",
                 "height": 720, "protocol": "https"},
            ]
        })));
        assert_eq!(info.formats.len(), 1);
        assert_eq!(info.formats[0].format_id, "22");
    }

    #[test]
    fn test_normalize_kind_by_codec_presence() {
        let info = normalize(raw(serde_json::json!({
            "title": "Clip",
            "formats": [
                {"format_id": "v", "ext": "mp4", "vcodec": "avc1", "acodec": "none", "height": 1080},
                {"format_id": "a", "ext": "m4a", "vcodec": "none", "acodec": "mp4a"},
            ]
        })));
        assert_eq!(info.formats[0].kind, FormatKind::Video);
        assert_eq!(info.formats[1].kind, FormatKind::Audio);
        assert_eq!(info.formats[1].resolution, "audio");
    }

    #[test]
    fn test_normalize_canonicalizes_extensions() {
        let info = normalize(raw(serde_json::json!({
            "title": "Clip",
            "formats": [
                {"format_id": "a", "ext": "m4a", "acodec": "mp4a"},
                {"format_id": "b", "ext": "webma", "acodec": "opus"},
                {"format_id": "c", "ext": "ogg", "acodec": "vorbis"},
                {"format_id": "d", "ext": "m4v", "vcodec": "avc1", "height": 480},
            ]
        })));
        let exts: Vec<&str> = info.formats.iter().map(|f| f.ext.as_str()).collect();
        // Video (mp4 from m4v) sorts first, then the three audio entries
        assert_eq!(exts, vec!["mp4", "mp4", "webm", "opus"]);
    }

    #[test]
    fn test_normalize_video_without_dimensions_dropped() {
        let info = normalize(raw(serde_json::json!({
            "title": "Clip",
            "formats": [
                {"format_id": "v", "ext": "mp4", "vcodec": "avc1"},
            ]
        })));
        assert!(info.formats.is_empty());
    }

    #[test]
    fn test_resolution_preference_order() {
        // Extractor string kept when well-formed
        let f: RawFormat = serde_json::from_value(serde_json::json!({
            "format_id": "v", "ext": "mp4", "vcodec": "avc1",
            "resolution": "1280x720", "width": 640, "height": 360
        }))
        .unwrap();
        assert_eq!(derive_resolution(&f), Some("1280x720".to_string()));

        // Malformed string falls back to dimensions
        let f: RawFormat = serde_json::from_value(serde_json::json!({
            "format_id": "v", "ext": "mp4", "vcodec": "avc1",
            "resolution": "hd", "width": 640, "height": 360
        }))
        .unwrap();
        assert_eq!(derive_resolution(&f), Some("640x360".to_string()));

        // Height alone becomes "Np"
        let f: RawFormat = serde_json::from_value(serde_json::json!({
            "format_id": "v", "ext": "mp4", "vcodec": "avc1", "height": 720
        }))
        .unwrap();
        assert_eq!(derive_resolution(&f), Some("720p".to_string()));
    }

    #[test]
    fn test_filesize_exact_approx_unknown() {
        let info = normalize(raw(serde_json::json!({
            "title": "Clip",
            "formats": [
                {"format_id": "a", "ext": "mp3", "acodec": "mp3", "filesize": 44170000u64},
                {"format_id": "b", "ext": "opus", "acodec": "opus", "filesize_approx": 8912896u64},
                {"format_id": "c", "ext": "flac", "acodec": "flac"},
            ]
        })));
        assert_eq!(info.formats[0].filesize, "42.13 MB");
        assert_eq!(info.formats[1].filesize, "~8.50 MB");
        assert_eq!(info.formats[2].filesize, "unknown");
    }

    #[test]
    fn test_dedup_prefers_known_size() {
        let info = normalize(raw(serde_json::json!({
            "title": "Clip",
            "formats": [
                {"format_id": "1", "ext": "mp4", "vcodec": "avc1", "height": 720},
                {"format_id": "2", "ext": "mp4", "vcodec": "avc1", "height": 720,
                 "filesize": 1048576u64},
            ]
        })));
        assert_eq!(info.formats.len(), 1);
        assert_eq!(info.formats[0].format_id, "2");
        assert_eq!(info.formats[0].filesize, "1.00 MB");
    }

    #[test]
    fn test_ordering_video_first_descending() {
        let info = normalize(raw(serde_json::json!({
            "title": "Clip",
            "formats": [
                {"format_id": "a1", "ext": "opus", "acodec": "opus"},
                {"format_id": "v360", "ext": "mp4", "vcodec": "avc1", "height": 360},
                {"format_id": "v1080", "ext": "mp4", "vcodec": "avc1", "height": 1080},
                {"format_id": "v720", "ext": "webm", "vcodec": "vp9", "height": 720},
            ]
        })));
        let ids: Vec<&str> = info.formats.iter().map(|f| f.format_id.as_str()).collect();
        assert_eq!(ids, vec!["v1080", "v720", "v360", "a1"]);
    }

    #[test]
    fn test_dedup_key_includes_kind_ext_resolution() {
        let info = normalize(raw(serde_json::json!({
            "title": "Clip",
            "formats": [
                {"format_id": "1", "ext": "mp4", "vcodec": "avc1", "height": 720},
                {"format_id": "2", "ext": "webm", "vcodec": "vp9", "height": 720},
                {"format_id": "3", "ext": "mp4", "vcodec": "avc1", "height": 1080},
            ]
        })));
        assert_eq!(info.formats.len(), 3);
    }

    // ==================== Formatting Tests ====================

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Some(9.0)), "0:09");
        assert_eq!(format_duration(Some(75.0)), "1:15");
        assert_eq!(format_duration(Some(3600.0)), "1:00:00");
        assert_eq!(format_duration(Some(3725.0)), "1:02:05");
        assert_eq!(format_duration(None), "unknown");
        assert_eq!(format_duration(Some(f64::NAN)), "unknown");
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.00 KB");
        assert_eq!(human_size(44170000), "42.13 MB");
        assert_eq!(human_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn test_looks_like_resolution() {
        assert!(looks_like_resolution("1920x1080"));
        assert!(looks_like_resolution("720p"));
        assert!(!looks_like_resolution("hd"));
        assert!(!looks_like_resolution("p"));
        assert!(!looks_like_resolution("x1080"));
        assert!(!looks_like_resolution("1920x"));
    }

    #[test]
    fn test_media_info_format_lookup() {
        let info = normalize(raw(serde_json::json!({
            "title": "Clip",
            "formats": [
                {"format_id": "22", "ext": "mp4", "vcodec": "avc1", "height": 720},
            ]
        })));
        assert!(info.format("22").is_some());
        assert!(info.format("999").is_none());
    }

    #[test]
    fn test_title_fallback() {
        let info = normalize(raw(serde_json::json!({"formats": []})));
        assert_eq!(info.title, "Unknown");
    }
}
