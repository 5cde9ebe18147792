//! Extractor error taxonomy and stderr classification
//!
//! The extractor reports failures as free-text stderr. Classification maps
//! the common cases onto a small error enum so the HTTP edge can pick a
//! sensible status code and message without leaking raw tool output.

use thiserror::Error;

/// Errors produced by the extractor client.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    /// The extractor binary could not be spawned (not installed / not on PATH)
    #[error("Extractor binary not found")]
    ExtractorNotFound,

    /// The extractor does not support this URL, or the remote returned an
    /// HTTP error while probing it
    #[error("URL is not supported: {0}")]
    Unsupported(String),

    /// The media exists but cannot be accessed (private, removed, region lock)
    #[error("Media unavailable: {0}")]
    Unavailable(String),

    /// The extractor exceeded its deadline
    #[error("Extraction timed out")]
    Timeout,

    /// The extractor produced output the client could not understand
    #[error("Invalid extractor output: {0}")]
    InvalidOutput(String),

    /// Any other extractor failure
    #[error("Extraction failed: {0}")]
    Failed(String),
}

/// Classifies extractor stderr into an ExtractionError.
///
/// Order matters: unavailability markers are more specific than the generic
/// "unsupported" ones, so they are checked first.
pub fn classify_stderr(stderr: &str) -> ExtractionError {
    let lower = stderr.to_lowercase();
    let summary = first_error_line(stderr);

    if lower.contains("private video")
        || lower.contains("video unavailable")
        || lower.contains("this video is not available")
        || lower.contains("video is private")
        || lower.contains("has been removed")
        || lower.contains("members-only")
    {
        return ExtractionError::Unavailable(summary);
    }

    if lower.contains("unsupported url")
        || lower.contains("is not a valid url")
        || lower.contains("no video formats")
        || lower.contains("http error 404")
        || lower.contains("http error 410")
        || lower.contains("unable to download webpage")
    {
        return ExtractionError::Unsupported(summary);
    }

    ExtractionError::Failed(summary)
}

/// Pulls the first ERROR: line out of extractor stderr, falling back to the
/// last non-empty line, so callers get one readable sentence instead of the
/// whole dump.
fn first_error_line(stderr: &str) -> String {
    for line in stderr.lines() {
        let trimmed = line.trim();
        if let Some(msg) = trimmed.strip_prefix("ERROR:") {
            return msg.trim().to_string();
        }
    }
    stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .next_back()
        .unwrap_or("extractor failed with no output")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_unavailable() {
        let err = classify_stderr("ERROR: Private video. Sign in if you've been granted access");
        assert!(matches!(err, ExtractionError::Unavailable(_)));

        let err = classify_stderr("ERROR: Video unavailable");
        assert!(matches!(err, ExtractionError::Unavailable(_)));
    }

    #[test]
    fn test_classify_unsupported() {
        let err = classify_stderr("ERROR: Unsupported URL: https://example.com/page");
        assert!(matches!(err, ExtractionError::Unsupported(_)));

        let err = classify_stderr("ERROR: unable to download webpage: HTTP Error 404: Not Found");
        assert!(matches!(err, ExtractionError::Unsupported(_)));
    }

    #[test]
    fn test_classify_generic() {
        let err = classify_stderr("ERROR: something exotic happened");
        assert_eq!(
            err,
            ExtractionError::Failed("something exotic happened".to_string())
        );
    }

    #[test]
    fn test_first_error_line_prefers_error_prefix() {
        let stderr = "WARNING: slow connection\nERROR: Unsupported URL: x\ntrailing noise";
        let err = classify_stderr(stderr);
        assert_eq!(err, ExtractionError::Unsupported("Unsupported URL: x".to_string()));
    }

    #[test]
    fn test_first_error_line_fallback_last_line() {
        let err = classify_stderr("some noise\nmore noise\n\n");
        assert_eq!(err, ExtractionError::Failed("more noise".to_string()));
    }

    #[test]
    fn test_empty_stderr() {
        let err = classify_stderr("");
        assert_eq!(
            err,
            ExtractionError::Failed("extractor failed with no output".to_string())
        );
    }
}
