use thiserror::Error;

use crate::convert::ConversionError;
use crate::extract::errors::ExtractionError;

/// Centralized error type for the application.
///
/// Domain errors (`ExtractionError`, `ConversionError`) convert into this
/// enum so callers above the pipeline can handle everything uniformly; the
/// HTTP edge maps it onto status codes in `server::error`.
#[derive(Error, Debug)]
pub enum AppError {
    /// Extractor subprocess failures
    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    /// Transcoder subprocess failures
    #[error("Conversion error: {0}")]
    Conversion(#[from] ConversionError),

    /// Outbound HTTP failures (image proxy)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing errors
    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    /// Request validation failures
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Catch-all for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Type alias for Result with AppError
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Returns the error category used in log lines.
    pub fn category(&self) -> &'static str {
        match self {
            AppError::Extraction(_) => "extraction",
            AppError::Conversion(_) => "conversion",
            AppError::Http(_) => "http",
            AppError::Io(_) => "io",
            AppError::Url(_) => "url_parsing",
            AppError::Validation(_) => "validation",
            AppError::Timeout(_) => "timeout",
            AppError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_validation() {
        let err = AppError::Validation("Invalid URL".to_string());
        let display = format!("{}", err);
        assert!(display.contains("Validation error"));
        assert!(display.contains("Invalid URL"));
    }

    #[test]
    fn test_error_display_timeout() {
        let err = AppError::Timeout("extractor exceeded 30s".to_string());
        assert!(err.to_string().contains("30s"));
    }

    #[test]
    fn test_error_category() {
        assert_eq!(AppError::Validation("x".into()).category(), "validation");
        assert_eq!(AppError::Internal("x".into()).category(), "internal");
        assert_eq!(
            AppError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "x")).category(),
            "io"
        );
    }

    #[test]
    fn test_extraction_error_converts() {
        let err: AppError = ExtractionError::Timeout.into();
        assert_eq!(err.category(), "extraction");
    }
}
