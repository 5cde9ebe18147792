//! API error type and HTTP mapping
//!
//! Errors raised before any response bytes are flushed become JSON bodies
//! of the form `{"error": {"message": "..."}}`. Mid-stream failures never
//! reach this type; they destroy the stream and are inspected out of band
//! via the job record and the progress bus.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::convert::ConversionError;
use crate::core::config;
use crate::extract::ExtractionError;
use crate::queue::QueueError;
use crate::server::rate_limit::RateLimitStatus;

#[derive(Debug)]
pub enum ApiError {
    /// Bad URL, missing fields, unknown target format, oversize batch
    BadRequest(String),
    /// Origin not admitted in production mode
    Forbidden(String),
    /// Unknown jobId / downloadId
    NotFound(String),
    /// start refused because another job holds the active slot
    Conflict(String),
    /// Sliding window exceeded; carries the RateLimit-* header values
    RateLimited(RateLimitStatus),
    /// Extractor failures surfacing before the stream starts
    Extraction(ExtractionError),
    /// Transcoder failures surfacing before the stream starts
    Conversion(ConversionError),
    /// Catch-all
    Internal(String),
}

impl From<ExtractionError> for ApiError {
    fn from(e: ExtractionError) -> Self {
        ApiError::Extraction(e)
    }
}

impl From<ConversionError> for ApiError {
    fn from(e: ConversionError) -> Self {
        ApiError::Conversion(e)
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::JobNotFound(_) => ApiError::NotFound(e.to_string()),
            _ => ApiError::BadRequest(e.to_string()),
        }
    }
}

impl From<crate::core::error::AppError> for ApiError {
    fn from(e: crate::core::error::AppError) -> Self {
        use crate::core::error::AppError;
        match e {
            AppError::Extraction(inner) => ApiError::Extraction(inner),
            AppError::Conversion(inner) => ApiError::Conversion(inner),
            AppError::Validation(msg) => ApiError::BadRequest(msg),
            AppError::Timeout(msg) => ApiError::Internal(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

fn error_body(message: &str) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "error": { "message": message }
    }))
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, error_body(&msg)).into_response()
            }
            ApiError::Forbidden(msg) => {
                (StatusCode::FORBIDDEN, error_body(&msg)).into_response()
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, error_body(&msg)).into_response(),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, error_body(&msg)).into_response(),
            ApiError::RateLimited(status) => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    error_body("Too many requests, please slow down"),
                )
                    .into_response();
                let headers = response.headers_mut();
                headers.insert("RateLimit-Limit", status.limit.into());
                headers.insert("RateLimit-Remaining", status.remaining.into());
                headers.insert("RateLimit-Reset", status.reset_secs.into());
                headers.insert(
                    header::RETRY_AFTER,
                    status.reset_secs.into(),
                );
                response
            }
            ApiError::Extraction(e) => {
                let status = match e {
                    ExtractionError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                    ExtractionError::Unsupported(_) | ExtractionError::Unavailable(_) => {
                        StatusCode::BAD_GATEWAY
                    }
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let message = if config::is_production() {
                    match e {
                        ExtractionError::Timeout => "Extraction timed out".to_string(),
                        other => other.to_string(),
                    }
                } else {
                    e.to_string()
                };
                (status, error_body(&message)).into_response()
            }
            ApiError::Conversion(e) => {
                (StatusCode::INTERNAL_SERVER_ERROR, error_body(&e.to_string())).into_response()
            }
            ApiError::Internal(msg) => {
                log::error!("Internal error: {}", msg);
                let message = if config::is_production() {
                    "Internal server error".to_string()
                } else {
                    msg
                };
                (StatusCode::INTERNAL_SERVER_ERROR, error_body(&message)).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_request_maps_to_400() {
        let resp = ApiError::BadRequest("Invalid URL".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_not_found_maps_to_404() {
        let resp = ApiError::NotFound("Job not found".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_conflict_maps_to_409() {
        let resp = ApiError::Conflict("busy".into()).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_rate_limited_carries_headers() {
        let resp = ApiError::RateLimited(RateLimitStatus {
            limit: 30,
            remaining: 0,
            reset_secs: 120,
        })
        .into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()["RateLimit-Limit"], "30");
        assert_eq!(resp.headers()["RateLimit-Remaining"], "0");
        assert_eq!(resp.headers()["RateLimit-Reset"], "120");
        assert_eq!(resp.headers()["retry-after"], "120");
    }

    #[test]
    fn test_extraction_timeout_maps_to_504() {
        let resp = ApiError::Extraction(ExtractionError::Timeout).into_response();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_queue_error_conversion() {
        let err: ApiError = QueueError::JobNotFound("x".into()).into();
        assert!(matches!(err, ApiError::NotFound(_)));
        let err: ApiError = QueueError::MissingSource.into();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }
}
