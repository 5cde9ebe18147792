//! Thumbnail image proxy
//!
//! Fetches a remote image on behalf of the browser (the media hosts do not
//! serve CORS headers) and relays the bytes. The URL policy applies, the
//! upstream content type must be an image, and responses are marked
//! cacheable for an hour.

use axum::body::Body;
use axum::extract::Query;
use axum::http::{header, StatusCode};
use axum::response::Response;
use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::core::config;
use crate::core::validation::is_url_allowed;
use crate::server::error::ApiError;

static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .timeout(config::timeouts::image_proxy())
        .build()
        .expect("reqwest client")
});

#[derive(Debug, Deserialize)]
pub struct ImageQuery {
    pub url: Option<String>,
}

/// GET /proxy/image?url=...
pub async fn proxy_image(Query(query): Query<ImageQuery>) -> Result<Response, ApiError> {
    let url = query
        .url
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("Missing url parameter".to_string()))?;

    if !is_url_allowed(url) {
        return Err(ApiError::BadRequest("Invalid URL".to_string()));
    }

    fetch_image(url).await
}

/// Fetches and relays one image. The caller has already applied the URL
/// policy.
async fn fetch_image(url: &str) -> Result<Response, ApiError> {
    let upstream = HTTP_CLIENT.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            ApiError::Internal(format!("image fetch timed out: {}", e))
        } else {
            ApiError::BadRequest(format!("Failed to fetch image: {}", e))
        }
    })?;

    if !upstream.status().is_success() {
        return Err(ApiError::BadRequest(format!(
            "Upstream returned {}",
            upstream.status()
        )));
    }

    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if !content_type.starts_with("image/") {
        return Err(ApiError::BadRequest("URL does not point to an image".to_string()));
    }

    let body = Body::from_stream(upstream.bytes_stream());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CACHE_CONTROL,
            format!("public, max-age={}", config::proxy::CACHE_MAX_AGE_SECS),
        )
        .body(body)
        .map_err(|e| ApiError::Internal(format!("failed to build proxy response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn call_handler(url: &str) -> Result<Response, ApiError> {
        proxy_image(Query(ImageQuery {
            url: Some(url.to_string()),
        }))
        .await
    }

    #[tokio::test]
    async fn test_proxy_missing_url() {
        let result = proxy_image(Query(ImageQuery { url: None })).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_proxy_rejects_blocked_urls() {
        // Blocked host patterns never produce an outbound request
        let result = call_handler("http://192.168.1.10/internal.png").await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));

        let result = call_handler("file:///etc/passwd").await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_proxy_relays_image() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/thumb.jpg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg")
                    .set_body_bytes(vec![0xFF, 0xD8, 0xFF]),
            )
            .mount(&server)
            .await;

        let response = fetch_image(&format!("{}/thumb.jpg", server.uri())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
        assert!(response.headers()[header::CACHE_CONTROL]
            .to_str()
            .unwrap()
            .contains("max-age=3600"));
    }

    #[tokio::test]
    async fn test_proxy_rejects_non_image_content() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page.html"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html></html>"),
            )
            .mount(&server)
            .await;

        let result = fetch_image(&format!("{}/page.html", server.uri())).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_proxy_rejects_upstream_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let result = fetch_image(&format!("{}/gone.png", server.uri())).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }
}
