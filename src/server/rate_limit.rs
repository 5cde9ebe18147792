//! Sliding-window rate limiting keyed by client IP
//!
//! One limiter instance serves every window: buckets are keyed by
//! (window name, client ip) and hold the timestamps of requests inside the
//! window. The global window runs as router middleware and skips the
//! progress push stream, queue polling, and health checks; the per-endpoint
//! windows are checked inside their handlers.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::core::config;
use crate::server::error::ApiError;
use crate::server::AppState;

/// One sliding window: at most `max` requests per `window` per client.
#[derive(Debug, Clone, Copy)]
pub struct WindowConfig {
    pub name: &'static str,
    pub max: usize,
    pub window: Duration,
}

impl WindowConfig {
    pub fn global() -> Self {
        Self {
            name: "global",
            max: *config::rate_limit::GLOBAL_MAX,
            window: config::rate_limit::GLOBAL_WINDOW,
        }
    }

    pub fn analyze() -> Self {
        Self {
            name: "analyze",
            max: *config::rate_limit::ANALYZE_MAX,
            window: config::rate_limit::ANALYZE_WINDOW,
        }
    }

    pub fn download() -> Self {
        Self {
            name: "download",
            max: *config::rate_limit::DOWNLOAD_MAX,
            window: config::rate_limit::DOWNLOAD_WINDOW,
        }
    }

    pub fn convert() -> Self {
        Self {
            name: "convert",
            max: *config::rate_limit::CONVERT_MAX,
            window: config::rate_limit::CONVERT_WINDOW,
        }
    }

    pub fn queue_status() -> Self {
        Self {
            name: "queue_status",
            max: *config::rate_limit::QUEUE_STATUS_MAX,
            window: config::rate_limit::QUEUE_STATUS_WINDOW,
        }
    }
}

/// Values surfaced through the RateLimit-* response headers.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitStatus {
    pub limit: u64,
    pub remaining: u64,
    pub reset_secs: u64,
}

/// Sliding-window limiter over (window, client ip) buckets.
pub struct RateLimiter {
    buckets: Mutex<HashMap<(&'static str, String), VecDeque<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Records a request against a window. `Ok` carries the header values
    /// for the successful request; `Err` means the caller must be refused.
    pub fn check(&self, window: WindowConfig, client_ip: &str) -> Result<RateLimitStatus, RateLimitStatus> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .entry((window.name, client_ip.to_string()))
            .or_default();

        while let Some(front) = bucket.front() {
            if now.duration_since(*front) >= window.window {
                bucket.pop_front();
            } else {
                break;
            }
        }

        if bucket.len() >= window.max {
            // An empty bucket can only hit this branch when max is 0
            let reset = bucket
                .front()
                .map(|oldest| window.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(window.window);
            log::warn!(
                "Rate limit hit: window={} ip={} ({} in {:?})",
                window.name,
                client_ip,
                bucket.len(),
                window.window
            );
            return Err(RateLimitStatus {
                limit: window.max as u64,
                remaining: 0,
                reset_secs: reset.as_secs().max(1),
            });
        }

        bucket.push_back(now);
        Ok(RateLimitStatus {
            limit: window.max as u64,
            remaining: (window.max - bucket.len()) as u64,
            reset_secs: window.window.as_secs(),
        })
    }

    /// Drops buckets whose entire history has expired.
    pub fn prune(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap();
        buckets.retain(|(name, _), bucket| {
            let window = match *name {
                "global" => WindowConfig::global().window,
                "analyze" => WindowConfig::analyze().window,
                "download" => WindowConfig::download().window,
                "convert" => WindowConfig::convert().window,
                _ => WindowConfig::queue_status().window,
            };
            bucket
                .back()
                .map(|last| now.duration_since(*last) < window)
                .unwrap_or(false)
        });
    }
}

/// Extracts the client IP: first X-Forwarded-For hop when present, else the
/// socket peer address.
pub fn client_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| addr.ip().to_string())
}

/// Paths exempt from the global window: the push stream must never be cut
/// off mid-download, queue polling is the UI's heartbeat, and health checks
/// belong to the orchestrator.
fn global_exempt(path: &str) -> bool {
    path.starts_with("/progress") || path.starts_with("/queue") || path == "/health"
}

/// Global rate-limit middleware.
pub async fn global_rate_limit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let path = request.uri().path();
    if !global_exempt(path) {
        let ip = client_ip(request.headers(), &addr);
        state
            .limiter
            .check(WindowConfig::global(), &ip)
            .map_err(ApiError::RateLimited)?;
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(max: usize, secs: u64) -> WindowConfig {
        WindowConfig {
            name: "test",
            max,
            window: Duration::from_secs(secs),
        }
    }

    #[tokio::test]
    async fn test_limiter_allows_up_to_max() {
        let limiter = RateLimiter::new();
        let w = window(3, 60);
        assert!(limiter.check(w, "1.2.3.4").is_ok());
        assert!(limiter.check(w, "1.2.3.4").is_ok());
        let last = limiter.check(w, "1.2.3.4").unwrap();
        assert_eq!(last.remaining, 0);
        let refused = limiter.check(w, "1.2.3.4").unwrap_err();
        assert_eq!(refused.remaining, 0);
        assert!(refused.reset_secs >= 1);
    }

    #[tokio::test]
    async fn test_limiter_keys_by_ip() {
        let limiter = RateLimiter::new();
        let w = window(1, 60);
        assert!(limiter.check(w, "1.1.1.1").is_ok());
        assert!(limiter.check(w, "2.2.2.2").is_ok());
        assert!(limiter.check(w, "1.1.1.1").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_limiter_window_slides() {
        let limiter = RateLimiter::new();
        let w = window(1, 10);
        assert!(limiter.check(w, "1.2.3.4").is_ok());
        assert!(limiter.check(w, "1.2.3.4").is_err());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(limiter.check(w, "1.2.3.4").is_ok());
    }

    #[tokio::test]
    async fn test_remaining_counts_down() {
        let limiter = RateLimiter::new();
        let w = window(5, 60);
        let s = limiter.check(w, "ip").unwrap();
        assert_eq!(s.limit, 5);
        assert_eq!(s.remaining, 4);
        let s = limiter.check(w, "ip").unwrap();
        assert_eq!(s.remaining, 3);
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "9.9.9.9, 10.0.0.1".parse().unwrap());
        let addr: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        assert_eq!(client_ip(&headers, &addr), "9.9.9.9");

        let empty = HeaderMap::new();
        assert_eq!(client_ip(&empty, &addr), "127.0.0.1");
    }

    #[test]
    fn test_global_exemptions() {
        assert!(global_exempt("/progress/abc"));
        assert!(global_exempt("/queue"));
        assert!(global_exempt("/queue/123"));
        assert!(global_exempt("/health"));
        assert!(!global_exempt("/analyze"));
        assert!(!global_exempt("/download"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_drops_dead_buckets() {
        let limiter = RateLimiter::new();
        let _ = limiter.check(WindowConfig::queue_status(), "1.2.3.4");
        tokio::time::advance(Duration::from_secs(120)).await;
        limiter.prune();
        assert!(limiter.buckets.lock().unwrap().is_empty());
    }
}
