//! HTTP edge: shared state, router assembly, CORS, and the serve loop

pub mod error;
pub mod handlers;
pub mod proxy;
pub mod rate_limit;

use axum::extract::Request;
use axum::http::{header, HeaderName, HeaderValue};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer, ExposeHeaders};

use crate::core::config;
use crate::progress::ProgressBus;
use crate::queue::JobScheduler;
use crate::server::error::ApiError;
use crate::server::rate_limit::RateLimiter;

/// Shared state for all endpoints.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<JobScheduler>,
    pub bus: Arc<ProgressBus>,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Wires the pipeline together. Background tasks (GC, the progress
    /// mirror) are spawned separately via `spawn_background_tasks` so tests
    /// can construct state without a running scheduler loop.
    pub fn new() -> Self {
        let bus = Arc::new(ProgressBus::new());
        let scheduler = Arc::new(JobScheduler::new(Arc::clone(&bus)));
        Self {
            scheduler,
            bus,
            limiter: Arc::new(RateLimiter::new()),
        }
    }

    /// Starts the progress mirror, the session/job GC loops, and the
    /// limiter pruning task.
    pub fn spawn_background_tasks(&self) {
        self.scheduler.spawn_progress_mirror();
        self.scheduler.spawn_gc();
        self.bus.spawn_gc();

        let limiter = Arc::clone(&self.limiter);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(config::rate_limit::GLOBAL_WINDOW);
            interval.tick().await;
            loop {
                interval.tick().await;
                limiter.prune();
            }
        });
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// CORS policy: production admits only the configured origins; development
/// stays permissive so local dev servers work against the API.
fn cors_layer() -> CorsLayer {
    let exposed = [
        HeaderName::from_static("x-download-id"),
        HeaderName::from_static("x-job-id"),
        HeaderName::from_static("ratelimit-limit"),
        HeaderName::from_static("ratelimit-remaining"),
        HeaderName::from_static("ratelimit-reset"),
    ];

    if config::is_production() {
        let origins: Vec<HeaderValue> = config::ALLOWED_ORIGINS
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
            .expose_headers(ExposeHeaders::list(exposed))
    } else {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
            .expose_headers(ExposeHeaders::list(exposed))
    }
}

/// In production every browser-facing request must carry an admitted
/// Origin; health checks are exempt for orchestrators.
async fn origin_guard(request: Request, next: Next) -> Result<Response, ApiError> {
    if config::is_production() && request.uri().path() != "/health" {
        let origin = request
            .headers()
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok());
        let admitted = origin
            .map(|o| config::ALLOWED_ORIGINS.iter().any(|a| a == o))
            .unwrap_or(false);
        if !admitted {
            return Err(ApiError::Forbidden("Origin not allowed".to_string()));
        }
    }
    Ok(next.run(request).await)
}

/// Assembles the application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/analyze", post(handlers::analyze))
        .route("/analyze/batch", post(handlers::analyze_batch))
        .route("/queue/download", post(handlers::queue_download))
        .route("/queue/convert", post(handlers::queue_convert))
        .route("/queue", get(handlers::get_queue))
        .route("/queue/:job_id", get(handlers::get_job))
        .route("/queue/:job_id/cancel", post(handlers::cancel_job))
        .route("/download", get(handlers::download))
        .route("/download/:download_id/cancel", post(handlers::cancel_download))
        .route("/convert", post(handlers::convert))
        .route("/progress/:download_id", get(handlers::progress_stream))
        .route("/progress/:download_id/status", get(handlers::progress_status))
        .route("/proxy/image", get(proxy::proxy_image))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::global_rate_limit,
        ))
        .layer(middleware::from_fn(origin_guard))
        .layer(cors_layer())
        .with_state(state)
}

/// Binds the listener and serves until shutdown.
pub async fn serve(port: u16, state: AppState) -> anyhow::Result<()> {
    let app = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?;

    log::info!("Listening on http://{}", addr);
    log::info!("  POST /analyze           - URL metadata");
    log::info!("  POST /analyze/batch     - batch metadata");
    log::info!("  POST /queue/download    - admit a download job");
    log::info!("  POST /queue/convert     - admit a convert job");
    log::info!("  GET  /download          - stream media bytes");
    log::info!("  POST /convert           - stream transcoded bytes");
    log::info!("  GET  /progress/:id      - push progress stream");
    log::info!("  GET  /proxy/image       - thumbnail proxy");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("Shutdown signal received, draining connections");
    })
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_state_construction() {
        let state = AppState::new();
        assert!(state.scheduler.queue_state().jobs.is_empty());
        assert!(state.bus.is_empty());
    }
}
