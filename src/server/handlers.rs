//! Endpoint handlers binding the pipeline components to the HTTP surface
//!
//! Streaming handlers follow one shape: claim the job's active slot, look
//! up metadata for the response headers, create the progress session, spawn
//! the children, and hand the counting stream to the response body. Any
//! failure after the slot is claimed fails the job so the queue drains.

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::convert::{mime_for_ext, TargetFormat};
use crate::core::config;
use crate::core::validation::{is_url_allowed, sanitize_header_filename};
use crate::extract::{self, MediaInfo};
use crate::progress::{ProgressBus, ProgressEvent};
use crate::queue::JobKind;
use crate::server::error::ApiError;
use crate::server::rate_limit::{client_ip, WindowConfig};
use crate::server::AppState;

// ======================== Request / response shapes ========================

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct BatchAnalyzeRequest {
    pub urls: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct BatchItem {
    pub url: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<MediaInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BatchAnalyzeResponse {
    pub results: Vec<BatchItem>,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

#[derive(Debug, Deserialize)]
pub struct QueueDownloadRequest {
    pub url: String,
    pub format_id: String,
}

#[derive(Debug, Deserialize)]
pub struct QueueConvertRequest {
    pub url: Option<String>,
    pub target_format: String,
    pub depends_on: Option<String>,
    pub input_file: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    #[serde(rename = "jobId")]
    pub job_id: String,
    #[serde(rename = "canStart")]
    pub can_start: bool,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    #[serde(rename = "jobId")]
    pub job_id: Option<String>,
    pub url: Option<String>,
    pub format_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConvertRequest {
    pub url: Option<String>,
    pub target_format: Option<String>,
    #[serde(rename = "jobId")]
    pub job_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub success: bool,
    pub message: String,
}

// ======================== Health ========================

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// ======================== Analyze ========================

/// POST /analyze
pub async fn analyze(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Json<MediaInfo>, ApiError> {
    let ip = client_ip(&headers, &addr);
    state
        .limiter
        .check(WindowConfig::analyze(), &ip)
        .map_err(ApiError::RateLimited)?;

    if !is_url_allowed(&req.url) {
        return Err(ApiError::BadRequest("Invalid URL".to_string()));
    }

    let info = extract::analyze(&req.url).await?;
    Ok(Json(info))
}

/// POST /analyze/batch
///
/// Valid URLs run in parallel; invalid or failing entries are reported
/// per item and never fail the batch.
pub async fn analyze_batch(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<BatchAnalyzeRequest>,
) -> Result<Json<BatchAnalyzeResponse>, ApiError> {
    let ip = client_ip(&headers, &addr);
    state
        .limiter
        .check(WindowConfig::analyze(), &ip)
        .map_err(ApiError::RateLimited)?;

    if req.urls.is_empty() {
        return Err(ApiError::BadRequest("No URLs provided".to_string()));
    }
    if req.urls.len() > config::validation::MAX_BATCH_URLS {
        return Err(ApiError::BadRequest(format!(
            "Too many URLs (max {})",
            config::validation::MAX_BATCH_URLS
        )));
    }

    let tasks = req.urls.iter().map(|url| {
        let url = url.clone();
        async move {
            if !is_url_allowed(&url) {
                return BatchItem {
                    url,
                    success: false,
                    data: None,
                    error: Some("Invalid URL format".to_string()),
                };
            }
            match extract::analyze(&url).await {
                Ok(info) => BatchItem {
                    url,
                    success: true,
                    data: Some(info),
                    error: None,
                },
                Err(e) => BatchItem {
                    url,
                    success: false,
                    data: None,
                    error: Some(e.to_string()),
                },
            }
        }
    });

    let results: Vec<BatchItem> = futures::future::join_all(tasks).await;
    let successful = results.iter().filter(|r| r.success).count();
    let total = results.len();

    Ok(Json(BatchAnalyzeResponse {
        failed: total - successful,
        total,
        successful,
        results,
    }))
}

// ======================== Queue management ========================

/// POST /queue/download
pub async fn queue_download(
    State(state): State<AppState>,
    Json(req): Json<QueueDownloadRequest>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    if !is_url_allowed(&req.url) {
        return Err(ApiError::BadRequest("Invalid URL".to_string()));
    }
    if req.format_id.trim().is_empty() {
        return Err(ApiError::BadRequest("Missing format_id".to_string()));
    }

    let (job_id, can_start) = state.scheduler.add_download_job(&req.url, &req.format_id);
    Ok(Json(EnqueueResponse {
        job_id,
        can_start,
        message: if can_start {
            "Ready to start".to_string()
        } else {
            "Queued behind the active job".to_string()
        },
    }))
}

/// POST /queue/convert
pub async fn queue_convert(
    State(state): State<AppState>,
    Json(req): Json<QueueConvertRequest>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    if TargetFormat::parse(&req.target_format).is_none() {
        return Err(ApiError::BadRequest(format!(
            "Unknown target format: {}",
            req.target_format
        )));
    }
    if let Some(url) = &req.url {
        if !is_url_allowed(url) {
            return Err(ApiError::BadRequest("Invalid URL".to_string()));
        }
    }

    let (job_id, can_start) = state.scheduler.add_convert_job(
        req.url.as_deref(),
        &req.target_format,
        req.depends_on.as_deref(),
        req.input_file.as_deref(),
    )?;
    Ok(Json(EnqueueResponse {
        job_id,
        can_start,
        message: if can_start {
            "Ready to start".to_string()
        } else {
            "Queued".to_string()
        },
    }))
}

/// GET /queue
pub async fn get_queue(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ip = client_ip(&headers, &addr);
    state
        .limiter
        .check(WindowConfig::queue_status(), &ip)
        .map_err(ApiError::RateLimited)?;
    Ok(Json(state.scheduler.queue_state()).into_response())
}

/// GET /queue/:jobId
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    match state.scheduler.job(&job_id) {
        Some(job) => Ok(Json(job).into_response()),
        None => Err(ApiError::NotFound(format!("Job not found: {}", job_id))),
    }
}

/// POST /queue/:jobId/cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<AckResponse>, ApiError> {
    state.scheduler.cancel_job(&job_id)?;
    Ok(Json(AckResponse {
        success: true,
        message: format!("Job {} cancelled", job_id),
    }))
}

// ======================== Streaming download ========================

/// Filename and content type for the response headers, from a metadata
/// lookup with a defensive fallback: header assembly must never fail a
/// download that the extractor itself could serve.
async fn filename_for_download(url: &str, format_id: &str) -> (String, &'static str) {
    match extract::analyze(url).await {
        Ok(info) => {
            let ext = info
                .format(format_id)
                .map(|f| f.ext.clone())
                .unwrap_or_else(|| "mp4".to_string());
            let base = sanitize_header_filename(&info.title);
            (format!("{}.{}", base, ext), mime_for_ext(&ext))
        }
        Err(e) => {
            log::warn!("Metadata lookup failed for {}, using fallback filename: {}", url, e);
            ("download.mp4".to_string(), mime_for_ext("mp4"))
        }
    }
}

fn media_response_headers(
    builder: axum::http::response::Builder,
    content_type: &str,
    filename: &str,
    download_id: &str,
    job_id: &str,
) -> axum::http::response::Builder {
    builder
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        )
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::PRAGMA, "no-cache")
        .header(header::EXPIRES, "0")
        .header("X-Download-Id", download_id)
        .header("X-Job-Id", job_id)
}

fn accepted_response(job_id: &str) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "jobId": job_id,
            "message": "Job queued; retry when the active job completes",
        })),
    )
        .into_response()
}

/// GET /download?jobId=... (or legacy ?url=...&format_id=...)
pub async fn download(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let ip = client_ip(&headers, &addr);
    state
        .limiter
        .check(WindowConfig::download(), &ip)
        .map_err(ApiError::RateLimited)?;

    // Legacy direct path auto-admits a job and answers 202 when it cannot
    // start immediately.
    let (job_id, legacy) = match query.job_id {
        Some(id) => (id, false),
        None => {
            let url = query
                .url
                .as_deref()
                .ok_or_else(|| ApiError::BadRequest("Missing jobId or url".to_string()))?;
            let format_id = query
                .format_id
                .as_deref()
                .ok_or_else(|| ApiError::BadRequest("Missing format_id".to_string()))?;
            if !is_url_allowed(url) {
                return Err(ApiError::BadRequest("Invalid URL".to_string()));
            }
            let (id, can_start) = state.scheduler.add_download_job(url, format_id);
            if !can_start {
                return Ok(accepted_response(&id));
            }
            (id, true)
        }
    };

    let job = state
        .scheduler
        .job(&job_id)
        .ok_or_else(|| ApiError::NotFound(format!("Job not found: {}", job_id)))?;
    if job.kind != JobKind::Download {
        return Err(ApiError::BadRequest("Not a download job".to_string()));
    }
    if job.status.is_terminal() {
        return Err(ApiError::Conflict(format!("Job {} already finished", job_id)));
    }

    let url = job
        .url
        .clone()
        .ok_or_else(|| ApiError::Internal("download job without url".to_string()))?;
    let format_id = job
        .format_id
        .clone()
        .ok_or_else(|| ApiError::Internal("download job without format_id".to_string()))?;

    let download_id = uuid::Uuid::new_v4().to_string();
    if !state.scheduler.start_job(&job_id, &download_id) {
        return if legacy {
            Ok(accepted_response(&job_id))
        } else {
            Err(ApiError::Conflict(
                "Job is not startable: another job is active or a dependency is pending"
                    .to_string(),
            ))
        };
    }

    // The active slot is claimed; from here every failure must fail the job
    // so the queue keeps draining.
    let (filename, content_type) = filename_for_download(&url, &format_id).await;

    state
        .bus
        .create_session(&url, &format_id, Some(download_id.clone()));

    let stream =
        match extract::stream_download(&url, &format_id, &download_id, Arc::clone(&state.bus)).await
        {
            Ok(s) => s,
            Err(e) => {
                let message = e.to_string();
                state.bus.mark_error(&download_id, &message);
                state.scheduler.fail_job(&job_id, &message);
                return Err(e.into());
            }
        };

    media_response_headers(
        Response::builder().status(StatusCode::OK),
        content_type,
        &filename,
        &download_id,
        &job_id,
    )
    .body(Body::from_stream(stream))
    .map_err(|e| ApiError::Internal(format!("failed to build response: {}", e)))
}

// ======================== Streaming conversion ========================

/// POST /convert
pub async fn convert(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<ConvertRequest>,
) -> Result<Response, ApiError> {
    let ip = client_ip(&headers, &addr);
    state
        .limiter
        .check(WindowConfig::convert(), &ip)
        .map_err(ApiError::RateLimited)?;

    let (job_id, legacy) = match req.job_id {
        Some(id) => (id, false),
        None => {
            let target = req
                .target_format
                .as_deref()
                .ok_or_else(|| ApiError::BadRequest("Missing target_format".to_string()))?;
            if TargetFormat::parse(target).is_none() {
                return Err(ApiError::BadRequest(format!("Unknown target format: {}", target)));
            }
            let url = req
                .url
                .as_deref()
                .ok_or_else(|| ApiError::BadRequest("Missing url".to_string()))?;
            if !is_url_allowed(url) {
                return Err(ApiError::BadRequest("Invalid URL".to_string()));
            }
            let (id, can_start) =
                state
                    .scheduler
                    .add_convert_job(Some(url), target, None, None)?;
            if !can_start {
                return Ok(accepted_response(&id));
            }
            (id, true)
        }
    };

    let job = state
        .scheduler
        .job(&job_id)
        .ok_or_else(|| ApiError::NotFound(format!("Job not found: {}", job_id)))?;
    if job.kind != JobKind::Convert {
        return Err(ApiError::BadRequest("Not a convert job".to_string()));
    }
    if job.status.is_terminal() {
        return Err(ApiError::Conflict(format!("Job {} already finished", job_id)));
    }

    let target_str = job
        .target_format
        .clone()
        .ok_or_else(|| ApiError::Internal("convert job without target format".to_string()))?;
    let target = TargetFormat::parse(&target_str)
        .ok_or_else(|| ApiError::BadRequest(format!("Unknown target format: {}", target_str)))?;

    // Convert jobs admitted with only an input file are accepted into the
    // queue for forward compatibility, but the file-based pipeline does not
    // exist yet.
    let url = job.url.clone().ok_or_else(|| {
        ApiError::BadRequest("Convert jobs without a source URL are not supported".to_string())
    })?;

    let download_id = uuid::Uuid::new_v4().to_string();
    if !state.scheduler.start_job(&job_id, &download_id) {
        return if legacy {
            Ok(accepted_response(&job_id))
        } else {
            Err(ApiError::Conflict(
                "Job is not startable: another job is active or a dependency is pending"
                    .to_string(),
            ))
        };
    }

    let title = match extract::analyze(&url).await {
        Ok(info) => sanitize_header_filename(&info.title),
        Err(e) => {
            log::warn!("Metadata lookup failed for {}, using fallback filename: {}", url, e);
            "download".to_string()
        }
    };
    let filename = format!("{}.{}", title, target.extension());

    state
        .bus
        .create_session(&url, &target_str, Some(download_id.clone()));

    let stream = match extract::convert_media(&url, target, &download_id, Arc::clone(&state.bus))
        .await
    {
        Ok(s) => s,
        Err(e) => {
            let message = e.to_string();
            state.bus.mark_error(&download_id, &message);
            state.scheduler.fail_job(&job_id, &message);
            return Err(e.into());
        }
    };

    media_response_headers(
        Response::builder().status(StatusCode::OK),
        target.content_type(),
        &filename,
        &download_id,
        &job_id,
    )
    .body(Body::from_stream(stream))
    .map_err(|e| ApiError::Internal(format!("failed to build response: {}", e)))
}

// ======================== Progress push stream ========================

fn sse_frame(event: &ProgressEvent) -> String {
    // Serialization of these shapes cannot fail; fall back to a bare
    // heartbeat frame if it somehow does.
    let json = serde_json::to_string(event)
        .unwrap_or_else(|_| "{\"type\":\"heartbeat\"}".to_string());
    format!("data: {}\n\n", json)
}

/// Forwards bus events for one download id into the client channel.
/// Subscription happens as soon as the session exists, so clients may
/// connect before the download starts. Ends when the client goes away.
async fn progress_pump(
    bus: Arc<ProgressBus>,
    download_id: String,
    tx: tokio::sync::mpsc::Sender<String>,
) {
    let connected = ProgressEvent::Connected {
        download_id: download_id.clone(),
    };
    if tx.send(sse_frame(&connected)).await.is_err() {
        return;
    }

    let mut heartbeat = tokio::time::interval(config::progress::heartbeat());
    heartbeat.tick().await; // immediate first tick

    let mut subscription = match bus.subscribe(&download_id) {
        Some((snapshot, rx)) => {
            if tx.send(sse_frame(&ProgressEvent::from_session(&snapshot))).await.is_err() {
                return;
            }
            Some(rx)
        }
        None => None,
    };

    enum Step {
        Heartbeat,
        Event(ProgressEvent),
        Coalesce,
        Unsubscribed,
        TrySubscribe,
    }

    loop {
        let step = match subscription.as_mut() {
            Some(rx) => tokio::select! {
                _ = heartbeat.tick() => Step::Heartbeat,
                event = rx.recv() => match event {
                    Ok(e) => Step::Event(e),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => Step::Coalesce,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => Step::Unsubscribed,
                },
            },
            None => tokio::select! {
                _ = heartbeat.tick() => Step::Heartbeat,
                _ = tokio::time::sleep(std::time::Duration::from_millis(250)) => Step::TrySubscribe,
            },
        };

        match step {
            Step::Heartbeat => {
                if tx.send(sse_frame(&ProgressEvent::Heartbeat)).await.is_err() {
                    return;
                }
            }
            Step::Event(event) => {
                if tx.send(sse_frame(&event)).await.is_err() {
                    return;
                }
            }
            Step::Coalesce => {
                // Missed updates collapse into the latest snapshot
                if let Some(snapshot) = bus.snapshot(&download_id) {
                    if tx
                        .send(sse_frame(&ProgressEvent::from_session(&snapshot)))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            Step::Unsubscribed => {
                // Session removed; stay alive on heartbeats only
                subscription = None;
            }
            Step::TrySubscribe => {
                if let Some((snapshot, rx)) = bus.subscribe(&download_id) {
                    if tx
                        .send(sse_frame(&ProgressEvent::from_session(&snapshot)))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    subscription = Some(rx);
                }
            }
        }
    }
}

/// GET /progress/:downloadId
///
/// Exempt from rate limiting; buffering is disabled for intermediaries via
/// X-Accel-Buffering.
pub async fn progress_stream(
    State(state): State<AppState>,
    Path(download_id): Path<String>,
) -> Result<Response, ApiError> {
    if download_id.trim().is_empty() {
        return Err(ApiError::BadRequest("Missing download id".to_string()));
    }

    let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(32);
    tokio::spawn(progress_pump(
        Arc::clone(&state.bus),
        download_id,
        tx,
    ));

    let stream = futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
        .map(|frame| Ok::<Bytes, Infallible>(Bytes::from(frame)));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Internal(format!("failed to build response: {}", e)))
}

/// GET /progress/:downloadId/status
pub async fn progress_status(
    State(state): State<AppState>,
    Path(download_id): Path<String>,
) -> Result<Response, ApiError> {
    match state.bus.snapshot(&download_id) {
        Some(session) => Ok(Json(session).into_response()),
        None => Err(ApiError::NotFound(format!(
            "No session for download id: {}",
            download_id
        ))),
    }
}

/// POST /download/:downloadId/cancel
pub async fn cancel_download(
    State(state): State<AppState>,
    Path(download_id): Path<String>,
) -> Result<Json<AckResponse>, ApiError> {
    if !state.bus.cancel(&download_id, "Cancelled by user") {
        return Err(ApiError::NotFound(format!(
            "No session for download id: {}",
            download_id
        )));
    }
    if let Some(job) = state.scheduler.job_by_download_id(&download_id) {
        state.scheduler.fail_job(&job.job_id, "Cancelled by user");
    }
    Ok(Json(AckResponse {
        success: true,
        message: format!("Download {} cancelled", download_id),
    }))
}
