//! Streaming extraction and the extractor -> transcoder pipeline
//!
//! `stream_download` spawns the extractor writing media bytes to stdout;
//! `convert_media` chains a second child, the transcoder, reading those
//! bytes on stdin. In both cases the returned `MediaStream` is handed to
//! the HTTP response body: it counts bytes into the progress bus as they
//! flow and, when dropped early (client disconnect), cancels the
//! supervision token so no child outlives its consumer.
//!
//! A supervisor task owns the children: it arms the stage timeout, applies
//! the graceful-then-hard termination sequence, and translates exit status
//! into terminal session state on the bus.

use bytes::Bytes;
use futures::Stream;
use once_cell::sync::Lazy;
use regex::Regex;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::convert::{ConversionError, TargetFormat};
use crate::core::config;
use crate::core::error::AppError;
use crate::core::process::terminate_gracefully;
use crate::core::validation::is_url_allowed;
use crate::extract::errors::{classify_stderr, ExtractionError};
use crate::progress::ProgressBus;

/// Extractor progress line, e.g.
/// `[download]  45.2% of 10.00MiB at 500.00KiB/s ETA 00:10`.
/// Only the total is recovered; per-chunk byte counts come from the
/// counting stream instead.
static PROGRESS_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\[download\]\s+[\d.]+%\s+of\s+~?\s*([\d.]+)\s*(KiB|MiB|GiB)").unwrap()
});

/// Parses the total byte count out of an extractor progress line.
pub fn parse_progress_total(line: &str) -> Option<u64> {
    let caps = PROGRESS_LINE.captures(line)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let multiplier = match caps.get(2)?.as_str().to_lowercase().as_str() {
        "kib" => 1024.0,
        "mib" => 1024.0 * 1024.0,
        "gib" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * multiplier) as u64)
}

/// Byte stream from a child's stdout that reports counts to the progress
/// bus in ≥64 KiB steps and cancels its supervision token when dropped
/// before exhaustion.
pub struct MediaStream {
    inner: ReaderStream<ChildStdout>,
    bus: Arc<ProgressBus>,
    download_id: String,
    counted: u64,
    last_reported: u64,
    token: CancellationToken,
    ended: bool,
}

impl MediaStream {
    fn new(
        stdout: ChildStdout,
        bus: Arc<ProgressBus>,
        download_id: String,
        token: CancellationToken,
    ) -> Self {
        Self {
            inner: ReaderStream::new(stdout),
            bus,
            download_id,
            counted: 0,
            last_reported: 0,
            token,
            ended: false,
        }
    }
}

impl Stream for MediaStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.counted += chunk.len() as u64;
                if this.counted - this.last_reported >= config::progress::REPORT_STEP_BYTES {
                    this.bus.update_progress(&this.download_id, this.counted, None);
                    this.last_reported = this.counted;
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.ended = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if !this.ended {
                    this.ended = true;
                    // Flush the remainder below the reporting step
                    this.bus.update_progress(&this.download_id, this.counted, None);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MediaStream {
    fn drop(&mut self) {
        // Dropping an unfinished stream means the consumer went away; the
        // supervisor reacts to the token by terminating the children.
        if !self.ended {
            self.token.cancel();
        }
    }
}

fn spawn_extractor(args: &[&str]) -> Result<Child, ExtractionError> {
    let bin = &*config::EXTRACTOR_BIN;
    Command::new(bin)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExtractionError::ExtractorNotFound
            } else {
                ExtractionError::Failed(format!("failed to spawn extractor: {}", e))
            }
        })
}

fn spawn_transcoder(target: TargetFormat) -> Result<Child, ConversionError> {
    let bin = &*config::TRANSCODER_BIN;
    let mut cmd = Command::new(bin);
    cmd.args(["-hide_banner", "-loglevel", "error", "-i", "pipe:0"]);
    cmd.args(target.transcoder_args());
    cmd.arg("pipe:1");
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConversionError::TranscoderNotFound
            } else {
                ConversionError::ProcessError(e.to_string())
            }
        })
}

/// Reads extractor stderr line by line: progress lines feed the total into
/// the bus, warnings are demoted to debug, everything else is logged.
/// The last lines are retained for error classification.
fn spawn_stderr_reader(
    child: &mut Child,
    bus: Arc<ProgressBus>,
    download_id: String,
) -> Arc<Mutex<Vec<String>>> {
    let lines_buf: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let Some(stderr) = child.stderr.take() else {
        return lines_buf;
    };

    let buf = Arc::clone(&lines_buf);
    tokio::spawn(async move {
        let reader = BufReader::new(stderr);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(total) = parse_progress_total(&line) {
                bus.set_total(&download_id, total);
            } else if line.contains("WARNING") {
                log::debug!("extractor: {}", line);
            } else if !line.trim().is_empty() {
                log::info!("extractor: {}", line);
            }
            let mut guard = buf.lock().unwrap();
            guard.push(line);
            if guard.len() > 50 {
                guard.remove(0);
            }
        }
    });

    lines_buf
}

/// Collects transcoder stderr for error reporting; every line is logged at
/// warn since the transcoder runs with `-loglevel error`.
fn spawn_transcoder_stderr_reader(child: &mut Child) -> Arc<Mutex<Vec<String>>> {
    let lines_buf: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let Some(stderr) = child.stderr.take() else {
        return lines_buf;
    };

    let buf = Arc::clone(&lines_buf);
    tokio::spawn(async move {
        let reader = BufReader::new(stderr);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log::warn!("transcoder: {}", line);
            let mut guard = buf.lock().unwrap();
            guard.push(line);
            if guard.len() > 50 {
                guard.remove(0);
            }
        }
    });

    lines_buf
}

fn collected(buf: &Arc<Mutex<Vec<String>>>) -> String {
    buf.lock().unwrap().join("\n")
}

fn session_is_terminal(bus: &ProgressBus, id: &str) -> bool {
    bus.snapshot(id).map(|s| s.status.is_terminal()).unwrap_or(true)
}

/// Spawn the extractor streaming the selected format to stdout.
///
/// The session must already exist on the bus; its cancellation token is
/// registered here. The returned stream is the HTTP response body.
pub async fn stream_download(
    url: &str,
    format_id: &str,
    download_id: &str,
    bus: Arc<ProgressBus>,
) -> Result<MediaStream, AppError> {
    if !is_url_allowed(url) {
        return Err(ExtractionError::Unsupported("URL rejected by policy".to_string()).into());
    }

    let mut child = spawn_extractor(&[
        "-f",
        format_id,
        "--no-playlist",
        "--no-warnings",
        "--no-call-home",
        "--prefer-free-formats",
        "-o",
        "-",
        url,
    ])?;

    let stdout = child.stdout.take().ok_or_else(|| {
        AppError::Internal("failed to capture extractor stdout".to_string())
    })?;

    let stderr_buf = spawn_stderr_reader(&mut child, Arc::clone(&bus), download_id.to_string());

    let token = CancellationToken::new();
    bus.register_cancel(download_id, token.clone());

    supervise_single(
        child,
        stderr_buf,
        Arc::clone(&bus),
        download_id.to_string(),
        token.clone(),
        config::timeouts::download(),
    );

    log::info!("Streaming download {} (format {}) from {}", download_id, format_id, url);
    Ok(MediaStream::new(stdout, bus, download_id.to_string(), token))
}

/// Spawn the extractor piped into the transcoder for on-the-fly conversion.
///
/// The extractor fetches `-f best`; its stdout is pumped into the
/// transcoder's stdin, which is closed on extractor EOF so the transcoder
/// can finish the stream. The returned stream reads the transcoder's
/// stdout.
pub async fn convert_media(
    url: &str,
    target: TargetFormat,
    download_id: &str,
    bus: Arc<ProgressBus>,
) -> Result<MediaStream, AppError> {
    if !is_url_allowed(url) {
        return Err(ExtractionError::Unsupported("URL rejected by policy".to_string()).into());
    }

    let mut extractor = spawn_extractor(&[
        "-f",
        "best",
        "--no-playlist",
        "--no-warnings",
        "--no-call-home",
        "-o",
        "-",
        url,
    ])?;

    let mut extractor_stdout = extractor.stdout.take().ok_or_else(|| {
        AppError::Internal("failed to capture extractor stdout".to_string())
    })?;

    let extractor_stderr = spawn_stderr_reader(&mut extractor, Arc::clone(&bus), download_id.to_string());

    let mut transcoder = match spawn_transcoder(target) {
        Ok(t) => t,
        Err(e) => {
            // The extractor is already running; do not leave it behind.
            terminate_gracefully(&mut extractor, "extractor").await;
            return Err(e.into());
        }
    };

    let mut transcoder_stdin = transcoder.stdin.take().ok_or_else(|| {
        AppError::Internal("failed to capture transcoder stdin".to_string())
    })?;
    let transcoder_stdout = transcoder.stdout.take().ok_or_else(|| {
        AppError::Internal("failed to capture transcoder stdout".to_string())
    })?;

    let transcoder_stderr = spawn_transcoder_stderr_reader(&mut transcoder);

    // Pump extractor -> transcoder. Dropping stdin at the end signals EOF;
    // without it the transcoder hangs waiting for more input.
    tokio::spawn(async move {
        if let Err(e) = tokio::io::copy(&mut extractor_stdout, &mut transcoder_stdin).await {
            log::debug!("extractor->transcoder pump ended: {}", e);
        }
        if let Err(e) = transcoder_stdin.shutdown().await {
            log::debug!("transcoder stdin shutdown: {}", e);
        }
        drop(transcoder_stdin);
    });

    let token = CancellationToken::new();
    bus.register_cancel(download_id, token.clone());

    supervise_pipeline(
        extractor,
        transcoder,
        extractor_stderr,
        transcoder_stderr,
        Arc::clone(&bus),
        download_id.to_string(),
        token.clone(),
        config::timeouts::conversion(),
    );

    log::info!(
        "Converting {} to {} for session {}",
        url,
        target.extension(),
        download_id
    );
    Ok(MediaStream::new(transcoder_stdout, bus, download_id.to_string(), token))
}

/// Supervises the single-child download: timeout, cancellation, exit
/// translation. Cleanup is idempotent; every path reaps the child and the
/// timeout is disarmed by the task ending.
fn supervise_single(
    mut child: Child,
    stderr_buf: Arc<Mutex<Vec<String>>>,
    bus: Arc<ProgressBus>,
    download_id: String,
    token: CancellationToken,
    timeout: Duration,
) {
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => match status {
                Ok(st) if st.success() => bus.mark_completed(&download_id),
                Ok(st) => {
                    let err = classify_stderr(&collected(&stderr_buf));
                    log::warn!("Extractor exited with {} for session {}", st, download_id);
                    bus.mark_error(&download_id, &err.to_string());
                }
                Err(e) => bus.mark_error(&download_id, &format!("extractor wait failed: {}", e)),
            },
            _ = token.cancelled() => {
                terminate_gracefully(&mut child, "extractor").await;
                if !session_is_terminal(&bus, &download_id) {
                    bus.cancel(&download_id, "Client disconnected");
                }
            }
            _ = tokio::time::sleep(timeout) => {
                log::warn!("Download {} timed out after {}s", download_id, timeout.as_secs());
                terminate_gracefully(&mut child, "extractor").await;
                bus.mark_error(&download_id, &format!("Download timed out after {}s", timeout.as_secs()));
            }
        }
    });
}

/// Supervises the two-child convert pipeline. The transcoder is the output
/// producer, so its exit drives the session state; extractor failures take
/// precedence in the reported error. Exit code 255 from the transcoder is
/// success for this invocation.
#[allow(clippy::too_many_arguments)]
fn supervise_pipeline(
    mut extractor: Child,
    mut transcoder: Child,
    extractor_stderr: Arc<Mutex<Vec<String>>>,
    transcoder_stderr: Arc<Mutex<Vec<String>>>,
    bus: Arc<ProgressBus>,
    download_id: String,
    token: CancellationToken,
    timeout: Duration,
) {
    tokio::spawn(async move {
        tokio::select! {
            status = transcoder.wait() => {
                // The extractor should be done once the transcoder saw EOF;
                // give it a moment, then make sure it is gone.
                let extractor_status = tokio::time::timeout(
                    Duration::from_secs(2),
                    extractor.wait(),
                )
                .await;
                if extractor_status.is_err() {
                    terminate_gracefully(&mut extractor, "extractor").await;
                }

                let extractor_failed = matches!(&extractor_status, Ok(Ok(st)) if !st.success());
                match status {
                    Ok(st) if transcoder_ok(&st) && !extractor_failed => {
                        bus.mark_completed(&download_id)
                    }
                    Ok(st) => {
                        let msg = if extractor_failed {
                            classify_stderr(&collected(&extractor_stderr)).to_string()
                        } else {
                            let detail = collected(&transcoder_stderr);
                            let detail = detail.lines().last().unwrap_or("transcoder failed");
                            format!("Conversion failed ({}): {}", st, detail)
                        };
                        bus.mark_error(&download_id, &msg);
                    }
                    Err(e) => bus.mark_error(&download_id, &format!("transcoder wait failed: {}", e)),
                }
            }
            _ = token.cancelled() => {
                terminate_gracefully(&mut extractor, "extractor").await;
                terminate_gracefully(&mut transcoder, "transcoder").await;
                if !session_is_terminal(&bus, &download_id) {
                    bus.cancel(&download_id, "Client disconnected");
                }
            }
            _ = tokio::time::sleep(timeout) => {
                log::warn!("Conversion {} timed out after {}s", download_id, timeout.as_secs());
                terminate_gracefully(&mut extractor, "extractor").await;
                terminate_gracefully(&mut transcoder, "transcoder").await;
                bus.mark_error(&download_id, &format!("Conversion timed out after {}s", timeout.as_secs()));
            }
        }
    });
}

/// ffmpeg-style pipelines habitually exit 255 when their input pipe closes
/// first even though the output is complete.
fn transcoder_ok(status: &std::process::ExitStatus) -> bool {
    if status.success() {
        return true;
    }
    status.code() == Some(255)
}
