//! Progress bus: per-download session state and event fan-out
//!
//! A process-wide registry of download sessions keyed by download id. Each
//! session owns a broadcast channel; subscribers get their own buffered
//! receiver so a slow consumer can never stall the producer (a lagged
//! receiver re-syncs from the session snapshot). Terminal status is sticky:
//! the subprocess side has both exit and stream-close paths that may report
//! completion, and the second report must be harmless.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::core::config;

/// Lifecycle state of a download session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Downloading,
    Completed,
    Error,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Downloading)
    }
}

/// Immutable snapshot of one download session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSession {
    pub download_id: String,
    pub url: String,
    pub format_id: String,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub percentage: Option<u8>,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Typed event pushed to progress subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProgressEvent {
    Connected {
        #[serde(rename = "downloadId")]
        download_id: String,
    },
    Progress {
        #[serde(rename = "downloadId")]
        download_id: String,
        #[serde(rename = "bytesDownloaded")]
        bytes_downloaded: u64,
        #[serde(rename = "totalBytes")]
        total_bytes: Option<u64>,
        percentage: Option<u8>,
        status: SessionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Heartbeat,
}

impl ProgressEvent {
    /// Builds a progress event from a session snapshot.
    pub fn from_session(s: &DownloadSession) -> Self {
        ProgressEvent::Progress {
            download_id: s.download_id.clone(),
            bytes_downloaded: s.bytes_downloaded,
            total_bytes: s.total_bytes,
            percentage: s.percentage,
            status: s.status,
            error: s.error.clone(),
        }
    }

    /// The download id this event refers to, if any.
    pub fn download_id(&self) -> Option<&str> {
        match self {
            ProgressEvent::Connected { download_id } => Some(download_id),
            ProgressEvent::Progress { download_id, .. } => Some(download_id),
            ProgressEvent::Heartbeat => None,
        }
    }

    /// Session status carried by the event, if any.
    pub fn status(&self) -> Option<SessionStatus> {
        match self {
            ProgressEvent::Progress { status, .. } => Some(*status),
            _ => None,
        }
    }
}

struct SessionEntry {
    session: DownloadSession,
    sender: broadcast::Sender<ProgressEvent>,
    cancel: Option<CancellationToken>,
}

/// Process-wide progress registry and event fan-out.
pub struct ProgressBus {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    /// Bus-wide feed of progress events, consumed by the scheduler mirror.
    all_events: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    pub fn new() -> Self {
        let (all_events, _) = broadcast::channel(config::progress::EVENT_BUFFER * 4);
        Self {
            sessions: Mutex::new(HashMap::new()),
            all_events,
        }
    }

    /// Creates a session. Idempotent: an existing id is returned untouched.
    pub fn create_session(&self, url: &str, format_id: &str, id: Option<String>) -> String {
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut sessions = self.sessions.lock().unwrap();

        if sessions.contains_key(&id) {
            return id;
        }

        let (sender, _) = broadcast::channel(config::progress::EVENT_BUFFER);
        sessions.insert(
            id.clone(),
            SessionEntry {
                session: DownloadSession {
                    download_id: id.clone(),
                    url: url.to_string(),
                    format_id: format_id.to_string(),
                    bytes_downloaded: 0,
                    total_bytes: None,
                    percentage: None,
                    status: SessionStatus::Downloading,
                    error: None,
                    created_at: Utc::now(),
                },
                sender,
                cancel: None,
            },
        );
        log::debug!("Created progress session {}", id);
        id
    }

    /// Registers the cancellation token that terminates the session's
    /// subprocesses. Stored so `cancel()` can reach the children.
    pub fn register_cancel(&self, id: &str, token: CancellationToken) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(entry) = sessions.get_mut(id) {
            entry.cancel = Some(token);
        }
    }

    /// Reports downloaded bytes. Bytes are monotone non-decreasing for a
    /// given id; a known total recomputes the percentage. No-op once the
    /// session is terminal.
    pub fn update_progress(&self, id: &str, bytes: u64, total: Option<u64>) {
        let mut sessions = self.sessions.lock().unwrap();
        let Some(entry) = sessions.get_mut(id) else { return };
        if entry.session.status.is_terminal() {
            return;
        }

        let s = &mut entry.session;
        s.bytes_downloaded = s.bytes_downloaded.max(bytes);
        if total.is_some() {
            s.total_bytes = total;
        }
        if let Some(t) = s.total_bytes {
            if t > 0 {
                let pct = ((s.bytes_downloaded as f64 / t as f64) * 100.0).round() as u64;
                s.percentage = Some(pct.min(100) as u8);
            }
        }

        Self::publish(entry, &self.all_events);
    }

    /// Records the total size learned from the extractor's stderr.
    pub fn set_total(&self, id: &str, total: u64) {
        let mut sessions = self.sessions.lock().unwrap();
        let Some(entry) = sessions.get_mut(id) else { return };
        if entry.session.status.is_terminal() {
            return;
        }
        entry.session.total_bytes = Some(total);
        if total > 0 {
            let pct = ((entry.session.bytes_downloaded as f64 / total as f64) * 100.0).round() as u64;
            entry.session.percentage = Some(pct.min(100) as u8);
        }
        Self::publish(entry, &self.all_events);
    }

    /// Marks the session completed. Idempotent on terminal sessions.
    pub fn mark_completed(&self, id: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        let Some(entry) = sessions.get_mut(id) else { return };
        if entry.session.status.is_terminal() {
            return;
        }
        entry.session.status = SessionStatus::Completed;
        entry.session.percentage = Some(100);
        if let Some(t) = entry.session.total_bytes {
            entry.session.bytes_downloaded = entry.session.bytes_downloaded.max(t);
        }
        log::info!("Session {} completed ({} bytes)", id, entry.session.bytes_downloaded);
        Self::publish(entry, &self.all_events);
    }

    /// Marks the session failed. Idempotent on terminal sessions.
    pub fn mark_error(&self, id: &str, message: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        let Some(entry) = sessions.get_mut(id) else { return };
        if entry.session.status.is_terminal() {
            return;
        }
        entry.session.status = SessionStatus::Error;
        entry.session.error = Some(message.to_string());
        log::warn!("Session {} failed: {}", id, message);
        Self::publish(entry, &self.all_events);
    }

    /// Cancels the session: fires the registered cancellation token (which
    /// gracefully then forcefully terminates the children), marks the
    /// session cancelled, and schedules its removal after a short grace
    /// period. Returns false when the id is unknown.
    pub fn cancel(self: &Arc<Self>, id: &str, reason: &str) -> bool {
        let token = {
            let mut sessions = self.sessions.lock().unwrap();
            let Some(entry) = sessions.get_mut(id) else { return false };

            if entry.session.status.is_terminal() {
                return true;
            }
            entry.session.status = SessionStatus::Cancelled;
            entry.session.error = Some(reason.to_string());
            log::info!("Session {} cancelled: {}", id, reason);
            Self::publish(entry, &self.all_events);
            entry.cancel.take()
        };

        if let Some(token) = token {
            token.cancel();
        }

        self.schedule_removal(id);
        true
    }

    /// Latest snapshot for an id.
    pub fn snapshot(&self, id: &str) -> Option<DownloadSession> {
        self.sessions.lock().unwrap().get(id).map(|e| e.session.clone())
    }

    /// Subscribes to a session's events; also returns the current snapshot
    /// so late subscribers start from known state.
    pub fn subscribe(&self, id: &str) -> Option<(DownloadSession, broadcast::Receiver<ProgressEvent>)> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(id)
            .map(|e| (e.session.clone(), e.sender.subscribe()))
    }

    /// Subscribes to every progress event on the bus (scheduler mirror).
    pub fn subscribe_all(&self) -> broadcast::Receiver<ProgressEvent> {
        self.all_events.subscribe()
    }

    /// Removes a session outright.
    pub fn remove(&self, id: &str) {
        self.sessions.lock().unwrap().remove(id);
    }

    /// Number of live sessions (terminal ones included until GC).
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops terminal sessions older than the TTL. Active sessions are never
    /// collected. Returns the number removed.
    pub fn gc(&self) -> usize {
        let ttl = chrono::Duration::seconds(config::progress::SESSION_TTL_SECS);
        let now = Utc::now();
        let mut sessions = self.sessions.lock().unwrap();
        let before = sessions.len();
        sessions.retain(|_, e| {
            !(e.session.status.is_terminal() && now - e.session.created_at > ttl)
        });
        let removed = before - sessions.len();
        if removed > 0 {
            log::info!("Session GC removed {} terminal session(s)", removed);
        }
        removed
    }

    /// Spawns the periodic GC task.
    pub fn spawn_gc(self: &Arc<Self>) {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(config::progress::gc_interval());
            interval.tick().await;
            loop {
                interval.tick().await;
                bus.gc();
            }
        });
    }

    /// Keep the cancelled snapshot visible briefly so a subscriber that
    /// raced the cancel still observes the terminal event, then drop it.
    fn schedule_removal(self: &Arc<Self>, id: &str) {
        let bus = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(
                config::progress::CANCEL_REMOVAL_GRACE_SECS,
            ))
            .await;
            bus.remove(&id);
        });
    }

    fn publish(entry: &SessionEntry, all: &broadcast::Sender<ProgressEvent>) {
        let event = ProgressEvent::from_session(&entry.session);
        // Send errors just mean nobody is listening right now.
        let _ = entry.sender.send(event.clone());
        let _ = all.send(event);
    }
}
