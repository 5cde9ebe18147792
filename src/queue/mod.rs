//! Job queue / scheduler
//!
//! Owns every job and enforces the pipeline's central invariants:
//!
//! - at most one job is in `downloading`/`converting` at any instant
//! - a job leaves `queued` only from the queue head, with its dependency
//!   (if any) completed
//! - after every terminal transition the active slot is cleared and the
//!   drain routine runs, so the queue keeps moving even under failures
//!
//! All mutations happen under one mutex which is never held across an
//! await. Queue-state snapshots are published through a watch channel after
//! every mutation; late subscribers see the latest state immediately.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;

use crate::core::config;
use crate::progress::{ProgressBus, ProgressEvent, SessionStatus};

/// What a job does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Download,
    Convert,
}

/// Job lifecycle. Transitions run only along
/// `queued -> {downloading|converting} -> {completed|failed}` or straight
/// `queued -> failed` (cancellation, dependency failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Downloading,
    Converting,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Downloading | JobStatus::Converting)
    }
}

/// Byte progress mirrored from the job's download session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub percentage: Option<u8>,
}

/// Scheduler-owned unit of admitted work.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    pub kind: JobKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_file: Option<String>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<JobProgress>,
}

/// Per-status job counts for the queue snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusCounts {
    pub queued: usize,
    pub downloading: usize,
    pub converting: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Snapshot of the whole scheduler, emitted after every mutation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueState {
    pub jobs: Vec<Job>,
    pub queue: Vec<String>,
    pub processing: Option<String>,
    pub counts: StatusCounts,
}

impl QueueState {
    fn empty() -> Self {
        Self {
            jobs: Vec::new(),
            queue: Vec::new(),
            processing: None,
            counts: StatusCounts::default(),
        }
    }
}

/// Admission-time errors.
#[derive(Error, Debug, PartialEq)]
pub enum QueueError {
    #[error("Unknown dependency job: {0}")]
    UnknownDependency(String),

    #[error("Dependency must be a download job: {0}")]
    InvalidDependency(String),

    #[error("Convert job requires a url or an input file")]
    MissingSource,

    #[error("Job not found: {0}")]
    JobNotFound(String),
}

struct SchedulerInner {
    jobs: HashMap<String, Job>,
    queue: VecDeque<String>,
    active_job: Option<String>,
}

impl SchedulerInner {
    fn deps_satisfied(&self, job_id: &str) -> bool {
        let Some(job) = self.jobs.get(job_id) else { return false };
        match &job.depends_on {
            None => true,
            Some(dep) => self
                .jobs
                .get(dep)
                .map(|d| d.status == JobStatus::Completed)
                .unwrap_or(false),
        }
    }

    fn snapshot(&self) -> QueueState {
        let mut counts = StatusCounts::default();
        for job in self.jobs.values() {
            match job.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Downloading => counts.downloading += 1,
                JobStatus::Converting => counts.converting += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        QueueState {
            jobs: self.jobs.values().cloned().collect(),
            queue: self.queue.iter().cloned().collect(),
            processing: self.active_job.clone(),
            counts,
        }
    }

    /// The drain routine. Runs under the lock, never across an await.
    ///
    /// Pops stale ids off the head; a head with an unmet dependency is left
    /// in place (FIFO, no skipping) and will be re-examined when the
    /// dependency completes. The actual start happens when the HTTP edge
    /// picks the head up via `start_job`.
    fn process_queue(&mut self) {
        if self.active_job.is_some() {
            return;
        }
        while let Some(head) = self.queue.front().cloned() {
            match self.jobs.get(&head) {
                None => {
                    // Stale id, drop and retry
                    self.queue.pop_front();
                }
                Some(job) if job.status != JobStatus::Queued => {
                    self.queue.pop_front();
                }
                Some(job) => {
                    if job.depends_on.is_some() && !self.deps_satisfied(&head) {
                        log::debug!("Queue head {} waits on its dependency", head);
                    }
                    break;
                }
            }
        }
    }
}

/// The scheduler. One per process, shared behind an `Arc`.
pub struct JobScheduler {
    inner: Mutex<SchedulerInner>,
    state_tx: watch::Sender<QueueState>,
    bus: Arc<ProgressBus>,
}

impl JobScheduler {
    pub fn new(bus: Arc<ProgressBus>) -> Self {
        let (state_tx, _) = watch::channel(QueueState::empty());
        Self {
            inner: Mutex::new(SchedulerInner {
                jobs: HashMap::new(),
                queue: VecDeque::new(),
                active_job: None,
            }),
            state_tx,
            bus,
        }
    }

    fn emit(&self, inner: &SchedulerInner) {
        self.state_tx.send_replace(inner.snapshot());
    }

    /// Admits a download job. Returns the id and whether the caller may
    /// start it right away.
    pub fn add_download_job(&self, url: &str, format_id: &str) -> (String, bool) {
        let job_id = uuid::Uuid::new_v4().to_string();
        let mut inner = self.inner.lock().unwrap();

        inner.jobs.insert(
            job_id.clone(),
            Job {
                job_id: job_id.clone(),
                kind: JobKind::Download,
                url: Some(url.to_string()),
                format_id: Some(format_id.to_string()),
                target_format: None,
                depends_on: None,
                input_file: None,
                status: JobStatus::Queued,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                error: None,
                download_id: None,
                progress: None,
            },
        );
        inner.queue.push_back(job_id.clone());
        inner.process_queue();

        let can_start =
            inner.active_job.is_none() && inner.queue.front() == Some(&job_id);
        log::info!("Job {} added (download, canStart={})", job_id, can_start);
        self.emit(&inner);
        (job_id, can_start)
    }

    /// Admits a convert job, optionally depending on a download job.
    pub fn add_convert_job(
        &self,
        url: Option<&str>,
        target_format: &str,
        depends_on: Option<&str>,
        input_file: Option<&str>,
    ) -> Result<(String, bool), QueueError> {
        if url.is_none() && input_file.is_none() {
            return Err(QueueError::MissingSource);
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        let mut inner = self.inner.lock().unwrap();

        if let Some(dep) = depends_on {
            match inner.jobs.get(dep) {
                None => return Err(QueueError::UnknownDependency(dep.to_string())),
                Some(job) if job.kind != JobKind::Download => {
                    return Err(QueueError::InvalidDependency(dep.to_string()))
                }
                Some(_) => {}
            }
        }

        inner.jobs.insert(
            job_id.clone(),
            Job {
                job_id: job_id.clone(),
                kind: JobKind::Convert,
                url: url.map(str::to_string),
                format_id: None,
                target_format: Some(target_format.to_string()),
                depends_on: depends_on.map(str::to_string),
                input_file: input_file.map(str::to_string),
                status: JobStatus::Queued,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                error: None,
                download_id: None,
                progress: None,
            },
        );
        inner.queue.push_back(job_id.clone());
        inner.process_queue();

        let can_start = inner.active_job.is_none()
            && inner.queue.front() == Some(&job_id)
            && inner.deps_satisfied(&job_id);
        log::info!("Job {} added (convert, canStart={})", job_id, can_start);
        self.emit(&inner);
        Ok((job_id, can_start))
    }

    /// Atomically claims the active slot for a job. Succeeds only when no
    /// job is active, the job is at the queue head, and its dependency (if
    /// any) has completed. On refusal nothing changes.
    pub fn start_job(&self, job_id: &str, download_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if inner.active_job.is_some() {
            return false;
        }
        if inner.queue.front().map(String::as_str) != Some(job_id) {
            return false;
        }
        if !inner.deps_satisfied(job_id) {
            return false;
        }

        inner.queue.pop_front();
        inner.active_job = Some(job_id.to_string());
        let Some(job) = inner.jobs.get_mut(job_id) else {
            // Stale id that slipped past the head check; undo the claim.
            inner.active_job = None;
            return false;
        };
        job.status = match job.kind {
            JobKind::Download => JobStatus::Downloading,
            JobKind::Convert => JobStatus::Converting,
        };
        job.started_at = Some(Utc::now());
        job.download_id = Some(download_id.to_string());

        log::info!("Job {} started (session {})", job_id, download_id);
        self.emit(&inner);
        true
    }

    /// Transitions a job to `completed`. Clears the active slot and drains
    /// regardless of the job's prior state; repeated terminal transitions
    /// are ignored.
    pub fn complete_job(&self, job_id: &str) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(job) = inner.jobs.get_mut(job_id) {
            if job.status.is_terminal() {
                return;
            }
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
            log::info!("Job {} completed", job_id);
        }

        if inner.active_job.as_deref() == Some(job_id) {
            inner.active_job = None;
        }
        inner.process_queue();
        self.emit(&inner);
    }

    /// Transitions a job to `failed` and cascade-fails queued dependents.
    /// Clears the active slot and drains on every path.
    pub fn fail_job(&self, job_id: &str, error: &str) {
        let mut inner = self.inner.lock().unwrap();

        let mut newly_failed = false;
        if let Some(job) = inner.jobs.get_mut(job_id) {
            if !job.status.is_terminal() {
                job.status = JobStatus::Failed;
                job.error = Some(error.to_string());
                job.completed_at = Some(Utc::now());
                newly_failed = true;
                log::warn!("Job {} failed: {}", job_id, error);
            }
        }

        if newly_failed {
            inner.queue.retain(|id| id != job_id);

            // Dependents can only be convert jobs still queued; fail them in
            // place rather than letting them wait forever.
            let dependents: Vec<String> = inner
                .jobs
                .values()
                .filter(|j| {
                    j.depends_on.as_deref() == Some(job_id) && j.status == JobStatus::Queued
                })
                .map(|j| j.job_id.clone())
                .collect();
            for dep_id in dependents {
                inner.queue.retain(|id| id != &dep_id);
                if let Some(job) = inner.jobs.get_mut(&dep_id) {
                    job.status = JobStatus::Failed;
                    job.error = Some(format!("Dependency failed: {}", error));
                    job.completed_at = Some(Utc::now());
                    log::warn!("Job {} failed: dependency {} failed", dep_id, job_id);
                }
            }
        }

        if inner.active_job.as_deref() == Some(job_id) {
            inner.active_job = None;
        }
        inner.process_queue();
        self.emit(&inner);
    }

    /// Cancels a job. A queued job fails immediately; an active job has its
    /// download session cancelled, which terminates the children, and is
    /// then failed. Either way the job ends `failed` with
    /// "Cancelled by user" and the drain runs.
    pub fn cancel_job(&self, job_id: &str) -> Result<(), QueueError> {
        let download_id = {
            let inner = self.inner.lock().unwrap();
            let Some(job) = inner.jobs.get(job_id) else {
                return Err(QueueError::JobNotFound(job_id.to_string()));
            };
            if job.status.is_terminal() {
                return Ok(());
            }
            job.download_id.clone()
        };

        if let Some(did) = download_id {
            self.bus.cancel(&did, "Cancelled by user");
        }
        self.fail_job(job_id, "Cancelled by user");
        Ok(())
    }

    /// Current snapshot.
    pub fn queue_state(&self) -> QueueState {
        self.state_tx.borrow().clone()
    }

    /// Watch-channel subscription; the receiver immediately holds the
    /// latest snapshot.
    pub fn subscribe_state(&self) -> watch::Receiver<QueueState> {
        self.state_tx.subscribe()
    }

    /// Looks up one job.
    pub fn job(&self, job_id: &str) -> Option<Job> {
        self.inner.lock().unwrap().jobs.get(job_id).cloned()
    }

    /// Finds the job bound to a download session.
    pub fn job_by_download_id(&self, download_id: &str) -> Option<Job> {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .values()
            .find(|j| j.download_id.as_deref() == Some(download_id))
            .cloned()
    }

    /// Removes terminal jobs older than the TTL. Jobs that a live job still
    /// depends on are kept so the dependency check stays answerable.
    pub fn gc(&self) -> usize {
        let ttl = chrono::Duration::seconds(config::queue::JOB_TTL_SECS);
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();

        let referenced: Vec<String> = inner
            .jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .filter_map(|j| j.depends_on.clone())
            .collect();

        let before = inner.jobs.len();
        inner.jobs.retain(|id, job| {
            !(job.status.is_terminal()
                && now - job.created_at > ttl
                && !referenced.contains(id))
        });
        let removed = before - inner.jobs.len();
        if removed > 0 {
            log::info!("Job GC removed {} terminal job(s)", removed);
            self.emit(&inner);
        }
        removed
    }

    /// Spawns the periodic GC task.
    pub fn spawn_gc(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(config::queue::gc_interval());
            interval.tick().await;
            loop {
                interval.tick().await;
                scheduler.gc();
            }
        });
    }

    /// Applies one bus event to the matching job: progress is mirrored,
    /// terminal session states drive terminal job transitions.
    pub fn apply_progress_event(&self, event: &ProgressEvent) {
        let Some(download_id) = event.download_id() else { return };
        let Some(status) = event.status() else { return };

        let (job_id, error) = {
            let mut inner = self.inner.lock().unwrap();
            let Some(job) = inner
                .jobs
                .values_mut()
                .find(|j| j.download_id.as_deref() == Some(download_id))
            else {
                return;
            };

            if let ProgressEvent::Progress {
                bytes_downloaded,
                total_bytes,
                percentage,
                error,
                ..
            } = event
            {
                job.progress = Some(JobProgress {
                    bytes_downloaded: *bytes_downloaded,
                    total_bytes: *total_bytes,
                    percentage: *percentage,
                });
                (job.job_id.clone(), error.clone())
            } else {
                return;
            }
        };

        match status {
            SessionStatus::Downloading => {
                // Plain progress; snapshot consumers read it via /queue
            }
            SessionStatus::Completed => self.complete_job(&job_id),
            SessionStatus::Error => {
                self.fail_job(&job_id, error.as_deref().unwrap_or("Download failed"))
            }
            SessionStatus::Cancelled => {
                self.fail_job(&job_id, error.as_deref().unwrap_or("Cancelled"))
            }
        }
    }

    /// Re-checks every non-terminal job with a session against the bus.
    /// Used after the mirror lags to avoid missing a terminal event.
    fn reconcile_active(&self) {
        let candidates: Vec<(String, String)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .jobs
                .values()
                .filter(|j| !j.status.is_terminal())
                .filter_map(|j| j.download_id.clone().map(|d| (j.job_id.clone(), d)))
                .collect()
        };
        for (job_id, download_id) in candidates {
            if let Some(session) = self.bus.snapshot(&download_id) {
                match session.status {
                    SessionStatus::Completed => self.complete_job(&job_id),
                    SessionStatus::Error | SessionStatus::Cancelled => self.fail_job(
                        &job_id,
                        session.error.as_deref().unwrap_or("Download failed"),
                    ),
                    SessionStatus::Downloading => {}
                }
            }
        }
    }

    /// Spawns the progress mirror: consumes the bus-wide event stream and
    /// forwards it into job state.
    pub fn spawn_progress_mirror(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        let mut rx = scheduler.bus.subscribe_all();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => scheduler.apply_progress_event(&event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Progress mirror lagged by {} events, reconciling", n);
                        scheduler.reconcile_active();
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}
