//! Cross-component pipeline tests: scheduler + progress bus + mirror
//!
//! These drive the job lifecycle the way the HTTP edge does, but with
//! simulated sessions instead of real subprocesses.

use std::sync::Arc;
use std::time::Duration;

use mediaduct::progress::{ProgressBus, ProgressEvent, SessionStatus};
use mediaduct::queue::{JobScheduler, JobStatus};

fn pipeline() -> (Arc<JobScheduler>, Arc<ProgressBus>) {
    let bus = Arc::new(ProgressBus::new());
    let scheduler = Arc::new(JobScheduler::new(Arc::clone(&bus)));
    scheduler.spawn_progress_mirror();
    (scheduler, bus)
}

async fn wait_for_status(scheduler: &JobScheduler, job_id: &str, status: JobStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if scheduler.job(job_id).map(|j| j.status) == Some(status) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "job {} never reached {:?}, is {:?}",
            job_id,
            status,
            scheduler.job(job_id).map(|j| j.status)
        )
    });
}

#[tokio::test]
async fn happy_download_lifecycle() {
    let (scheduler, bus) = pipeline();

    let (job_id, can_start) = scheduler.add_download_job("https://example.test/v", "22");
    assert!(can_start);

    let session = bus.create_session("https://example.test/v", "22", None);
    assert!(scheduler.start_job(&job_id, &session));
    assert_eq!(scheduler.job(&job_id).unwrap().status, JobStatus::Downloading);

    bus.update_progress(&session, 512 * 1024, Some(1024 * 1024));
    bus.mark_completed(&session);

    wait_for_status(&scheduler, &job_id, JobStatus::Completed).await;

    let state = scheduler.queue_state();
    assert_eq!(state.processing, None);
    assert!(state.queue.is_empty());
    assert_eq!(state.counts.completed, 1);
}

#[tokio::test]
async fn queued_job_starts_after_active_completes() {
    let (scheduler, bus) = pipeline();

    let (j1, c1) = scheduler.add_download_job("https://example.test/1", "22");
    let (j2, c2) = scheduler.add_download_job("https://example.test/2", "22");
    assert!(c1);
    assert!(!c2);

    let s1 = bus.create_session("https://example.test/1", "22", None);
    assert!(scheduler.start_job(&j1, &s1));

    // Second job refused while the first is active
    let s2 = bus.create_session("https://example.test/2", "22", None);
    assert!(!scheduler.start_job(&j2, &s2));

    bus.mark_completed(&s1);
    wait_for_status(&scheduler, &j1, JobStatus::Completed).await;

    // After the drain the second job is startable
    assert!(scheduler.start_job(&j2, &s2));
}

#[tokio::test]
async fn dependency_cascade_on_extractor_failure() {
    let (scheduler, bus) = pipeline();

    let (d1, _) = scheduler.add_download_job("https://example.test/v", "22");
    let (c1, _) = scheduler
        .add_convert_job(Some("https://example.test/v"), "mp3", Some(&d1), None)
        .unwrap();

    let s1 = bus.create_session("https://example.test/v", "22", None);
    assert!(scheduler.start_job(&d1, &s1));

    // Simulated spawn failure
    bus.mark_error(&s1, "Extractor binary not found");

    wait_for_status(&scheduler, &d1, JobStatus::Failed).await;
    wait_for_status(&scheduler, &c1, JobStatus::Failed).await;

    let convert = scheduler.job(&c1).unwrap();
    assert!(
        convert.error.as_deref().unwrap().contains("Dependency failed"),
        "unexpected error: {:?}",
        convert.error
    );
    assert!(convert.started_at.is_none());
    assert_eq!(scheduler.queue_state().processing, None);
}

#[tokio::test]
async fn cancellation_frees_the_queue_for_the_next_job() {
    let (scheduler, bus) = pipeline();

    let (j1, _) = scheduler.add_download_job("https://example.test/1", "22");
    let (j2, _) = scheduler.add_download_job("https://example.test/2", "22");

    let s1 = bus.create_session("https://example.test/1", "22", None);
    assert!(scheduler.start_job(&j1, &s1));

    scheduler.cancel_job(&j1).unwrap();

    let job = scheduler.job(&j1).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("Cancelled by user"));
    assert_eq!(bus.snapshot(&s1).unwrap().status, SessionStatus::Cancelled);

    // The next queued job proceeds
    let s2 = bus.create_session("https://example.test/2", "22", None);
    assert!(scheduler.start_job(&j2, &s2));
}

#[tokio::test]
async fn progress_events_are_monotone_until_terminal() {
    let (_, bus) = pipeline();

    let session = bus.create_session("https://example.test/v", "22", None);
    let (_snap, mut rx) = bus.subscribe(&session).unwrap();

    for bytes in [1000u64, 5000, 5000, 25000, 100_000] {
        bus.update_progress(&session, bytes, Some(100_000));
    }
    bus.mark_completed(&session);

    let mut last_bytes = 0u64;
    let mut saw_terminal = false;
    while let Ok(event) = rx.try_recv() {
        if let ProgressEvent::Progress {
            bytes_downloaded,
            percentage,
            status,
            ..
        } = event
        {
            assert!(
                bytes_downloaded >= last_bytes,
                "bytes regressed: {} < {}",
                bytes_downloaded,
                last_bytes
            );
            if let Some(p) = percentage {
                assert!(p <= 100);
            }
            last_bytes = bytes_downloaded;
            if status.is_terminal() {
                saw_terminal = true;
            } else {
                assert!(!saw_terminal, "progress event after a terminal one");
            }
        }
    }
    assert!(saw_terminal);
}

#[tokio::test]
async fn mirror_marks_job_failed_on_session_error() {
    let (scheduler, bus) = pipeline();

    let (j1, _) = scheduler.add_download_job("https://example.test/1", "22");
    let s1 = bus.create_session("https://example.test/1", "22", None);
    scheduler.start_job(&j1, &s1);

    bus.mark_error(&s1, "Download timed out after 600s");
    wait_for_status(&scheduler, &j1, JobStatus::Failed).await;

    let job = scheduler.job(&j1).unwrap();
    assert!(job.error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn terminal_job_ignores_late_session_events() {
    let (scheduler, bus) = pipeline();

    let (j1, _) = scheduler.add_download_job("https://example.test/1", "22");
    let s1 = bus.create_session("https://example.test/1", "22", None);
    scheduler.start_job(&j1, &s1);

    bus.mark_completed(&s1);
    wait_for_status(&scheduler, &j1, JobStatus::Completed).await;

    // A duplicate terminal report from the second subprocess listener
    bus.mark_error(&s1, "late close event");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(scheduler.job(&j1).unwrap().status, JobStatus::Completed);
}
