//! Process execution utilities with timeout and termination support
//!
//! Helpers for the two external tools the pipeline drives. Both take the
//! subprocess name so failures read as "extractor timed out", not as an
//! anonymous child: the same helpers serve the extractor and the
//! transcoder and their errors surface to clients.

use std::process::Output;
use std::time::Duration;
use tokio::process::{Child, Command};

use crate::core::config;
use crate::core::error::AppError;

/// Run a one-shot command to completion, bounded by a timeout.
///
/// On expiry the child is killed before the error is returned, so probe
/// commands never linger.
pub async fn run_with_timeout(
    cmd: &mut Command,
    name: &str,
    timeout: Duration,
) -> Result<Output, AppError> {
    cmd.kill_on_drop(true);
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(AppError::Internal(format!("{} failed to run: {}", name, e))),
        Err(_) => Err(AppError::Timeout(format!(
            "{} timed out after {}s",
            name,
            timeout.as_secs()
        ))),
    }
}

/// Send a graceful termination signal to a child process.
///
/// On unix this is SIGTERM, which lets the extractor flush and remove
/// partial state. On other platforms there is no graceful option and the
/// caller's follow-up kill is the only mechanism.
#[cfg(unix)]
fn signal_term(child: &Child) {
    if let Some(pid) = child.id() {
        // Safety: plain kill(2) on a pid we own; failure is ignored because
        // the process may already have exited.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn signal_term(_child: &Child) {}

/// Terminate a child: graceful signal, bounded wait, then unconditional kill.
///
/// Idempotent: terminating an already-dead child is a no-op. Always reaps
/// the child so no zombie is left behind.
pub async fn terminate_gracefully(child: &mut Child, name: &str) {
    // Already exited?
    if let Ok(Some(status)) = child.try_wait() {
        log::debug!("{} already exited with {}", name, status);
        return;
    }

    signal_term(child);

    let window = config::process::graceful_kill_window();
    match tokio::time::timeout(window, child.wait()).await {
        Ok(Ok(status)) => {
            log::debug!("{} terminated gracefully with {}", name, status);
        }
        Ok(Err(e)) => {
            log::warn!("Failed waiting for {} after graceful signal: {}", name, e);
        }
        Err(_) => {
            log::warn!(
                "{} did not exit within {}s, killing",
                name,
                window.as_secs()
            );
            if let Err(e) = child.kill().await {
                log::warn!("Failed to kill {}: {}", name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_with_timeout_success() {
        let mut cmd = Command::new("echo");
        cmd.arg("hello");
        let output = run_with_timeout(&mut cmd, "echo", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_with_timeout_expires_with_name() {
        let mut cmd = Command::new("sleep");
        cmd.arg("10");
        let result = run_with_timeout(&mut cmd, "transcoder probe", Duration::from_millis(50)).await;
        match result {
            Err(AppError::Timeout(msg)) => assert!(msg.contains("transcoder probe")),
            other => panic!("Expected Timeout, got: {:?}", other.map(|o| o.status)),
        }
    }

    #[tokio::test]
    async fn test_run_with_timeout_spawn_failure_names_process() {
        let mut cmd = Command::new("/nonexistent/mediaduct-probe-bin");
        let result = run_with_timeout(&mut cmd, "extractor version probe", Duration::from_secs(1)).await;
        match result {
            Err(AppError::Internal(msg)) => assert!(msg.contains("extractor version probe")),
            other => panic!("Expected Internal, got: {:?}", other.map(|o| o.status)),
        }
    }

    #[tokio::test]
    async fn test_terminate_gracefully_running_child() {
        let mut child = Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        terminate_gracefully(&mut child, "sleep").await;
        // Child must be gone afterwards
        let status = child.try_wait().expect("try_wait");
        assert!(status.is_some(), "child should have been reaped");
    }

    #[tokio::test]
    async fn test_terminate_gracefully_exited_child() {
        let mut child = Command::new("true").spawn().expect("spawn true");
        let _ = child.wait().await;
        // Second termination is a no-op
        terminate_gracefully(&mut child, "true").await;
    }
}
