//! Hang Detector sub-routine (§4.6, Testable Property S5).
//!
//! Unlike the rest of the kernel, this doesn't operate on a caller's
//! existing `Session` — it launches its own disposable one, races natural
//! termination against a deadline, and (optionally) runs a concurrent
//! sampler that repeatedly pauses and resumes the target looking for an
//! unchanging `(file, line)`, which is as close to "stuck in a loop" as can
//! be observed from outside the runtime. Cleanup of the disposable session
//! is guaranteed on every return path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::warn;

use crate::config::SessionConfig;
use crate::types::HangReport;

use super::Session;

/// Sampling interval used when the caller's config doesn't set one.
const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Consecutive identical `(file, line)` samples that count as an infinite
/// loop rather than coincidentally-slow-but-healthy progress.
const LOOP_SAMPLE_THRESHOLD: u32 = 3;

/// Entry point for running hang detection against a freshly launched
/// target, independent of any session a caller already owns.
pub struct HangDetector;

impl HangDetector {
    /// Launch `config`'s command as a disposable session and determine
    /// whether it's hung within `timeout`. See module docs for the
    /// algorithm.
    pub async fn detect_hang(config: SessionConfig, timeout: Duration) -> HangReport {
        detect_hang(config, timeout).await
    }
}

pub(super) async fn detect_hang(config: SessionConfig, timeout: Duration) -> HangReport {
    let sample_interval = config.hang_sample_interval.unwrap_or(DEFAULT_SAMPLE_INTERVAL);
    let run_sampler = config.hang_sample_interval.is_some();
    let started = Instant::now();

    let session = Session::new(config);
    if let Err(err) = session.start().await {
        return HangReport {
            hung: false,
            completed: true,
            exit_code: None,
            duration_ms: started.elapsed().as_millis() as u64,
            location: None,
            stack: Vec::new(),
            message: format!("disposable session failed to launch: {err}"),
        };
    }
    // `start` leaves the session Paused at the initial `--inspect-brk` stop;
    // resume past it so the target actually runs.
    let _ = session.resume().await;

    let sampler_hit: Arc<Mutex<Option<HangReport>>> = Arc::new(Mutex::new(None));
    let stop = Arc::new(AtomicBool::new(false));
    let sampler_handle = if run_sampler {
        let session = session.clone();
        let sampler_hit = sampler_hit.clone();
        let stop = stop.clone();
        Some(tokio::spawn(async move {
            run_sampler(session, sample_interval, sampler_hit, stop, started).await;
        }))
    } else {
        None
    };

    let poll_interval = Duration::from_millis(20).min(sample_interval);
    let report = loop {
        if let Some((exit_code, _signal)) = session.child_exit_status().await {
            break HangReport {
                hung: false,
                completed: true,
                exit_code,
                duration_ms: started.elapsed().as_millis() as u64,
                location: None,
                stack: Vec::new(),
                message: "process exited before deadline".to_string(),
            };
        }

        if let Some(hit) = sampler_hit.lock().await.take() {
            break hit;
        }

        if started.elapsed() >= timeout {
            break deadline_report(&session, started).await;
        }

        let remaining = timeout - started.elapsed();
        tokio::time::sleep(poll_interval.min(remaining)).await;
    };

    stop.store(true, Ordering::SeqCst);
    if let Some(handle) = sampler_handle {
        handle.abort();
    }
    session.cleanup().await;
    report
}

/// Deadline path: force a pause, wait for it to land, and snapshot the
/// stack. `Debugger.pause` takes effect on the next statement boundary, so
/// the wait can't be instant even on a healthy target.
async fn deadline_report(session: &Session, started: Instant) -> HangReport {
    let _ = session.pause().await;
    wait_for_paused(session, Duration::from_secs(2)).await;

    let stack = session.get_call_stack().await.unwrap_or_default();
    let location = stack.first().map(|f| format!("{}:{}", f.file, f.line));
    warn!(duration_ms = started.elapsed().as_millis() as u64, "session appears hung");
    HangReport {
        hung: true,
        completed: false,
        exit_code: None,
        duration_ms: started.elapsed().as_millis() as u64,
        location,
        stack,
        message: "execution exceeded timeout before the target paused or exited".to_string(),
    }
}

async fn wait_for_paused(session: &Session, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !session.get_state().await.is_paused() {
        if Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Repeatedly pause, sample the top frame, and resume, looking for the same
/// `(file, line)` across `LOOP_SAMPLE_THRESHOLD` consecutive samples.
async fn run_sampler(
    session: Session,
    interval: Duration,
    hit: Arc<Mutex<Option<HangReport>>>,
    stop: Arc<AtomicBool>,
    started: Instant,
) {
    let mut last: Option<(String, u32)> = None;
    let mut repeats: u32 = 0;

    loop {
        tokio::time::sleep(interval).await;
        if stop.load(Ordering::SeqCst) {
            return;
        }
        if !session.get_state().await.is_paused() && session.pause().await.is_err() {
            continue;
        }
        wait_for_paused(&session, interval).await;

        let stack = session.get_call_stack().await.unwrap_or_default();
        let top = stack.first().map(|f| (f.file.clone(), f.line));
        let _ = session.resume().await;

        let Some(top) = top else { continue };
        if last.as_ref() == Some(&top) {
            repeats += 1;
        } else {
            last = Some(top.clone());
            repeats = 1;
        }

        if repeats >= LOOP_SAMPLE_THRESHOLD {
            let (file, line) = top;
            let mut guard = hit.lock().await;
            if guard.is_none() {
                *guard = Some(HangReport {
                    hung: true,
                    completed: false,
                    exit_code: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                    location: Some(format!("{file}:{line}")),
                    stack,
                    message: format!("infinite loop detected at {file}:{line}"),
                });
            }
            stop.store(true, Ordering::SeqCst);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detect_hang_reports_launch_failure_as_completed() {
        let config = SessionConfig::builder("definitely-not-a-real-binary-xyz").build();
        let report = detect_hang(config, Duration::from_millis(50)).await;
        assert!(!report.hung);
        assert!(report.completed);
    }
}
