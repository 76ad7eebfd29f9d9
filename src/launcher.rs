//! Process Launcher (C1, §4.1).
//!
//! Spawns the target with the inspector enabled and scrapes the `ws://…`
//! URL off its early stderr. This is the only portable discovery channel
//! available without a registry service: `--inspect-brk=0` delegates port
//! assignment to the runtime, so the URL has to come from the process itself.

use std::process::Stdio;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{KernelError, Result};

static WS_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"ws://127\.0\.0\.1:\d+/[a-f0-9-]+").expect("valid regex"));

/// How many lines of stderr we keep around after the inspector URL is found,
/// for crash diagnostics later (the kernel surfaces this on abnormal exit).
const STDERR_TAIL_CAPACITY: usize = 64;

pub struct LaunchResult {
    pub child: Child,
    pub ws_url: String,
    /// Remaining stderr lines, handed to the caller to keep draining so the
    /// pipe doesn't back up; also seeded with anything buffered before the
    /// inspector URL was found.
    pub stderr: tokio::process::ChildStderr,
}

/// Spawn `cmd args…` with the inspector flags prepended, and wait for the
/// `ws://` URL to appear on stderr.
pub async fn launch(config: &SessionConfig) -> Result<LaunchResult> {
    let mut full_args = vec![
        "--inspect-brk=0".to_string(),
        "--enable-source-maps".to_string(),
    ];
    full_args.extend(config.args.iter().cloned());

    info!(cmd = %config.cmd, args = ?full_args, "launching target process");

    let mut command = Command::new(&config.cmd);
    command
        .args(&full_args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("NODE_OPTIONS", append_source_map_flag(&std::env::var("NODE_OPTIONS").unwrap_or_default()));

    if let Some(cwd) = &config.cwd {
        command.current_dir(cwd);
    }

    let mut child = command.spawn().map_err(|err| KernelError::LaunchFailed {
        reason: format!("failed to spawn process: {err}"),
        exit_code: None,
    })?;

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| KernelError::Internal("child stderr not piped".into()))?;

    match timeout(config.startup_timeout, scan_for_ws_url(&mut child, stderr)).await {
        Ok(Ok((ws_url, stderr))) => {
            info!(%ws_url, "discovered inspector websocket url");
            Ok(LaunchResult {
                child,
                ws_url,
                stderr,
            })
        }
        Ok(Err(err)) => Err(err),
        Err(_) => {
            warn!("timed out waiting for inspector url; killing child");
            let _ = child.kill().await;
            Err(KernelError::LaunchFailed {
                reason: "timeout".to_string(),
                exit_code: None,
            })
        }
    }
}

fn append_source_map_flag(existing: &str) -> String {
    if existing.contains("--enable-source-maps") {
        existing.to_string()
    } else if existing.trim().is_empty() {
        "--enable-source-maps".to_string()
    } else {
        format!("{existing} --enable-source-maps")
    }
}

async fn scan_for_ws_url(
    child: &mut Child,
    stderr: tokio::process::ChildStderr,
) -> Result<(String, tokio::process::ChildStderr)> {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();
    let mut tail: Vec<String> = Vec::with_capacity(STDERR_TAIL_CAPACITY);

    loop {
        line.clear();
        tokio::select! {
            read = reader.read_line(&mut line) => {
                let bytes = read.map_err(|err| KernelError::Internal(format!("stderr read failed: {err}")))?;
                if bytes == 0 {
                    // EOF: the child closed stderr without ever printing a URL.
                    let status = child.wait().await.ok();
                    return Err(KernelError::LaunchFailed {
                        reason: "exit before inspector url".to_string(),
                        exit_code: status.and_then(|s| s.code()),
                    });
                }
                debug!(line = %line.trim_end(), "child stderr");
                if let Some(m) = WS_URL_RE.find(&line) {
                    let ws_url = m.as_str().to_string();
                    return Ok((ws_url, reader.into_inner()));
                }
                push_tail(&mut tail, line.trim_end().to_string());
            }
            status = child.wait() => {
                let status = status.map_err(|err| KernelError::Internal(format!("wait failed: {err}")))?;
                return Err(KernelError::LaunchFailed {
                    reason: "exit before inspector url".to_string(),
                    exit_code: status.code(),
                });
            }
        }
    }
}

fn push_tail(tail: &mut Vec<String>, line: String) {
    if tail.len() == STDERR_TAIL_CAPACITY {
        tail.remove(0);
    }
    tail.push(line);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_regex_matches_standard_inspector_line() {
        let line = "Debugger listening on ws://127.0.0.1:9229/3c5dfb36-e4a5-4e5c-9e9e-2e2e2e2e2e2e";
        let m = WS_URL_RE.find(line).expect("should match");
        assert_eq!(
            m.as_str(),
            "ws://127.0.0.1:9229/3c5dfb36-e4a5-4e5c-9e9e-2e2e2e2e2e2e"
        );
    }

    #[test]
    fn ws_url_regex_ignores_unrelated_lines() {
        assert!(WS_URL_RE.find("For help, see: https://nodejs.org/en/docs/inspector").is_none());
    }

    #[test]
    fn append_source_map_flag_is_idempotent() {
        assert_eq!(append_source_map_flag(""), "--enable-source-maps");
        assert_eq!(
            append_source_map_flag("--max-old-space-size=4096"),
            "--max-old-space-size=4096 --enable-source-maps"
        );
        assert_eq!(
            append_source_map_flag("--enable-source-maps"),
            "--enable-source-maps"
        );
    }

    #[tokio::test]
    async fn launch_failed_when_command_does_not_exist() {
        let config = SessionConfig::builder("definitely-not-a-real-binary-xyz").build();
        let result = launch(&config).await;
        assert!(matches!(result, Err(KernelError::LaunchFailed { .. })));
    }

    #[tokio::test]
    async fn launch_discovers_url_printed_by_a_shell_script() {
        // Use `sh` as a stand-in "runtime" that prints an inspector-shaped URL,
        // exercising the same stderr-scrape path without depending on node.
        let config = SessionConfig::builder("sh")
            .args([
                "-c",
                "echo 'Debugger listening on ws://127.0.0.1:9230/abc-123' 1>&2; sleep 5",
            ])
            .startup_timeout(Duration::from_secs(3))
            .build();
        let result = launch(&config).await.expect("should discover url");
        assert_eq!(result.ws_url, "ws://127.0.0.1:9230/abc-123");
        let mut child = result.child;
        let _ = child.kill().await;
    }

    #[tokio::test]
    async fn launch_fails_when_process_exits_before_printing_url() {
        let config = SessionConfig::builder("sh")
            .args(["-c", "exit 7"])
            .startup_timeout(Duration::from_secs(3))
            .build();
        let err = launch(&config).await.expect_err("should fail");
        match err {
            KernelError::LaunchFailed { reason, exit_code } => {
                assert_eq!(reason, "exit before inspector url");
                assert_eq!(exit_code, Some(7));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn launch_times_out_when_no_url_ever_appears() {
        let config = SessionConfig::builder("sh")
            .args(["-c", "sleep 5"])
            .startup_timeout(Duration::from_millis(200))
            .build();
        let err = launch(&config).await.expect_err("should time out");
        match err {
            KernelError::LaunchFailed { reason, .. } => assert_eq!(reason, "timeout"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
