//! Session Kernel (C6, §4.6).
//!
//! `Session` wires the other five components together behind the state
//! machine the rest of the crate's invariants are stated against:
//! `Initialized -> Running -> Paused -> Terminated`, with `Running <->
//! Paused` cycling on every pause/resume. Every public operation documents
//! which states it's legal from; calling it elsewhere is a `StateViolation`
//! and never mutates anything (Testable Property 3).

mod cleanup;
mod control;
mod hang;
mod pause;

use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::breakpoints::BreakpointManager;
use crate::config::SessionConfig;
use crate::error::{KernelError, Result};
use crate::launcher;
use crate::scripts::ScriptRegistry;
use crate::source_map::SourceMapCache;
use crate::transport::InspectorTransport;
use crate::types::SessionState;

pub use control::EvaluationResult;
pub use hang::HangDetector;

/// Callback registered through [`Session::on_crash`]: `(exit_code, signal)`.
pub type CrashCallback = Arc<dyn Fn(Option<i32>, Option<String>) + Send + Sync>;

/// A live debugging session against one launched process.
///
/// Cloning a `Session` shares the same kernel state; it's designed to be
/// handed out to multiple callers (a CLI frontend and a background hang
/// monitor, say) without each needing its own copy of the process handle.
#[derive(Clone)]
pub struct Session {
    config: Arc<SessionConfig>,
    state: Arc<RwLock<SessionState>>,
    child: Arc<Mutex<Option<Child>>>,
    transport: Arc<RwLock<Option<InspectorTransport>>>,
    scripts: Arc<ScriptRegistry>,
    breakpoints: Arc<BreakpointManager>,
    source_maps: Arc<SourceMapCache>,
    /// Index into the paused call stack that `evaluate`/`get_variables`
    /// implicitly target; reset to 0 on every `Running -> Paused` transition
    /// (Testable Property 4).
    current_frame: Arc<RwLock<usize>>,
    crash_callbacks: Arc<Mutex<Vec<CrashCallback>>>,
    /// Bounded tail of stderr lines seen after the inspector URL was found,
    /// kept around for crash diagnostics rather than discarded.
    stderr_tail: Arc<Mutex<Vec<String>>>,
}

const STDERR_TAIL_CAPACITY: usize = 64;

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(RwLock::new(SessionState::Initialized)),
            child: Arc::new(Mutex::new(None)),
            transport: Arc::new(RwLock::new(None)),
            scripts: Arc::new(ScriptRegistry::new()),
            breakpoints: Arc::new(BreakpointManager::new()),
            source_maps: Arc::new(SourceMapCache::new()),
            current_frame: Arc::new(RwLock::new(0)),
            crash_callbacks: Arc::new(Mutex::new(Vec::new())),
            stderr_tail: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Launch the target, connect to its inspector, and wait out the initial
    /// `--inspect-brk` pause. Legal only from `Initialized`; leaves the
    /// session `Paused` on success, `Terminated` on failure (a failed launch
    /// is a terminal outcome, not a retryable one — callers construct a
    /// fresh `Session` to try again).
    pub async fn start(&self) -> Result<()> {
        {
            let guard = self.state.read().await;
            if !matches!(*guard, SessionState::Initialized) {
                return Err(KernelError::state_violation("Initialized", &guard));
            }
        }

        let launch_result = match launcher::launch(&self.config).await {
            Ok(result) => result,
            Err(err) => {
                *self.state.write().await = SessionState::Terminated {
                    exit_code: None,
                    signal: None,
                    error: Some(err.to_string()),
                };
                return Err(err);
            }
        };

        *self.child.lock().await = Some(launch_result.child);
        self.spawn_stderr_drain(launch_result.stderr);

        let transport = match InspectorTransport::connect(
            &launch_result.ws_url,
            self.config.default_send_deadline,
        )
        .await
        {
            Ok(transport) => transport,
            Err(err) => {
                self.force_terminate(None, None, Some(err.to_string())).await;
                return Err(err);
            }
        };

        transport
            .send("Debugger.enable", serde_json::json!({}), None)
            .await?;
        transport
            .send("Runtime.enable", serde_json::json!({}), None)
            .await?;

        self.wire_event_handlers(&transport).await;
        *self.transport.write().await = Some(transport);
        *self.state.write().await = SessionState::Running;

        self.await_initial_pause().await?;
        self.spawn_crash_watcher();
        info!("session started");
        Ok(())
    }

    /// `--inspect-brk` guarantees the target is already sitting at its first
    /// statement waiting for a debugger; the `Debugger.paused` event for
    /// that initial stop races the enable calls above; poll state rather
    /// than a one-shot wait so a pause delivered before we start polling
    /// isn't missed.
    async fn await_initial_pause(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.startup_timeout;
        loop {
            if self.state.read().await.is_paused() {
                return Ok(());
            }
            if let Some((exit_code, signal)) = self.child_exit_status().await {
                self.force_terminate(exit_code, signal, Some("process exited before initial pause".into()))
                    .await;
                return Err(KernelError::LaunchFailed {
                    reason: "exit before initial pause".to_string(),
                    exit_code,
                });
            }
            if tokio::time::Instant::now() >= deadline {
                self.force_terminate(None, None, Some("timed out waiting for initial pause".into()))
                    .await;
                return Err(KernelError::LaunchFailed {
                    reason: "timeout waiting for initial debugger pause".to_string(),
                    exit_code: None,
                });
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Watches the child outside of any in-flight caller operation; when it
    /// exits while the kernel wasn't already tearing down via `cleanup`,
    /// fires the registered crash callbacks and transitions to `Terminated`
    /// (§6 `on_crash`).
    fn spawn_crash_watcher(&self) {
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                if session.state.read().await.is_terminated() {
                    return;
                }
                let Some((exit_code, signal)) = session.child_exit_status().await else {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                };

                let abnormal = !matches!(exit_code, Some(0)) || signal.is_some();
                let mut state = session.state.write().await;
                if state.is_terminated() {
                    return;
                }
                *state = SessionState::Terminated {
                    exit_code,
                    signal: signal.clone(),
                    error: None,
                };
                drop(state);

                if let Some(transport) = session.transport.write().await.take() {
                    transport.disconnect().await;
                }

                if abnormal {
                    let tail = session.stderr_tail().await;
                    warn!(?exit_code, ?signal, stderr_tail = ?tail, "session's target process crashed");
                    let callbacks = session.crash_callbacks.lock().await.clone();
                    for callback in callbacks {
                        callback(exit_code, signal.clone());
                    }
                }
                return;
            }
        });
    }

    /// Register a callback invoked once if the target exits non-zero or is
    /// killed by a signal while the kernel was not already in `cleanup`.
    pub async fn on_crash(&self, callback: impl Fn(Option<i32>, Option<String>) + Send + Sync + 'static) {
        self.crash_callbacks.lock().await.push(Arc::new(callback));
    }

    /// Keeps the stderr pipe drained after the launcher hands it off, so a
    /// chatty target can't block on a full pipe buffer; lines are kept in a
    /// small ring for crash diagnostics.
    fn spawn_stderr_drain(&self, stderr: tokio::process::ChildStderr) {
        let tail = self.stderr_tail.clone();
        tokio::spawn(async move {
            use tokio::io::{AsyncBufReadExt, BufReader};
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut guard = tail.lock().await;
                if guard.len() == STDERR_TAIL_CAPACITY {
                    guard.remove(0);
                }
                guard.push(line);
            }
        });
    }

    /// The most recent stderr lines seen from the target, for diagnostics
    /// (e.g. alongside an `on_crash` notification).
    pub async fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.lock().await.clone()
    }

    async fn wire_event_handlers(&self, transport: &InspectorTransport) {
        let scripts = self.scripts.clone();
        let breakpoints = self.breakpoints.clone();
        let source_maps_for_reattempt = self.source_maps.clone();
        let transport_for_reattempt = transport.clone();
        transport
            .on(
                "Debugger.scriptParsed",
                Arc::new(move |_method, params| {
                    let Some(script_id) = params.get("scriptId").and_then(|v| v.as_str()) else {
                        return;
                    };
                    let Some(url) = params.get("url").and_then(|v| v.as_str()) else {
                        return;
                    };
                    let scripts = scripts.clone();
                    let breakpoints = breakpoints.clone();
                    let source_maps = source_maps_for_reattempt.clone();
                    let transport = transport_for_reattempt.clone();
                    let script_id = script_id.to_string();
                    let url = url.to_string();
                    tokio::spawn(async move {
                        scripts.record(script_id, url.clone()).await;
                        breakpoints
                            .reattempt_unresolved(&transport, &scripts, &source_maps, &url)
                            .await;
                    });
                }),
            )
            .await;

        let state = self.state.clone();
        let breakpoints = self.breakpoints.clone();
        let source_maps = self.source_maps.clone();
        let current_frame = self.current_frame.clone();
        let transport_for_pause = transport.clone();
        transport
            .on(
                "Debugger.paused",
                Arc::new(move |_method, params| {
                    let state = state.clone();
                    let breakpoints = breakpoints.clone();
                    let source_maps = source_maps.clone();
                    let current_frame = current_frame.clone();
                    let transport = transport_for_pause.clone();
                    let params = params.clone();
                    tokio::spawn(async move {
                        pause::handle_paused(&state, &breakpoints, &source_maps, &current_frame, &transport, params)
                            .await;
                    });
                }),
            )
            .await;

        transport
            .on(
                "Debugger.breakpointResolved",
                Arc::new(move |_method, params| {
                    let id = params.get("breakpointId").and_then(|v| v.as_str()).unwrap_or_default();
                    let location = params.get("location").cloned().unwrap_or_default();
                    tracing::debug!(breakpoint_id = %id, ?location, "cdp resolved a breakpoint independently");
                }),
            )
            .await;

        let state = self.state.clone();
        transport
            .on(
                "Debugger.resumed",
                Arc::new(move |_method, _params| {
                    let state = state.clone();
                    tokio::spawn(async move {
                        let mut guard = state.write().await;
                        if guard.is_paused() {
                            *guard = SessionState::Running;
                        }
                    });
                }),
            )
            .await;
    }

    async fn force_terminate(&self, exit_code: Option<i32>, signal: Option<String>, error: Option<String>) {
        if let Some(transport) = self.transport.write().await.take() {
            transport.disconnect().await;
        }
        if let Some(mut child) = self.child.lock().await.take() {
            if child.try_wait().ok().flatten().is_none() {
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }
        *self.state.write().await = SessionState::Terminated { exit_code, signal, error };
    }

    pub async fn get_state(&self) -> SessionState {
        self.state.read().await.clone()
    }

    /// Raw access to the launched process, for callers that need signals or
    /// platform-specific handles beyond what the kernel exposes.
    pub async fn get_process_handle(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(Child::id)
    }

    /// Raw access to the transport, for advanced callers (profilers,
    /// coverage collectors) that need to issue CDP domains the kernel
    /// doesn't wrap. Returns `None` before `start` or after termination.
    pub async fn get_inspector(&self) -> Option<InspectorTransport> {
        self.transport.read().await.clone()
    }

    pub fn breakpoints(&self) -> &BreakpointManager {
        &self.breakpoints
    }

    pub fn scripts(&self) -> &ScriptRegistry {
        &self.scripts
    }

    pub(crate) async fn child_exit_status(&self) -> Option<(Option<i32>, Option<String>)> {
        let mut guard = self.child.lock().await;
        let child = guard.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some((status.code(), unix_signal(&status))),
            _ => None,
        }
    }

    /// Idempotent teardown: kill the process if still alive, disconnect the
    /// transport, clear cached registries. Safe to call from any state,
    /// including after a prior `cleanup` call.
    pub async fn cleanup(&self) {
        cleanup::cleanup(self).await;
    }
}

#[cfg(unix)]
fn unix_signal(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|s| s.to_string())
}

#[cfg(not(unix))]
fn unix_signal(_status: &std::process::ExitStatus) -> Option<String> {
    None
}
