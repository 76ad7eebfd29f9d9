//! Idempotent teardown for a [`super::Session`].
//!
//! Best-effort reset, tolerant of an already-gone process, scoped to what
//! this kernel owns: the child process, the transport, and the
//! connection-scoped registries. Breakpoints are caller data and survive
//! cleanup — a caller that restarts a session on the same `Session` handle
//! would otherwise lose everything it configured.

use tracing::{debug, warn};

use crate::types::SessionState;

use super::Session;

pub(super) async fn cleanup(session: &Session) {
    if let Some(mut child) = session.child.lock().await.take() {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(?status, "process already exited before cleanup");
            }
            _ => {
                if let Err(err) = child.kill().await {
                    warn!(%err, "failed to kill process during cleanup");
                }
                let _ = child.wait().await;
            }
        }
    }

    if let Some(transport) = session.transport.write().await.take() {
        transport.disconnect().await;
    }

    session.scripts.clear().await;
    session.source_maps.clear().await;

    let mut state = session.state.write().await;
    if !state.is_terminated() {
        *state = SessionState::Terminated {
            exit_code: None,
            signal: None,
            error: None,
        };
    }
}
