//! Pause-state control operations (§4.6).
//!
//! Everything here that mutates the debuggee — resume, step, evaluate —
//! only makes sense from `Paused`, and everything that inspects it reads
//! out of the frames the pause handler already resolved, so none of these
//! need to re-round-trip `Debugger.pause` state themselves.

use serde_json::Value;

use crate::error::{KernelError, Result};
use crate::types::{Frame, SessionState};

use super::Session;

/// Result of [`Session::evaluate`]: either a JSON-serializable value, or the
/// message of a thrown exception (never both).
#[derive(Debug, Clone)]
pub enum EvaluationResult {
    Value(Value),
    Exception(String),
}

impl Session {
    /// Resume a paused session. Legal only from `Paused`.
    pub async fn resume(&self) -> Result<()> {
        self.require_paused().await?;
        self.send("Debugger.resume", serde_json::json!({})).await?;
        *self.current_frame.write().await = 0;
        Ok(())
    }

    /// Force a pause on the next statement. Legal only from `Running`.
    pub async fn pause(&self) -> Result<()> {
        self.require_state(|s| matches!(s, SessionState::Running), "Running")
            .await?;
        self.send("Debugger.pause", serde_json::json!({})).await?;
        Ok(())
    }

    pub async fn step_over(&self) -> Result<()> {
        self.require_paused().await?;
        self.send("Debugger.stepOver", serde_json::json!({})).await?;
        Ok(())
    }

    pub async fn step_into(&self) -> Result<()> {
        self.require_paused().await?;
        self.send("Debugger.stepInto", serde_json::json!({})).await?;
        Ok(())
    }

    pub async fn step_out(&self) -> Result<()> {
        self.require_paused().await?;
        self.send("Debugger.stepOut", serde_json::json!({})).await?;
        Ok(())
    }

    /// Snapshot of the current call stack. Legal only from `Paused`;
    /// frame 0 is the innermost frame, matching the frame cursor reset
    /// invariant applied when the pause occurred.
    pub async fn get_call_stack(&self) -> Result<Vec<Frame>> {
        match self.get_state().await {
            SessionState::Paused { call_frames, .. } => Ok(call_frames),
            other => Err(KernelError::state_violation("Paused", &other)),
        }
    }

    /// Validate that `frame_index` exists in the current stack, then make it
    /// the cursor `evaluate`/`get_variables` implicitly target.
    pub async fn switch_to_frame(&self, frame_index: usize) -> Result<Frame> {
        let frames = self.get_call_stack().await?;
        let frame = frames
            .get(frame_index)
            .cloned()
            .ok_or_else(|| KernelError::InvalidArgument(format!("no frame at index {frame_index}")))?;
        *self.current_frame.write().await = frame_index;
        Ok(frame)
    }

    async fn cursor_frame(&self) -> Result<Frame> {
        let frames = self.get_call_stack().await?;
        let index = *self.current_frame.read().await;
        frames
            .get(index)
            .cloned()
            .ok_or_else(|| KernelError::Internal(format!("current_frame {index} out of range")))
    }

    /// Evaluate `expression` in the context of the current frame cursor
    /// (frame 0 unless `switch_to_frame` moved it). Legal only from `Paused`.
    pub async fn evaluate(&self, expression: &str) -> Result<EvaluationResult> {
        let frame = self.cursor_frame().await?;
        let result = self
            .send(
                "Debugger.evaluateOnCallFrame",
                serde_json::json!({
                    "callFrameId": frame.call_frame_id,
                    "expression": expression,
                    "silent": true,
                    "returnByValue": true,
                }),
            )
            .await?;

        if let Some(exception) = result.get("exceptionDetails") {
            let message = exception
                .get("exception")
                .and_then(|e| e.get("description").or_else(|| e.get("value")))
                .and_then(Value::as_str)
                .unwrap_or("evaluation threw")
                .to_string();
            return Ok(EvaluationResult::Exception(message));
        }

        let value = result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null);
        Ok(EvaluationResult::Value(value))
    }

    /// Fetch variables from the current frame cursor's scope chain. With
    /// `scope` given (e.g. `"local"`, `"closure"`, `"global"`), only that
    /// scope type is queried; otherwise every scope in the chain is. Legal
    /// only from `Paused`.
    pub async fn get_variables(&self, scope: Option<&str>) -> Result<Vec<(String, Value)>> {
        let frame = self.cursor_frame().await?;
        let mut variables = Vec::new();
        for scope_desc in &frame.scope_chain {
            if let Some(wanted) = scope {
                if scope_desc.scope_type != wanted {
                    continue;
                }
            }
            let Some(object_id) = &scope_desc.object_id else {
                continue;
            };
            let result = self
                .send(
                    "Runtime.getProperties",
                    serde_json::json!({
                        "objectId": object_id,
                        "ownProperties": true,
                    }),
                )
                .await?;
            let Some(props) = result.get("result").and_then(Value::as_array) else {
                continue;
            };
            for prop in props {
                let Some(name) = prop.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let value = prop
                    .get("value")
                    .and_then(|v| v.get("value"))
                    .cloned()
                    .unwrap_or(Value::Null);
                variables.push((name.to_string(), value));
            }
        }
        Ok(variables)
    }

    /// Breakpoint CRUD is legal from any session state (SPEC_FULL.md's
    /// operations table): with no transport yet, the breakpoint is stored
    /// locally unresolved and picked up by `reattempt_unresolved` once
    /// `start()` connects and scripts begin parsing.
    pub async fn create_breakpoint(
        &self,
        file: &str,
        line: u32,
        condition: Option<String>,
    ) -> Result<crate::breakpoints::Breakpoint> {
        let transport = self.transport_snapshot().await;
        self.breakpoints
            .create_standard(transport.as_ref(), &self.scripts, &self.source_maps, file, line, condition)
            .await
    }

    pub async fn create_logpoint(
        &self,
        file: &str,
        line: u32,
        template: String,
    ) -> Result<crate::breakpoints::Breakpoint> {
        let transport = self.transport_snapshot().await;
        self.breakpoints
            .create_logpoint(transport.as_ref(), &self.scripts, &self.source_maps, file, line, template)
            .await
    }

    pub async fn create_function_breakpoint(
        &self,
        function_name: String,
    ) -> Result<crate::breakpoints::Breakpoint> {
        self.breakpoints.create_function(function_name).await
    }

    pub async fn remove_breakpoint(&self, id: &str) -> Result<()> {
        let transport = self.transport_snapshot().await;
        self.breakpoints.remove(transport.as_ref(), id).await
    }

    pub async fn enable_breakpoint(&self, id: &str) -> Result<()> {
        let transport = self.transport_snapshot().await;
        self.breakpoints
            .enable(transport.as_ref(), &self.scripts, &self.source_maps, id)
            .await
    }

    pub async fn disable_breakpoint(&self, id: &str) -> Result<()> {
        let transport = self.transport_snapshot().await;
        self.breakpoints.disable(transport.as_ref(), id).await
    }

    pub async fn toggle_breakpoint(&self, id: &str) -> Result<bool> {
        let transport = self.transport_snapshot().await;
        self.breakpoints
            .toggle(transport.as_ref(), &self.scripts, &self.source_maps, id)
            .await
    }

    pub async fn set_hit_count_condition(&self, id: &str, condition: crate::breakpoints::HitCondition) -> Result<()> {
        self.breakpoints.set_hit_count_condition(id, condition).await
    }

    async fn require_paused(&self) -> Result<()> {
        self.require_state(|s| s.is_paused(), "Paused").await
    }

    async fn require_state(
        &self,
        predicate: impl Fn(&SessionState) -> bool,
        expected: &'static str,
    ) -> Result<()> {
        let guard = self.state.read().await;
        if predicate(&guard) {
            Ok(())
        } else {
            Err(KernelError::state_violation(expected, &guard))
        }
    }

    async fn require_transport(&self) -> Result<crate::transport::InspectorTransport> {
        self.transport
            .read()
            .await
            .clone()
            .ok_or(KernelError::NotConnected)
    }

    /// Like `require_transport`, but returns `None` instead of erroring when
    /// no transport exists yet — for breakpoint CRUD, which is legal before
    /// `start()`.
    async fn transport_snapshot(&self) -> Option<crate::transport::InspectorTransport> {
        self.transport.read().await.clone()
    }

    async fn send(&self, method: &str, params: Value) -> Result<Value> {
        let transport = self.require_transport().await?;
        transport.send(method, params, None).await
    }
}
