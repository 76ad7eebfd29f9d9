//! Shared data types that flow between the kernel's components.
//!
//! These mirror §3 of the design doc: everything here is a snapshot type —
//! callers get an owned copy, never a handle into kernel-internal state.

use serde::{Deserialize, Serialize};

/// A CDP-assigned breakpoint id, as returned by `Debugger.setBreakpointByUrl`
/// or `Debugger.setBreakpoint`.
pub type CdpBreakpointId = String;

/// The lifecycle state of a [`crate::session::Session`].
///
/// Every kernel operation documents the variants it is legal to call from;
/// calling it from any other variant fails with [`crate::error::KernelError::StateViolation`]
/// and performs no mutation (Testable Property 3).
#[derive(Debug, Clone)]
pub enum SessionState {
    Initialized,
    Running,
    Paused {
        call_frames: Vec<Frame>,
        reason: PauseReason,
        hit_breakpoints: Vec<CdpBreakpointId>,
    },
    Terminated {
        exit_code: Option<i32>,
        signal: Option<String>,
        error: Option<String>,
    },
}

impl SessionState {
    /// Short, stable name used in `StateViolation` messages and logging.
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Initialized => "Initialized",
            SessionState::Running => "Running",
            SessionState::Paused { .. } => "Paused",
            SessionState::Terminated { .. } => "Terminated",
        }
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, SessionState::Paused { .. })
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, SessionState::Terminated { .. })
    }
}

/// Why the target paused, as reported by `Debugger.paused.reason` (CDP sends
/// a handful of string reasons; we fold the ones the kernel cares about into
/// a closed enum and keep the rest verbatim).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PauseReason {
    Breakpoint,
    DebugCommand,
    Step,
    Exception,
    Other(String),
}

impl PauseReason {
    pub fn from_cdp(reason: &str) -> Self {
        match reason {
            "breakpoint" => PauseReason::Breakpoint,
            "debugCommand" => PauseReason::DebugCommand,
            "step" | "ambiguous" => PauseReason::Step,
            "exception" | "promiseRejection" | "assert" => PauseReason::Exception,
            other => PauseReason::Other(other.to_string()),
        }
    }
}

/// A single call frame, resolved to an absolute source path.
///
/// `file`/`line`/`column` are overwritten in place with source-mapped
/// coordinates when a source map is available (§4.6, pause-event handling
/// step 2); `scope_chain` carries the raw CDP scope descriptors needed by
/// `get_variables`.
#[derive(Debug, Clone, Serialize)]
pub struct Frame {
    pub call_frame_id: String,
    pub function_name: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub scope_chain: Vec<ScopeDescriptor>,
}

/// One entry of a call frame's `scopeChain`, carrying just enough to drive
/// `Runtime.getProperties` later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeDescriptor {
    #[serde(rename = "type")]
    pub scope_type: String,
    pub object_id: Option<String>,
}

/// A location expressed in the caller-facing, 1-indexed-line convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation<'a> {
    pub file: &'a str,
    pub line: u32,
    pub column: u32,
}

/// A location in compiled (generated) coordinates, same convention as
/// [`SourceLocation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

/// A script announced by `Debugger.scriptParsed`.
#[derive(Debug, Clone)]
pub struct Script {
    pub script_id: String,
    pub url: String,
}

/// Outcome of [`crate::session::Session::detect_hang`].
#[derive(Debug, Clone, Serialize)]
pub struct HangReport {
    pub hung: bool,
    pub completed: bool,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub location: Option<String>,
    pub stack: Vec<Frame>,
    pub message: String,
}
