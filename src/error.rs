//! The kernel's error hierarchy (§7).
//!
//! One variant per error kind named in the design; each carries the
//! structured data its kind needs rather than collapsing to a string.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, KernelError>;

#[derive(Debug, Error, Clone)]
pub enum KernelError {
    #[error("launch failed: {reason}{}", exit_code.map(|c| format!(" (exit code {c})")).unwrap_or_default())]
    LaunchFailed {
        reason: String,
        exit_code: Option<i32>,
    },

    #[error("not connected")]
    NotConnected,

    #[error("transport disconnected")]
    Disconnected,

    #[error("illegal operation: requires state {expected}, but session is {actual}")]
    StateViolation {
        expected: &'static str,
        actual: String,
    },

    #[error("cdp error {code}: {message}")]
    CdpError { code: i64, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("process terminated{}{}",
        exit_code.map(|c| format!(" (exit code {c})")).unwrap_or_default(),
        signal.as_ref().map(|s| format!(" (signal {s})")).unwrap_or_default())]
    ProcessTerminated {
        exit_code: Option<i32>,
        signal: Option<String>,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("breakpoint {id} did not resolve to a CDP id")]
    BreakpointUnresolved { id: String },

    #[error("internal kernel error: {0}")]
    Internal(String),
}

impl KernelError {
    pub fn state_violation(expected: &'static str, actual: &crate::types::SessionState) -> Self {
        KernelError::StateViolation {
            expected,
            actual: actual.label().to_string(),
        }
    }
}
