//! Session configuration (§3, §4.7).
//!
//! A plain data struct with sane defaults, built up through chained setters
//! rather than requiring every field to be named at construction time.

use std::path::PathBuf;
use std::time::Duration;

/// Immutable once the session is constructed from it.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub cmd: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub startup_timeout: Duration,
    pub default_send_deadline: Duration,
    pub hang_sample_interval: Option<Duration>,
}

impl SessionConfig {
    pub fn builder(cmd: impl Into<String>) -> SessionConfigBuilder {
        SessionConfigBuilder::new(cmd)
    }
}

/// Default time the launcher waits for the inspector URL to appear on stderr.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
/// Default per-`send` deadline when a caller doesn't supply one.
pub const DEFAULT_SEND_DEADLINE: Duration = Duration::from_secs(10);

pub struct SessionConfigBuilder {
    cmd: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    startup_timeout: Duration,
    default_send_deadline: Duration,
    hang_sample_interval: Option<Duration>,
}

impl SessionConfigBuilder {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            args: Vec::new(),
            cwd: None,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            default_send_deadline: DEFAULT_SEND_DEADLINE,
            hang_sample_interval: None,
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn default_send_deadline(mut self, deadline: Duration) -> Self {
        self.default_send_deadline = deadline;
        self
    }

    pub fn hang_sample_interval(mut self, interval: Duration) -> Self {
        self.hang_sample_interval = Some(interval);
        self
    }

    pub fn build(self) -> SessionConfig {
        SessionConfig {
            cmd: self.cmd,
            args: self.args,
            cwd: self.cwd,
            startup_timeout: self.startup_timeout,
            default_send_deadline: self.default_send_deadline,
            hang_sample_interval: self.hang_sample_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_in_defaults() {
        let cfg = SessionConfig::builder("node").arg("app.js").build();
        assert_eq!(cfg.cmd, "node");
        assert_eq!(cfg.args, vec!["app.js".to_string()]);
        assert!(cfg.cwd.is_none());
        assert_eq!(cfg.startup_timeout, DEFAULT_STARTUP_TIMEOUT);
    }

    #[test]
    fn builder_overrides_are_applied() {
        let cfg = SessionConfig::builder("node")
            .args(["--trace", "app.js"])
            .cwd("/tmp/project")
            .startup_timeout(Duration::from_secs(1))
            .hang_sample_interval(Duration::from_millis(50))
            .build();
        assert_eq!(cfg.args, vec!["--trace".to_string(), "app.js".to_string()]);
        assert_eq!(cfg.cwd, Some(PathBuf::from("/tmp/project")));
        assert_eq!(cfg.startup_timeout, Duration::from_secs(1));
        assert_eq!(cfg.hang_sample_interval, Some(Duration::from_millis(50)));
    }
}
