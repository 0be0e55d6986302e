//! Restart configuration.
//!
//! Everything the restart protocol needs to agree on between parent and child
//! lives here: signal numbers, the inherited descriptor slot, the handoff
//! timeout and the command line marker for daemon mode.
//!
//! # Environment Variables
//!
//! - `MOLT_FORK_TIMEOUT_SECS`: handoff timeout in seconds (default: 10)
//! - `MOLT_INHERITED_FD`: descriptor slot for the listening socket (default: 3)
//! - `MOLT_RESTART_SIGNAL`: restart request signal (default: `SIGHUP`)
//! - `MOLT_HANDSHAKE_SIGNAL`: child-to-parent readiness signal (default: `SIGUSR2`)
//! - `MOLT_FAILURE_POLICY`: `drain` or `keep-serving` (default: `drain`)
//! - `MOLT_LINEAGE`: `executable` or `environment` (default: `executable`)

use std::os::unix::io::RawFd;
use std::time::Duration;
use tracing::warn;

/// Default handoff timeout.
pub const DEFAULT_FORK_TIMEOUT: Duration = Duration::from_secs(10);

/// First descriptor after the standard streams.
pub const DEFAULT_INHERITED_FD: RawFd = 3;

/// Environment variable carrying the parent's pid into a spawned child.
pub const PARENT_PID_ENV: &str = "MOLT_PARENT_PID";

/// What to do when a restart attempt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Close the listener and drain anyway.
    ///
    /// A failed restart still shuts this process down gracefully. The child
    /// may already hold a copy of the socket, so it is left running.
    #[default]
    Drain,
    /// Kill the child if it is still running and go back to serving.
    KeepServing,
}

impl FailurePolicy {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "drain" => Some(FailurePolicy::Drain),
            "keep-serving" | "keep_serving" | "serve" => Some(FailurePolicy::KeepServing),
            _ => None,
        }
    }
}

/// How a process decides that it was spawned by a restarting parent.
///
/// Neither check is authenticated. Process lineage is a heuristic and any
/// process running the same executable under the same user can impersonate
/// a parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineageCheck {
    /// The parent's executable name equals the base name of `argv[0]`.
    #[default]
    ExecutableName,
    /// The parent exported [`PARENT_PID_ENV`] and it matches `getppid()`.
    Environment,
}

impl LineageCheck {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "executable" | "exe" | "name" => Some(LineageCheck::ExecutableName),
            "environment" | "env" => Some(LineageCheck::Environment),
            _ => None,
        }
    }
}

/// Configuration for a [`RestartableListener`](crate::RestartableListener).
#[derive(Debug, Clone)]
pub struct RestartConfig {
    /// Signal that requests a restart.
    pub restart_signal: i32,
    /// Signal a child sends its parent once the listener is ready.
    pub handshake_signal: i32,
    /// Signal that requests a graceful shutdown without restart.
    pub terminate_signal: Option<i32>,
    /// How long the parent waits for the handshake.
    pub fork_timeout: Duration,
    /// Descriptor slot used to pass the listening socket.
    pub inherited_fd: RawFd,
    /// Command line flag that asks the process to detach into the background.
    pub daemon_flag: String,
    /// Behaviour after a failed restart attempt.
    pub failure_policy: FailurePolicy,
    /// How a child recognises its parent.
    pub lineage: LineageCheck,
    /// Terminate the process with status 0 once draining finishes.
    pub exit_process: bool,
    /// Name attached to every log record of the listener.
    pub label: String,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            restart_signal: libc::SIGHUP,
            handshake_signal: libc::SIGUSR2,
            terminate_signal: None,
            fork_timeout: DEFAULT_FORK_TIMEOUT,
            inherited_fd: DEFAULT_INHERITED_FD,
            daemon_flag: "daemon".to_string(),
            failure_policy: FailurePolicy::default(),
            lineage: LineageCheck::default(),
            exit_process: true,
            label: "listener".to_string(),
        }
    }
}

impl RestartConfig {
    /// Create a configuration with defaults overridden from `MOLT_*` env vars.
    ///
    /// Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(secs) = env_parsed("MOLT_FORK_TIMEOUT_SECS", |v| v.parse::<u64>().ok()) {
            config.fork_timeout = Duration::from_secs(secs);
        }
        if let Some(fd) = env_parsed("MOLT_INHERITED_FD", |v| {
            v.parse::<RawFd>().ok().filter(|fd| *fd > 2)
        }) {
            config.inherited_fd = fd;
        }
        if let Some(sig) = env_parsed("MOLT_RESTART_SIGNAL", parse_signal) {
            config.restart_signal = sig;
        }
        if let Some(sig) = env_parsed("MOLT_HANDSHAKE_SIGNAL", parse_signal) {
            config.handshake_signal = sig;
        }
        if let Some(policy) = env_parsed("MOLT_FAILURE_POLICY", FailurePolicy::parse) {
            config.failure_policy = policy;
        }
        if let Some(lineage) = env_parsed("MOLT_LINEAGE", LineageCheck::parse) {
            config.lineage = lineage;
        }

        config
    }

    pub fn with_fork_timeout(mut self, timeout: Duration) -> Self {
        self.fork_timeout = timeout;
        self
    }

    pub fn with_restart_signal(mut self, signal: i32) -> Self {
        self.restart_signal = signal;
        self
    }

    pub fn with_handshake_signal(mut self, signal: i32) -> Self {
        self.handshake_signal = signal;
        self
    }

    pub fn with_terminate_signal(mut self, signal: Option<i32>) -> Self {
        self.terminate_signal = signal;
        self
    }

    pub fn with_inherited_fd(mut self, fd: RawFd) -> Self {
        self.inherited_fd = fd;
        self
    }

    pub fn with_daemon_flag(mut self, flag: impl Into<String>) -> Self {
        self.daemon_flag = flag.into();
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_lineage(mut self, lineage: LineageCheck) -> Self {
        self.lineage = lineage;
        self
    }

    /// Keep the process alive after draining; `wait_exited()` resolves instead.
    pub fn with_exit_process(mut self, exit: bool) -> Self {
        self.exit_process = exit;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

fn env_parsed<T>(key: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    let parsed = parse(raw.trim());
    if parsed.is_none() {
        warn!(key, value = %raw, "Ignoring unparsable configuration value");
    }
    parsed
}

/// Parse a signal given as a number (`12`) or a name (`SIGUSR2`, `usr2`).
pub fn parse_signal(s: &str) -> Option<i32> {
    if let Ok(n) = s.parse::<i32>() {
        return (n > 0).then_some(n);
    }

    let upper = s.to_uppercase();
    let name = upper.strip_prefix("SIG").unwrap_or(&upper);
    let sig = match name {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "TERM" => libc::SIGTERM,
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        "WINCH" => libc::SIGWINCH,
        _ => return None,
    };
    Some(sig)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RestartConfig::default();
        assert_eq!(config.restart_signal, libc::SIGHUP);
        assert_eq!(config.handshake_signal, libc::SIGUSR2);
        assert_eq!(config.terminate_signal, None);
        assert_eq!(config.fork_timeout, Duration::from_secs(10));
        assert_eq!(config.inherited_fd, 3);
        assert_eq!(config.daemon_flag, "daemon");
        assert_eq!(config.failure_policy, FailurePolicy::Drain);
        assert_eq!(config.lineage, LineageCheck::ExecutableName);
        assert!(config.exit_process);
    }

    #[test]
    fn test_parse_signal() {
        assert_eq!(parse_signal("SIGHUP"), Some(libc::SIGHUP));
        assert_eq!(parse_signal("usr2"), Some(libc::SIGUSR2));
        assert_eq!(parse_signal("Term"), Some(libc::SIGTERM));
        assert_eq!(parse_signal("12"), Some(12));
        assert_eq!(parse_signal("0"), None);
        assert_eq!(parse_signal("SIGBOGUS"), None);
    }

    #[test]
    fn test_policy_and_lineage_parsing() {
        assert_eq!(FailurePolicy::parse("keep-serving"), Some(FailurePolicy::KeepServing));
        assert_eq!(FailurePolicy::parse("DRAIN"), Some(FailurePolicy::Drain));
        assert_eq!(FailurePolicy::parse("later"), None);
        assert_eq!(LineageCheck::parse("env"), Some(LineageCheck::Environment));
        assert_eq!(LineageCheck::parse("executable"), Some(LineageCheck::ExecutableName));
    }

    #[test]
    fn test_builder_overrides() {
        let config = RestartConfig::default()
            .with_fork_timeout(Duration::from_millis(250))
            .with_inherited_fd(7)
            .with_failure_policy(FailurePolicy::KeepServing)
            .with_exit_process(false)
            .with_label("http");
        assert_eq!(config.fork_timeout, Duration::from_millis(250));
        assert_eq!(config.inherited_fd, 7);
        assert_eq!(config.failure_policy, FailurePolicy::KeepServing);
        assert!(!config.exit_process);
        assert_eq!(config.label, "http");
    }

    #[test]
    fn test_from_env_default() {
        std::env::remove_var("MOLT_FORK_TIMEOUT_SECS");
        let config = RestartConfig::from_env();
        assert_eq!(config.fork_timeout, DEFAULT_FORK_TIMEOUT);
    }
}
