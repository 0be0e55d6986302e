//! Command line and environment configuration for molt-echo.

use clap::{ArgAction, Parser};
use molt::RestartConfig;
use std::time::Duration;

use crate::telemetry::LogFormat;

/// Default listen address.
pub const DEFAULT_ADDR: &str = "127.0.0.1:9001";

/// molt-echo - line echo server that restarts without dropping connections
///
/// Send SIGHUP to hand the listener to a fresh copy of the binary, or
/// SIGTERM to stop accepting and exit once every client has disconnected.
#[derive(Debug, Parser)]
#[command(name = "molt-echo")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address to listen on (host:port, empty host means all interfaces)
    #[arg(short, long, env = "MOLT_ECHO_ADDR", default_value = DEFAULT_ADDR)]
    pub addr: String,

    /// Detach into the background and exit once the daemon is serving
    /// (`--daemon` or `--daemon=<bool>`; the single-dash `-daemon` form is
    /// not accepted by this binary)
    #[arg(
        long,
        num_args = 0..=1,
        require_equals = true,
        default_value = "false",
        default_missing_value = "true",
        action = ArgAction::Set,
        value_parser = parse_daemon
    )]
    pub daemon: bool,

    /// Log output format
    #[arg(long, env = "MOLT_ECHO_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Seconds to wait for a restarted process to take over the listener
    /// (overrides MOLT_FORK_TIMEOUT_SECS)
    #[arg(long)]
    pub fork_timeout_secs: Option<u64>,
}

impl Cli {
    /// Restart settings: `MOLT_*` environment first, then command line overrides.
    pub fn restart_config(&self) -> RestartConfig {
        let mut config = RestartConfig::from_env()
            .with_terminate_signal(Some(libc::SIGTERM))
            .with_label("echo");

        if let Some(secs) = self.fork_timeout_secs {
            config = config.with_fork_timeout(Duration::from_secs(secs));
        }

        config
    }
}

/// Same boolean forms the restart library recognises for the daemon flag.
fn parse_daemon(value: &str) -> Result<bool, String> {
    molt::parse_flag_bool(value).ok_or_else(|| format!("expected true or false, got `{value}`"))
}
