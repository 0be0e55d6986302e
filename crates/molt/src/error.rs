//! Error taxonomy for listener construction and restart attempts.

use std::process::ExitStatus;
use std::time::Duration;

/// Errors produced by [`RestartableListener`](crate::RestartableListener).
///
/// `Address` and `Bind` abort construction. The remaining variants describe a
/// failed restart attempt; the control loop logs them and applies the
/// configured [`FailurePolicy`](crate::FailurePolicy).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The listen address could not be parsed or resolved.
    #[error("invalid listen address '{address}': {reason}")]
    Address { address: String, reason: String },

    /// Binding a fresh listener failed (address in use, permission denied).
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The listening socket cannot be handed to a child process.
    #[error("listening socket cannot be passed to a child: {0}")]
    Descriptor(#[source] std::io::Error),

    /// The child did not confirm the handoff in time.
    #[error("forking timeout: child did not confirm handoff within {0:?}")]
    ForkTimeout(Duration),

    /// Launching the child process failed.
    #[error("failed to spawn child process: {0}")]
    Spawn(#[source] std::io::Error),

    /// The child exited before confirming the handoff.
    #[error("child exited before confirming handoff: {0}")]
    ChildExited(ExitStatus),

    /// A signal handler could not be installed.
    #[error("failed to register handler for signal {signal}: {source}")]
    Signal {
        signal: i32,
        #[source]
        source: std::io::Error,
    },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
