//! Fork-and-handoff: spawn a replacement process that shares our listener.
//!
//! 1. Subscribes to the handshake signal (dropped again on every exit path)
//! 2. Spawns the current executable with the listening socket placed in the
//!    inherited descriptor slot and the daemon flag stripped
//! 3. Waits for whichever comes first: the child's handshake, the fork
//!    timeout, or the child exiting
//!
//! The listener is shared, never closed and rebound, so the address is bound
//! exactly once across both processes.

use crate::config::{RestartConfig, PARENT_PID_ENV};
use crate::error::{Error, Result};
use crate::listener::{set_cloexec, is_socket};
use crate::role::child_args;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

/// A failed handoff.
///
/// Carries the child when one was spawned, so the caller can decide whether
/// to leave it running or reclaim sole ownership of the listener.
#[derive(Debug, thiserror::Error)]
#[error("handoff failed: {error}")]
pub struct RestartError {
    #[source]
    pub error: Error,
    /// The spawned child, if spawning got that far.
    pub child: Option<Child>,
}

impl RestartError {
    fn before_spawn(error: Error) -> Self {
        Self { error, child: None }
    }

    /// Kill the child (if it is still running) and reap it.
    pub async fn kill_child(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(_)) => {}
            _ => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill unresponsive child");
                } else {
                    info!(pid = ?child.id(), "Killed unresponsive child");
                }
            }
        }
    }
}

/// Hand `listener_fd` to a freshly spawned copy of this executable.
///
/// With `detach` the child starts a new session and gets `/dev/null` as
/// stdin. Returns the child's pid once it confirmed the handoff.
pub async fn fork_and_handoff(
    listener_fd: RawFd,
    config: &RestartConfig,
    detach: bool,
) -> std::result::Result<u32, RestartError> {
    if !is_socket(listener_fd) {
        return Err(RestartError::before_spawn(Error::Descriptor(
            std::io::Error::from_raw_os_error(libc::EBADF),
        )));
    }

    // Subscribe before spawning so an early handshake is not missed.
    let mut handshake = signal(SignalKind::from_raw(config.handshake_signal)).map_err(|source| {
        RestartError::before_spawn(Error::Signal {
            signal: config.handshake_signal,
            source,
        })
    })?;

    let exe = std::env::current_exe().map_err(|e| RestartError::before_spawn(Error::Spawn(e)))?;
    let args = child_args(std::env::args_os().skip(1), &config.daemon_flag);
    let slot = config.inherited_fd;

    let mut command = Command::new(&exe);
    command
        .args(&args)
        .env(PARENT_PID_ENV, std::process::id().to_string())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    if detach {
        command.stdin(Stdio::null());
    }

    // SAFETY: the hook runs between fork and exec and only calls
    // async-signal-safe functions (dup2, fcntl, setsid).
    unsafe {
        command.pre_exec(move || {
            place_descriptor(listener_fd, slot)?;
            if detach && libc::setsid() < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    info!(
        exe = %exe.display(),
        fd = listener_fd,
        slot,
        detach,
        timeout_ms = config.fork_timeout.as_millis() as u64,
        "Spawning replacement process"
    );

    let mut child = command
        .spawn()
        .map_err(|e| RestartError::before_spawn(Error::Spawn(e)))?;
    let pid = child.id().unwrap_or_default();
    debug!(pid, "Waiting for handoff confirmation");

    let outcome = await_handshake(handshake.recv(), child.wait(), config.fork_timeout).await;
    drop(handshake);

    match outcome {
        Ok(()) => {
            info!(pid, "Child confirmed handoff");
            Ok(pid)
        }
        Err(error) => Err(RestartError {
            error,
            child: Some(child),
        }),
    }
}

/// Race the handshake against the timeout and the child's exit.
///
/// The first outcome wins; later handshakes are never observed. A closed
/// handshake stream or a failed wait on the child does not settle the race.
pub(crate) async fn await_handshake<H, W>(handshake: H, exited: W, timeout: Duration) -> Result<()>
where
    H: Future<Output = Option<()>>,
    W: Future<Output = std::io::Result<ExitStatus>>,
{
    let handshake = async {
        if handshake.await.is_none() {
            std::future::pending::<()>().await;
        }
    };
    let exited = async {
        match exited.await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Failed to wait on child");
                std::future::pending().await
            }
        }
    };

    tokio::select! {
        _ = handshake => Ok(()),
        _ = tokio::time::sleep(timeout) => Err(Error::ForkTimeout(timeout)),
        status = exited => Err(Error::ChildExited(status)),
    }
}

/// Put `fd` into `slot` for the exec'd image. Runs in the forked child.
fn place_descriptor(fd: RawFd, slot: RawFd) -> std::io::Result<()> {
    if fd == slot {
        // dup2 onto itself keeps FD_CLOEXEC, clear it explicitly.
        return set_cloexec(slot, false);
    }
    if unsafe { libc::dup2(fd, slot) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    fn never_exits() -> impl Future<Output = std::io::Result<ExitStatus>> {
        std::future::pending()
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_at_deadline() {
        let timeout = Duration::from_secs(10);
        let start = Instant::now();

        let result = await_handshake(std::future::pending(), never_exits(), timeout).await;

        assert!(matches!(result, Err(Error::ForkTimeout(t)) if t == timeout));
        let elapsed = start.elapsed();
        assert!(elapsed >= timeout, "timed out early after {elapsed:?}");
        assert!(elapsed < timeout + Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_before_timeout() {
        let start = Instant::now();
        let handshake = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Some(())
        };

        let result = await_handshake(handshake, never_exits(), Duration::from_secs(10)).await;

        assert!(result.is_ok());
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_handshakes_yield_one_success() {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        tx.send(()).unwrap();
        tx.send(()).unwrap();

        let result = await_handshake(rx.recv(), never_exits(), Duration::from_secs(10)).await;
        assert!(result.is_ok());

        // The second signal was never consumed by the race.
        assert_eq!(rx.try_recv(), Ok(()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_handshake_stream_is_not_success() {
        let result = await_handshake(
            async { None },
            never_exits(),
            Duration::from_millis(500),
        )
        .await;
        assert!(matches!(result, Err(Error::ForkTimeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_exit_short_circuits() {
        let start = Instant::now();
        let exited = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(ExitStatus::from_raw(1 << 8))
        };

        let result = await_handshake(std::future::pending(), exited, Duration::from_secs(10)).await;

        match result {
            Err(Error::ChildExited(status)) => assert_eq!(status.code(), Some(1)),
            other => panic!("expected ChildExited, got {other:?}"),
        }
        assert_eq!(start.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_wait_does_not_settle_race() {
        let exited = async { Err(std::io::Error::from(std::io::ErrorKind::Other)) };
        let result = await_handshake(std::future::pending(), exited, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::ForkTimeout(_))));
    }

    #[test]
    fn test_restart_error_reports_cause() {
        use std::error::Error as _;

        let err = RestartError::before_spawn(Error::ForkTimeout(Duration::from_secs(10)));
        assert!(err.to_string().starts_with("handoff failed: forking timeout"));
        assert!(err.source().is_some());
    }

    #[tokio::test]
    async fn test_closed_descriptor_is_rejected() {
        let config = RestartConfig::default();
        let err = fork_and_handoff(9999, &config, false).await.unwrap_err();
        assert!(matches!(err.error, Error::Descriptor(_)));
        assert!(err.child.is_none());
    }

    #[test]
    fn test_place_descriptor_into_slot() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&listener);
        let slot = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 300) };
        assert!(slot >= 300);

        // Same slot: only CLOEXEC is cleared.
        place_descriptor(slot, slot).unwrap();
        let flags = unsafe { libc::fcntl(slot, libc::F_GETFD) };
        assert_eq!(flags & libc::FD_CLOEXEC, 0);

        // Different slot: dup2 produces an inheritable copy. The target is a
        // descriptor we own so dup2 cannot clobber anything else.
        let target = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 300) };
        assert!(target >= 300 && target != slot);
        place_descriptor(fd, target).unwrap();
        assert!(is_socket(target));
        let flags = unsafe { libc::fcntl(target, libc::F_GETFD) };
        assert_eq!(flags & libc::FD_CLOEXEC, 0);

        unsafe {
            libc::close(slot);
            libc::close(target);
        }
    }
}
