//! The restartable listener and its control loop.
//!
//! ```text
//!            restart signal              handoff ok
//!  Serving ─────────────────▶ Restarting ───────────▶ Draining ──▶ Exited
//!     │  ▲                        │                      ▲
//!     │  └── failed, KeepServing ─┤                      │
//!     │                           └── failed, Drain ─────┤
//!     └── shutdown / terminate signal / fatal accept ────┘
//! ```
//!
//! `accept` only takes connections in `Serving`. During `Restarting` it waits,
//! so the child is the only process accepting while the handoff is in flight.
//! Leaving `Serving` for good closes the listener before the loop waits for
//! the connection counter to reach zero.

use crate::address;
use crate::config::{FailurePolicy, RestartConfig};
use crate::connection::DrainingConnection;
use crate::drain::ConnectionCounter;
use crate::error::{Error, Result};
use crate::io::{Connection, Listener};
use crate::listener::{inherit_or_bind, ListenerOrigin};
use crate::restart::{fork_and_handoff, RestartError};
use crate::role::{is_restart_child, notify_parent, ProcessRole};
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of a [`RestartableListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Accepting connections.
    Serving,
    /// A replacement process is being spawned.
    Restarting,
    /// The listener is closed; waiting for open connections to finish.
    Draining,
    /// Every connection finished.
    Exited,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerState::Serving => write!(f, "serving"),
            ListenerState::Restarting => write!(f, "restarting"),
            ListenerState::Draining => write!(f, "draining"),
            ListenerState::Exited => write!(f, "exited"),
        }
    }
}

/// Passes the listening socket to a replacement process.
#[async_trait]
pub(crate) trait Handoff: Send + Sync {
    async fn handoff(
        &self,
        fd: RawFd,
        config: &RestartConfig,
    ) -> std::result::Result<u32, RestartError>;
}

/// Spawns a copy of the current executable.
struct ProcessHandoff;

#[async_trait]
impl Handoff for ProcessHandoff {
    async fn handoff(
        &self,
        fd: RawFd,
        config: &RestartConfig,
    ) -> std::result::Result<u32, RestartError> {
        fork_and_handoff(fd, config, false).await
    }
}

/// State shared between the listener handle and its control loop.
struct Shared {
    listener: RwLock<Option<Arc<TcpListener>>>,
    closed: CancellationToken,
    shutdown: CancellationToken,
    restart: mpsc::Sender<()>,
    fatal: mpsc::Sender<io::Error>,
    connections: Arc<ConnectionCounter>,
    label: String,
}

impl Shared {
    fn current(&self) -> Option<Arc<TcpListener>> {
        self.listener
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Close the listener. In-flight accepts fail and release their handle.
    fn close(&self) {
        self.closed.cancel();
        let taken = self
            .listener
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if taken.is_some() {
            info!(label = %self.label, "Listener closed");
        }
    }

    fn report_fatal(&self, err: &io::Error) {
        // The first fatal error is enough to start draining.
        let _ = self.fatal.try_send(io::Error::new(err.kind(), err.to_string()));
    }
}

/// A TCP listener that survives binary upgrades.
///
/// Construction binds (or inherits) the socket and starts a background
/// control loop. On the restart signal the loop hands the socket to a fresh
/// copy of the executable, then drains: the listener is closed and the
/// process exits with status 0 once every [`DrainingConnection`] is closed.
///
/// Draining has no timeout. Bounding it is left to whoever supervises the
/// process (for example a hard kill after a grace period).
///
/// Dropping the handle requests a shutdown.
pub struct RestartableListener {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    origin: ListenerOrigin,
    state: watch::Receiver<ListenerState>,
}

impl RestartableListener {
    /// Bind or inherit a listener for `address` and start the control loop.
    ///
    /// If the command line carries the daemon flag, the socket is handed to a
    /// detached child and this process exits with status 0 once the child
    /// confirmed. If this process is itself a restart child it acknowledges
    /// the handoff to its parent before returning.
    pub async fn bind(address: &str, config: RestartConfig) -> Result<Self> {
        Self::bind_with(address, config, Arc::new(ProcessHandoff)).await
    }

    pub(crate) async fn bind_with(
        address: &str,
        config: RestartConfig,
        handoff: Arc<dyn Handoff>,
    ) -> Result<Self> {
        let requested = address::resolve(address)?;
        let (std_listener, origin) = inherit_or_bind(requested, config.inherited_fd)?;
        let bind_err = |source: io::Error| Error::Bind {
            addr: requested,
            source,
        };
        std_listener.set_nonblocking(true).map_err(bind_err)?;
        let listener = TcpListener::from_std(std_listener).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        let restart_signal = register(config.restart_signal)?;
        let terminate_signal = config.terminate_signal.map(register).transpose()?;

        info!(
            label = %config.label,
            addr = %local_addr,
            origin = ?origin,
            "Listener ready"
        );

        let mut handed_off = false;
        match ProcessRole::from_env(&config.daemon_flag) {
            ProcessRole::Daemon => {
                match fork_and_handoff(listener.as_raw_fd(), &config, true).await {
                    Ok(pid) => {
                        info!(label = %config.label, pid, "Detached into background process");
                        if config.exit_process {
                            std::process::exit(0);
                        }
                        handed_off = true;
                    }
                    Err(mut e) => {
                        error!(
                            label = %config.label,
                            error = %e.error,
                            "Failed to detach, serving in the foreground"
                        );
                        e.kill_child().await;
                    }
                }
            }
            ProcessRole::Server => {
                if is_restart_child(config.lineage) {
                    match notify_parent(config.handshake_signal) {
                        Ok(ppid) => info!(label = %config.label, ppid, "Confirmed handoff to parent"),
                        Err(e) => warn!(
                            label = %config.label,
                            error = %e,
                            "Failed to signal parent, it will time out"
                        ),
                    }
                }
            }
        }

        let (restart_tx, restart_rx) = mpsc::channel(1);
        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(ListenerState::Serving);

        let shared = Arc::new(Shared {
            listener: RwLock::new(Some(Arc::new(listener))),
            closed: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            restart: restart_tx,
            fatal: fatal_tx,
            connections: ConnectionCounter::new(),
            label: config.label.clone(),
        });

        let control = ControlLoop {
            shared: Arc::clone(&shared),
            config,
            handoff,
            restart_signal,
            terminate_signal,
            restart_requests: restart_rx,
            fatal: fatal_rx,
            state: state_tx,
        };
        tokio::spawn(control.run(handed_off));

        Ok(Self {
            shared,
            local_addr,
            origin,
            state: state_rx,
        })
    }

    /// Accept the next connection.
    ///
    /// Transient errors (aborted handshakes, descriptor exhaustion) are
    /// returned for the caller to retry. Any other error is returned as well
    /// and starts the drain. While a restart is in flight the call waits: it
    /// resumes if the loop goes back to serving and fails once draining
    /// starts. Once the listener is closed every call fails with
    /// [`io::ErrorKind::NotConnected`].
    pub async fn accept(&self) -> io::Result<DrainingConnection> {
        let result = self.accept_while_serving().await;

        match result {
            Ok((stream, peer)) => {
                let guard = self.shared.connections.register();
                if self.shared.closed.is_cancelled() || self.state() != ListenerState::Serving {
                    // Lost the race against a transition; never hand it out.
                    debug!(label = %self.shared.label, %peer, "Dropping connection accepted after leaving serving");
                    drop(guard);
                    return Err(closed_error());
                }
                debug!(label = %self.shared.label, %peer, "Accepted connection");
                Ok(DrainingConnection::new(stream, guard))
            }
            Err(e) => {
                if !is_transient(&e) {
                    self.shared.report_fatal(&e);
                }
                Err(e)
            }
        }
    }

    /// Accept on the socket only while the loop is `Serving`.
    async fn accept_while_serving(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let mut state = self.state.clone();
        loop {
            let current = *state.borrow_and_update();
            match current {
                ListenerState::Serving => {}
                ListenerState::Restarting => {
                    tokio::select! {
                        biased;
                        _ = self.shared.closed.cancelled() => return Err(closed_error()),
                        changed = state.changed() => {
                            if changed.is_err() {
                                return Err(closed_error());
                            }
                            continue;
                        }
                    }
                }
                ListenerState::Draining | ListenerState::Exited => return Err(closed_error()),
            }

            let Some(listener) = self.shared.current() else {
                return Err(closed_error());
            };

            tokio::select! {
                biased;
                _ = self.shared.closed.cancelled() => return Err(closed_error()),
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(closed_error());
                    }
                }
                result = listener.accept() => return result,
            }
        }
    }

    /// Close the listener.
    ///
    /// An accept blocked on the listener fails, which starts the drain.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Request a graceful shutdown: stop accepting, drain, exit.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    /// Request a restart as if the restart signal had arrived.
    pub fn restart(&self) {
        let _ = self.shared.restart.try_send(());
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the socket was inherited from a parent process.
    pub fn is_inherited(&self) -> bool {
        matches!(self.origin, ListenerOrigin::Inherited(_))
    }

    pub fn origin(&self) -> ListenerOrigin {
        self.origin
    }

    /// Number of accepted connections that have not been closed.
    pub fn active_connections(&self) -> usize {
        self.shared.connections.active()
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ListenerState> {
        self.state.clone()
    }

    /// Wait until the drain finished.
    ///
    /// With [`RestartConfig::exit_process`] set the process exits first and
    /// this never resolves.
    pub async fn wait_exited(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == ListenerState::Exited).await;
    }
}

impl Drop for RestartableListener {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl fmt::Debug for RestartableListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestartableListener")
            .field("label", &self.shared.label)
            .field("local_addr", &self.local_addr)
            .field("origin", &self.origin)
            .field("state", &self.state())
            .field("active_connections", &self.active_connections())
            .finish()
    }
}

#[async_trait]
impl Listener for RestartableListener {
    type Conn = DrainingConnection;

    async fn accept(&self) -> io::Result<DrainingConnection> {
        RestartableListener::accept(self).await
    }

    fn close(&self) {
        RestartableListener::close(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

#[async_trait]
impl Connection for DrainingConnection {
    async fn close(self) -> io::Result<()> {
        DrainingConnection::close(self).await
    }
}

/// Background task driving the listener's lifecycle.
struct ControlLoop {
    shared: Arc<Shared>,
    config: RestartConfig,
    handoff: Arc<dyn Handoff>,
    restart_signal: Signal,
    terminate_signal: Option<Signal>,
    restart_requests: mpsc::Receiver<()>,
    fatal: mpsc::Receiver<io::Error>,
    state: watch::Sender<ListenerState>,
}

impl ControlLoop {
    async fn run(mut self, handed_off: bool) {
        if !handed_off {
            self.serve().await;
        }
        self.drain().await;

        self.set_state(ListenerState::Exited);
        if self.config.exit_process {
            info!(label = %self.config.label, "Exiting");
            std::process::exit(0);
        }
    }

    /// Run until something moves the listener out of `Serving`.
    async fn serve(&mut self) {
        loop {
            tokio::select! {
                _ = self.restart_signal.recv() => {
                    info!(label = %self.config.label, signal = self.config.restart_signal, "Received restart signal");
                    if self.restart().await {
                        return;
                    }
                }
                Some(()) = self.restart_requests.recv() => {
                    info!(label = %self.config.label, "Restart requested");
                    if self.restart().await {
                        return;
                    }
                }
                Some(()) = recv_optional(&mut self.terminate_signal) => {
                    info!(label = %self.config.label, "Received terminate signal");
                    return;
                }
                _ = self.shared.shutdown.cancelled() => {
                    info!(label = %self.config.label, "Shutdown requested");
                    return;
                }
                Some(err) = self.fatal.recv() => {
                    warn!(label = %self.config.label, error = %err, "Accept failed, stopping");
                    return;
                }
            }
        }
    }

    /// One restart attempt. Returns `true` when the loop should drain.
    async fn restart(&mut self) -> bool {
        self.set_state(ListenerState::Restarting);

        let outcome = match self.shared.current() {
            // The Arc keeps the descriptor open while the child is spawned.
            Some(listener) => {
                self.handoff
                    .handoff(listener.as_raw_fd(), &self.config)
                    .await
            }
            None => Err(RestartError {
                error: Error::Descriptor(closed_error()),
                child: None,
            }),
        };

        match outcome {
            Ok(pid) => {
                info!(label = %self.config.label, pid, "Handoff complete, draining");
                true
            }
            Err(mut e) => {
                error!(label = %self.config.label, error = %e.error, "Restart failed");
                match self.config.failure_policy {
                    FailurePolicy::Drain => true,
                    FailurePolicy::KeepServing => {
                        e.kill_child().await;
                        if self.shared.current().is_none() {
                            return true;
                        }
                        self.set_state(ListenerState::Serving);
                        false
                    }
                }
            }
        }
    }

    async fn drain(&mut self) {
        self.set_state(ListenerState::Draining);
        self.shared.close();

        let active = self.shared.connections.active();
        info!(label = %self.config.label, active_connections = active, "Draining connections");
        self.shared.connections.wait_for_zero().await;
        info!(label = %self.config.label, "All connections drained");
    }

    fn set_state(&self, state: ListenerState) {
        let prev = self.state.send_replace(state);
        if prev != state {
            debug!(label = %self.config.label, from = %prev, to = %state, "State transition");
        }
    }
}

fn register(signum: i32) -> Result<Signal> {
    signal(SignalKind::from_raw(signum)).map_err(|source| Error::Signal {
        signal: signum,
        source,
    })
}

async fn recv_optional(signal: &mut Option<Signal>) -> Option<()> {
    match signal {
        Some(signal) => signal.recv().await,
        None => std::future::pending().await,
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "listener closed")
}

/// Whether an accept error is worth retrying.
pub fn is_transient(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM | libc::EPROTO)
    )
}
