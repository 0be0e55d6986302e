//! # molt
//!
//! Zero-downtime graceful restart for a process that owns a listening socket.
//!
//! ## Overview
//!
//! A restart replaces the running binary without dropping the listener:
//! 1. The old process spawns a fresh copy of its executable and passes the
//!    listening socket in a well-known descriptor slot (fd 3 by default)
//! 2. The new process adopts the socket without rebinding and signals its
//!    parent that it is ready
//! 3. The old process closes its copy of the listener and drains: it waits
//!    until every accepted connection is closed
//! 4. After the drain the old process exits with status 0
//!
//! If the child does not confirm within the fork timeout (10 s by default)
//! the restart fails and the configured [`FailurePolicy`] decides whether the
//! old process drains anyway or keeps serving.
//!
//! ## Signal Conventions
//!
//! - `SIGHUP`: restart request (configurable)
//! - `SIGUSR2`: handoff confirmation from child to parent (configurable)
//! - optional terminate signal: drain and exit without restart
//!
//! ## Command Line
//!
//! `--daemon` (flag name configurable, `-daemon` and `=true|false` forms are
//! accepted too) detaches: the process hands its
//! listener to a background child in a new session and exits with status 0.
//!
//! ## Example
//!
//! ```ignore
//! use molt::{RestartConfig, RestartableListener};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let listener = RestartableListener::bind("127.0.0.1:9001", RestartConfig::from_env()).await?;
//!     loop {
//!         let conn = match listener.accept().await {
//!             Ok(conn) => conn,
//!             Err(e) if molt::is_transient(&e) => continue,
//!             Err(_) => break,
//!         };
//!         tokio::spawn(async move {
//!             // serve, then:
//!             let _ = conn.close().await;
//!         });
//!     }
//!     listener.wait_exited().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("molt requires a Unix platform (Linux or macOS)");

mod address;
mod config;
mod connection;
mod drain;
mod error;
mod io;
mod listener;
mod restart;
mod restartable;
mod role;

pub use address::resolve;
pub use config::{
    parse_signal, FailurePolicy, LineageCheck, RestartConfig, DEFAULT_FORK_TIMEOUT,
    DEFAULT_INHERITED_FD, PARENT_PID_ENV,
};
pub use connection::DrainingConnection;
pub use error::{Error, Result};
pub use io::{Connection, Listener};
pub use listener::ListenerOrigin;
pub use restartable::{is_transient, ListenerState, RestartableListener};
pub use role::{parse_flag_bool, ProcessRole};
