//! Listener inheritance from a well-known descriptor slot.
//!
//! A restarting parent places its listening socket in a fixed slot (fd 3 by
//! default) before exec'ing the child. The child adopts the slot when it holds
//! a listening stream socket bound to the requested address, and binds a fresh
//! socket otherwise. A slot that does not qualify is left untouched.

use crate::address::listener_matches;
use crate::error::{Error, Result};
use std::mem::MaybeUninit;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::sync::Mutex;
use tracing::{debug, info};

/// Slots already adopted by this process. A slot is claimed at most once.
static CLAIMED_SLOTS: Mutex<Vec<RawFd>> = Mutex::new(Vec::new());

/// Where the listening socket came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerOrigin {
    /// Adopted from the inherited descriptor slot.
    Inherited(RawFd),
    /// Freshly bound by this process.
    Bound,
}

/// Adopt the listener in `slot` if it serves `requested`, otherwise bind.
pub fn inherit_or_bind(requested: SocketAddr, slot: RawFd) -> Result<(TcpListener, ListenerOrigin)> {
    if let Some(listener) = try_inherit(requested, slot) {
        return Ok((listener, ListenerOrigin::Inherited(slot)));
    }

    let listener = TcpListener::bind(requested).map_err(|source| Error::Bind {
        addr: requested,
        source,
    })?;
    debug!(addr = %requested, "Bound fresh listener");
    Ok((listener, ListenerOrigin::Bound))
}

fn try_inherit(requested: SocketAddr, slot: RawFd) -> Option<TcpListener> {
    let mut claimed = CLAIMED_SLOTS.lock().unwrap_or_else(|e| e.into_inner());
    if claimed.contains(&slot) {
        return None;
    }

    if !is_socket(slot) || !is_listening_stream(slot) {
        return None;
    }

    // SAFETY: the slot holds a listening stream socket (checked above). On
    // mismatch ownership is released again without closing it.
    let listener = unsafe { TcpListener::from_raw_fd(slot) };
    let bound = match listener.local_addr() {
        Ok(addr) => addr,
        Err(_) => {
            let _ = listener.into_raw_fd();
            return None;
        }
    };

    if !listener_matches(requested, bound) {
        debug!(fd = slot, bound = %bound, requested = %requested, "Inherited socket does not match listen address");
        let _ = listener.into_raw_fd();
        return None;
    }

    // The slot reaches later children only through an explicit handoff.
    if let Err(e) = set_cloexec(slot, true) {
        debug!(fd = slot, error = %e, "Failed to set FD_CLOEXEC on inherited listener");
    }

    claimed.push(slot);
    info!(fd = slot, addr = %bound, "Inherited listener from parent process");
    Some(listener)
}

/// Whether `fd` is open and refers to a socket.
pub(crate) fn is_socket(fd: RawFd) -> bool {
    let mut stat = MaybeUninit::<libc::stat>::uninit();
    if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } != 0 {
        return false;
    }
    // SAFETY: fstat succeeded and filled the buffer.
    let mode = unsafe { stat.assume_init() }.st_mode;
    mode & libc::S_IFMT == libc::S_IFSOCK
}

/// Whether `fd` is a `SOCK_STREAM` socket in listening state.
fn is_listening_stream(fd: RawFd) -> bool {
    sockopt_int(fd, libc::SO_TYPE) == Some(libc::SOCK_STREAM)
        && sockopt_int(fd, libc::SO_ACCEPTCONN) == Some(1)
}

fn sockopt_int(fd: RawFd, option: libc::c_int) -> Option<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &mut value as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    (result == 0).then_some(value)
}

/// Set or clear `FD_CLOEXEC` on `fd`.
pub(crate) fn set_cloexec(fd: RawFd, on: bool) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let flags = if on {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
