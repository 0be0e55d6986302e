//! Process role detection.
//!
//! A process started with the daemon flag detaches: it hands its listener to a
//! background child and exits. Any other process serves. A serving process
//! whose parent runs the same executable was spawned by a restart and must
//! acknowledge the handoff with the handshake signal.

use crate::config::{LineageCheck, PARENT_PID_ENV};
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::debug;

/// Linux truncates process names (`comm`) to this many bytes.
const COMM_LEN: usize = 15;

/// What this process was started to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// Detach into a background child, then exit.
    Daemon,
    /// Serve in the foreground, possibly as a restart child.
    Server,
}

impl ProcessRole {
    /// Role requested on the current command line.
    pub fn from_env(flag: &str) -> Self {
        Self::from_args(std::env::args_os().skip(1), flag)
    }

    /// Role requested by `args` (program name excluded).
    ///
    /// Accepts `-flag`, `--flag` and `-flag=<bool>` / `--flag=<bool>`. The last
    /// occurrence wins. Scanning stops at a `--` terminator.
    pub fn from_args<I, S>(args: I, flag: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut daemon = false;
        for arg in args {
            let arg = arg.as_ref();
            if arg == "--" {
                break;
            }
            if let Some(value) = flag_value(arg, flag) {
                daemon = value;
            }
        }
        if daemon {
            ProcessRole::Daemon
        } else {
            ProcessRole::Server
        }
    }
}

/// Parse `arg` as an occurrence of the boolean `flag`.
fn flag_value(arg: &OsStr, flag: &str) -> Option<bool> {
    let arg = arg.to_str()?;
    let name = arg.strip_prefix("--").or_else(|| arg.strip_prefix('-'))?;
    match name.split_once('=') {
        None if name == flag => Some(true),
        Some((key, value)) if key == flag => parse_flag_bool(value),
        _ => None,
    }
}

/// Parse the value of a boolean command line flag (`true`, `f`, `1`, ...).
pub fn parse_flag_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Arguments for a spawned child: the current ones minus the daemon flag.
pub fn child_args<I, S>(args: I, flag: &str) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut out = Vec::new();
    let mut terminated = false;
    for arg in args {
        let arg = arg.as_ref();
        if !terminated {
            if arg == "--" {
                terminated = true;
            } else if flag_value(arg, flag).is_some() {
                continue;
            }
        }
        out.push(arg.to_os_string());
    }
    out
}

/// Whether this process was spawned by a restarting parent.
pub fn is_restart_child(lineage: LineageCheck) -> bool {
    let ppid = std::os::unix::process::parent_id();
    if ppid <= 1 {
        return false;
    }

    match lineage {
        LineageCheck::Environment => {
            marker_matches(std::env::var(PARENT_PID_ENV).ok().as_deref(), ppid)
        }
        LineageCheck::ExecutableName => {
            let Some(argv0) = std::env::args_os().next() else {
                return false;
            };
            let pid = Pid::from_u32(ppid);
            let mut system = System::new();
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[pid]),
                true,
                ProcessRefreshKind::nothing().with_exe(UpdateKind::OnlyIfNotSet),
            );
            let Some(parent) = system.process(pid) else {
                debug!(ppid, "Parent process not found");
                return false;
            };
            parent_matches(parent.exe(), parent.name(), &argv0)
        }
    }
}

/// Whether the pid a parent exported names our actual parent.
fn marker_matches(marker: Option<&str>, ppid: u32) -> bool {
    marker
        .and_then(|v| v.trim().parse::<u32>().ok())
        .is_some_and(|pid| pid == ppid)
}

/// Compare a parent's executable path or process name to our `argv[0]`.
fn parent_matches(parent_exe: Option<&Path>, parent_name: &OsStr, argv0: &OsStr) -> bool {
    let Some(base) = Path::new(argv0).file_name() else {
        return false;
    };

    if parent_exe.and_then(Path::file_name) == Some(base) {
        return true;
    }

    let name = parent_name.as_bytes();
    let base = base.as_bytes();
    !name.is_empty() && (name == base || (name.len() == COMM_LEN && base.starts_with(name)))
}

/// Send the handshake signal to the parent process.
pub fn notify_parent(signal: i32) -> std::io::Result<u32> {
    let ppid = std::os::unix::process::parent_id();
    if unsafe { libc::kill(ppid as libc::pid_t, signal) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(ppid)
}
