//! Pid-level liveness checks and termination.
//!
//! These work on a bare pid so that a process started by an earlier
//! invocation can still be inspected and stopped.

use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// How long to wait for the kernel to reap a process after SIGKILL.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// How a process ended up stopping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// The process exited after the graceful shutdown signal.
    Graceful,

    /// The process had to be killed.
    Forced,
}

fn to_pid(pid: u32) -> Result<Pid> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(Pid::from_raw(raw)),
        _ => Err(Error::InvalidPid(pid)),
    }
}

/// Returns whether a process with the given pid exists.
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid) = to_pid(pid) else {
        return false;
    };

    match signal::kill(pid, None) {
        // EPERM means the process exists but belongs to someone else
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Sends a signal to the given pid.
///
/// # Errors
///
/// Returns an error if the pid is invalid or the signal could not be delivered.
pub fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    signal::kill(to_pid(pid)?, signal).map_err(|source| Error::Signal {
        pid,
        signal: signal.as_str(),
        source,
    })
}

/// Polls until the process is gone or the timeout elapses.
///
/// Returns `true` if the process exited in time.
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;

    loop {
        if !is_alive(pid) {
            debug!("process {} no longer exists", pid);
            return true;
        }

        if Instant::now() >= deadline {
            return false;
        }

        tokio::time::sleep(CHECK_INTERVAL).await;
    }
}

/// Asks a process to stop with `signal`, escalating to SIGKILL after `timeout`.
///
/// # Errors
///
/// Returns an error if a signal could not be delivered or the process is
/// still alive after SIGKILL.
pub async fn terminate(pid: u32, signal: Signal, timeout: Duration) -> Result<Termination> {
    if signal != Signal::SIGKILL {
        match send_signal(pid, signal) {
            Ok(()) => {}
            Err(Error::Signal {
                source: Errno::ESRCH,
                ..
            }) => return Ok(Termination::Graceful),
            Err(e) => return Err(e),
        }

        if wait_for_exit(pid, timeout).await {
            return Ok(Termination::Graceful);
        }

        warn!("timeout waiting for pid {} to exit, killing...", pid);
    }

    kill(pid).await?;
    Ok(Termination::Forced)
}

async fn kill(pid: u32) -> Result<()> {
    match send_signal(pid, Signal::SIGKILL) {
        Ok(()) => {}
        Err(Error::Signal {
            source: Errno::ESRCH,
            ..
        }) => return Ok(()),
        Err(e) => return Err(e),
    }

    if wait_for_exit(pid, KILL_TIMEOUT).await {
        Ok(())
    } else {
        Err(Error::StillAlive(pid))
    }
}
