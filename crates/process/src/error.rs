//! Error types for process supervision.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Result type for process supervision.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while supervising a child process.
#[derive(Debug, Error)]
pub enum Error {
    /// The process exited before printing its ready marker.
    #[error("{name} exited with {status} before becoming ready; stderr:\n{}", .stderr.join("\n"))]
    ExitedBeforeReady {
        /// Name of the application.
        name: String,
        /// Exit status reported by the operating system.
        status: ExitStatus,
        /// Captured standard error output.
        stderr: Vec<String>,
    },

    /// The pid cannot be addressed by signals.
    #[error("invalid pid: {0}")]
    InvalidPid(u32),

    /// IO error.
    #[error("io error: {0} - {1}")]
    Io(&'static str, #[source] io::Error),

    /// No ready marker appeared within the readiness timeout.
    #[error("{name} did not become ready within {timeout:?}; stderr:\n{}", .stderr.join("\n"))]
    ReadyTimeout {
        /// Name of the application.
        name: String,
        /// The timeout that elapsed.
        timeout: Duration,
        /// Captured standard error output.
        stderr: Vec<String>,
    },

    /// Failed to deliver a signal.
    #[error("failed to send {signal} to pid {pid}: {source}")]
    Signal {
        /// Target pid.
        pid: u32,
        /// Signal name.
        signal: &'static str,
        /// Underlying errno.
        #[source]
        source: nix::Error,
    },

    /// Failed to spawn a process.
    #[error("failed to spawn {executable}: {source}")]
    SpawnProcess {
        /// The executable that could not be launched.
        executable: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The process survived forced termination.
    #[error("pid {0} is still alive after SIGKILL")]
    StillAlive(u32),
}

impl Error {
    /// Returns the captured standard error output, if this error carries any.
    #[must_use]
    pub fn stderr(&self) -> &[String] {
        match self {
            Self::ExitedBeforeReady { stderr, .. } | Self::ReadyTimeout { stderr, .. } => stderr,
            _ => &[],
        }
    }
}
