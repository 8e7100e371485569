use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::Signal;
use regex::Regex;
use tracing::{info, warn};

/// A program that can be launched and supervised as a child process.
///
/// Implementors describe the command line and environment; the spawner takes
/// care of piping output, readiness detection and exit monitoring.
pub trait ManagedApplication
where
    Self: Send + Sync + 'static,
{
    /// Arguments passed to the executable.
    fn args(&self) -> Vec<String>;

    /// Extra environment variables for the child.
    fn env(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Path of the executable to launch.
    fn executable(&self) -> &Path;

    /// Called for every line the process writes to stderr.
    fn handle_stderr(&self, line: &str) {
        warn!(process = self.name(), "{}", line);
    }

    /// Called for every line the process writes to stdout.
    fn handle_stdout(&self, line: &str) {
        info!(process = self.name(), "{}", line);
    }

    /// Human readable name, used in logs and errors.
    fn name(&self) -> &str;

    /// Pattern that marks the process as ready when it appears on stdout or
    /// stderr. `None` means readiness is judged by liveness alone.
    fn ready_pattern(&self) -> Option<Regex> {
        None
    }

    /// Signal used to request a graceful shutdown.
    fn shutdown_signal(&self) -> Signal {
        Signal::SIGTERM
    }

    /// How long to wait after the shutdown signal before escalating to SIGKILL.
    fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    /// Working directory for the child.
    fn working_dir(&self) -> Option<PathBuf> {
        None
    }
}
