//! Supervision primitives for long running child processes.
//!
//! This crate spawns a program with piped output, forwards every output line
//! to tracing, watches the output for a ready marker and reports how the
//! process ended. Liveness checks and termination work on a bare pid, so a
//! process started by an earlier invocation can still be stopped.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::{Path, PathBuf};
//! use std::time::Duration;
//!
//! use regex::Regex;
//! use ringmaster_process::{ManagedApplication, Result, Signal, spawn};
//!
//! struct Server {
//!     executable: PathBuf,
//! }
//!
//! impl ManagedApplication for Server {
//!     fn args(&self) -> Vec<String> {
//!         vec!["--foreground".to_string()]
//!     }
//!
//!     fn executable(&self) -> &Path {
//!         &self.executable
//!     }
//!
//!     fn name(&self) -> &str {
//!         "server"
//!     }
//!
//!     fn ready_pattern(&self) -> Option<Regex> {
//!         Regex::new("listening").ok()
//!     }
//! }
//!
//! async fn run() -> Result<()> {
//!     let process = spawn(Server {
//!         executable: PathBuf::from("/usr/local/bin/server"),
//!     })?;
//!
//!     process.wait_ready(Duration::from_secs(30)).await?;
//!
//!     process
//!         .shutdown(Signal::SIGTERM, Duration::from_secs(10))
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

use std::sync::Arc;

mod application;
mod error;
pub mod pid;
mod spawn;

pub use application::ManagedApplication;
pub use error::{Error, Result};
pub use nix::sys::signal::Signal;
pub use pid::Termination;
pub use spawn::{ManagedProcess, ProcessOptions, ProcessSpawner, ProcessState, spawn_process};

/// Spawns a supervised process for the given application.
///
/// # Errors
///
/// Returns an error if the process could not be spawned.
pub fn spawn<A: ManagedApplication>(application: A) -> Result<ManagedProcess> {
    let application: Arc<dyn ManagedApplication> = Arc::new(application);
    let options = ProcessOptions::for_application(application);

    ProcessSpawner::new(options).spawn()
}
