//! Process spawning and supervision.

use std::collections::{HashMap, VecDeque};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use parking_lot::Mutex;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::ManagedApplication;
use crate::error::{Error, Result};
use crate::pid::{self, Termination};

/// Number of stderr lines kept for error reports.
const STDERR_CAPACITY: usize = 500;

/// How long to wait for output readers to drain after the process exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Options for spawning a supervised process.
#[derive(Clone)]
pub struct ProcessOptions {
    /// Application receiving output callbacks.
    pub application: Option<Arc<dyn ManagedApplication>>,

    /// The arguments to pass to the executable.
    pub args: Vec<String>,

    /// Environment variables to set.
    pub env: HashMap<String, String>,

    /// The executable to run.
    pub executable: PathBuf,

    /// Name used in logs and errors.
    pub name: String,

    /// Pattern marking the process as ready.
    pub ready_pattern: Option<Regex>,

    /// The working directory for the process.
    pub working_dir: Option<PathBuf>,
}

impl std::fmt::Debug for ProcessOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessOptions")
            .field("application", &"Arc<dyn ManagedApplication>")
            .field("args", &self.args)
            .field("env", &self.env)
            .field("executable", &self.executable)
            .field("name", &self.name)
            .field("ready_pattern", &self.ready_pattern)
            .field("working_dir", &self.working_dir)
            .finish()
    }
}

impl ProcessOptions {
    /// Creates a new `ProcessOptions`.
    #[must_use]
    pub fn new<P: AsRef<Path>, A: AsRef<OsStr>>(
        executable: P,
        args: impl IntoIterator<Item = A>,
    ) -> Self {
        let executable = executable.as_ref().to_path_buf();
        let name = executable
            .file_name()
            .map_or_else(|| "process".to_string(), |n| n.to_string_lossy().to_string());

        Self {
            application: None,
            args: args
                .into_iter()
                .map(|a| a.as_ref().to_string_lossy().to_string())
                .collect(),
            env: HashMap::new(),
            executable,
            name,
            ready_pattern: None,
            working_dir: None,
        }
    }

    /// Builds options from everything an application describes about itself.
    #[must_use]
    pub fn for_application(application: Arc<dyn ManagedApplication>) -> Self {
        let mut options = Self::new(application.executable(), application.args());
        options.name = application.name().to_string();
        options.ready_pattern = application.ready_pattern();
        options.working_dir = application.working_dir();
        for (key, value) in application.env() {
            options.env.insert(key, value);
        }
        options.application = Some(application);
        options
    }

    /// Sets the working directory for the process.
    #[must_use]
    pub fn with_working_dir<P: AsRef<Path>>(mut self, working_dir: P) -> Self {
        self.working_dir = Some(working_dir.as_ref().to_path_buf());
        self
    }

    /// Sets an environment variable for the process.
    #[must_use]
    pub fn with_env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the pattern that marks the process as ready.
    #[must_use]
    pub fn with_ready_pattern(mut self, pattern: Regex) -> Self {
        self.ready_pattern = Some(pattern);
        self
    }
}

/// Lifecycle of a supervised process as observed from its output and exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    /// Spawned, ready marker not seen yet.
    Starting,

    /// Ready marker seen.
    Ready,

    /// The process has exited.
    Exited(ExitStatus),
}

/// Bounded buffer of the most recent stderr lines.
#[derive(Debug, Default)]
struct CapturedOutput {
    lines: Mutex<VecDeque<String>>,
}

impl CapturedOutput {
    fn push(&self, line: &str) {
        let mut lines = self.lines.lock();
        if lines.len() == STDERR_CAPACITY {
            lines.pop_front();
        }
        lines.push_back(line.to_string());
    }

    fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }
}

/// Represents a spawned, supervised process.
#[derive(Debug)]
pub struct ManagedProcess {
    /// Name used in logs and errors
    name: String,

    /// Process ID
    pid: u32,

    /// Whether a ready pattern is being watched for
    has_ready_pattern: bool,

    /// Latest observed state
    state: watch::Receiver<ProcessState>,

    /// Recent stderr output
    stderr: Arc<CapturedOutput>,

    /// Tracks output readers and the exit monitor
    task_tracker: TaskTracker,
}

impl ManagedProcess {
    /// Returns the process ID.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns the name of the process.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the latest observed state.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// Returns the captured stderr lines.
    #[must_use]
    pub fn stderr(&self) -> Vec<String> {
        self.stderr.snapshot()
    }

    /// Returns whether the process is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !matches!(self.state(), ProcessState::Exited(_)) && pid::is_alive(self.pid)
    }

    /// Waits until the ready marker shows up in the process output.
    ///
    /// Output is consumed as it is produced; nothing here polls. If no ready
    /// pattern was configured this only checks that the process has not
    /// already exited.
    ///
    /// # Errors
    ///
    /// Returns an error if the process exits first or the timeout elapses.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        if !self.has_ready_pattern {
            return self.ensure_not_exited().await;
        }

        let mut state = self.state.clone();
        // Copy the state out so the watch lock is not held across awaits
        let observed = tokio::time::timeout(
            timeout,
            state.wait_for(|s| !matches!(s, ProcessState::Starting)),
        )
        .await
        .map(|r| r.map(|s| *s));

        match observed {
            Err(_) => Err(Error::ReadyTimeout {
                name: self.name.clone(),
                timeout,
                stderr: self.stderr(),
            }),
            Ok(Ok(ProcessState::Exited(status))) => Err(self.exited_error(status).await),
            Ok(Ok(_)) => Ok(()),
            // The monitor never drops its sender before publishing the exit
            Ok(Err(_)) => self.ensure_not_exited().await,
        }
    }

    /// Gives the process a grace period to surface immediate launch errors.
    ///
    /// # Errors
    ///
    /// Returns an error if the process exits during the grace period.
    pub async fn settle(&self, grace: Duration) -> Result<()> {
        tokio::time::sleep(grace).await;
        self.ensure_not_exited().await
    }

    /// Waits for the process to exit.
    pub async fn wait(&self) -> Option<ExitStatus> {
        let mut state = self.state.clone();
        let current = state
            .wait_for(|s| matches!(s, ProcessState::Exited(_)))
            .await
            .ok()
            .map(|s| *s);

        match current {
            Some(ProcessState::Exited(status)) => Some(status),
            _ => None,
        }
    }

    /// Sends a signal to the process.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal could not be sent.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        pid::send_signal(self.pid, signal)
    }

    /// Stops the process, escalating to SIGKILL after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the process could not be stopped.
    pub async fn shutdown(&self, signal: Signal, timeout: Duration) -> Result<Termination> {
        info!("shutting down {} (pid {})", self.name, self.pid);

        let termination = pid::terminate(self.pid, signal, timeout).await?;
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, self.task_tracker.wait()).await;

        info!("{} shut down", self.name);
        Ok(termination)
    }

    async fn ensure_not_exited(&self) -> Result<()> {
        match self.state() {
            ProcessState::Exited(status) => Err(self.exited_error(status).await),
            _ => Ok(()),
        }
    }

    async fn exited_error(&self, status: ExitStatus) -> Error {
        // Let the readers pick up whatever the process wrote before dying
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, self.task_tracker.wait()).await;

        Error::ExitedBeforeReady {
            name: self.name.clone(),
            status,
            stderr: self.stderr(),
        }
    }
}

/// Spawns supervised processes.
#[derive(Debug)]
pub struct ProcessSpawner {
    /// Options for the process.
    pub options: ProcessOptions,
}

impl ProcessSpawner {
    /// Creates a new `ProcessSpawner`.
    #[must_use]
    pub const fn new(options: ProcessOptions) -> Self {
        Self { options }
    }

    /// Spawns the process and starts consuming its output.
    ///
    /// # Errors
    ///
    /// Returns an error if the process could not be spawned.
    pub fn spawn(&self) -> Result<ManagedProcess> {
        let options = self.options.clone();
        let task_tracker = TaskTracker::new();

        let mut cmd = Command::new(&options.executable);
        cmd.args(&options.args);

        if let Some(ref working_dir) = options.working_dir {
            cmd.current_dir(working_dir);
        }

        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        debug!("spawning process: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|source| Error::SpawnProcess {
            executable: options.executable.display().to_string(),
            source,
        })?;

        let pid = child.id().ok_or_else(|| {
            Error::Io(
                "no pid available for spawned process",
                std::io::Error::other("process exited immediately"),
            )
        })?;

        debug!("{} spawned with pid {}", options.name, pid);

        let (state_tx, state_rx) = watch::channel(ProcessState::Starting);
        let state_tx = Arc::new(state_tx);
        let stderr = Arc::new(CapturedOutput::default());

        if let Some(stdout) = child.stdout.take() {
            task_tracker.spawn(read_lines(
                stdout,
                Stream::Stdout,
                options.clone(),
                Arc::clone(&state_tx),
                None,
            ));
        }

        if let Some(err) = child.stderr.take() {
            task_tracker.spawn(read_lines(
                err,
                Stream::Stderr,
                options.clone(),
                Arc::clone(&state_tx),
                Some(Arc::clone(&stderr)),
            ));
        }

        let name = options.name.clone();
        task_tracker.spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    if status.success() {
                        info!("{} exited with status: {}", name, status);
                    } else {
                        error!("{} exited with non-zero status: {}", name, status);
                    }
                    state_tx.send_replace(ProcessState::Exited(status));
                }
                Err(err) => {
                    error!("failed to wait for {}: {}", name, err);
                }
            }
        });

        task_tracker.close();

        Ok(ManagedProcess {
            name: options.name.clone(),
            pid,
            has_ready_pattern: options.ready_pattern.is_some(),
            state: state_rx,
            stderr,
            task_tracker,
        })
    }
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

async fn read_lines<R>(
    reader: R,
    stream: Stream,
    options: ProcessOptions,
    state: Arc<watch::Sender<ProcessState>>,
    capture: Option<Arc<CapturedOutput>>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(ref capture) = capture {
            capture.push(&line);
        }

        match (&options.application, stream) {
            (Some(application), Stream::Stdout) => application.handle_stdout(&line),
            (Some(application), Stream::Stderr) => application.handle_stderr(&line),
            (None, Stream::Stdout) => info!(process = %options.name, "{}", line),
            (None, Stream::Stderr) => info!(process = %options.name, "stderr: {}", line),
        }

        if let Some(ref pattern) = options.ready_pattern
            && pattern.is_match(&line)
        {
            state.send_if_modified(|current| {
                if *current == ProcessState::Starting {
                    *current = ProcessState::Ready;
                    true
                } else {
                    false
                }
            });
        }
    }
}

/// Spawns a supervised process with the given options.
///
/// # Errors
///
/// Returns an error if the process could not be spawned.
pub fn spawn_process(options: ProcessOptions) -> Result<ManagedProcess> {
    ProcessSpawner::new(options).spawn()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> ProcessOptions {
        ProcessOptions::new("sh", ["-c", script])
    }

    #[tokio::test]
    async fn test_ready_marker_is_detected() {
        let options = shell("echo booting; echo 'listening for clients'; sleep 30")
            .with_ready_pattern(Regex::new("listening for clients").unwrap());
        let process = spawn_process(options).unwrap();

        process.wait_ready(Duration::from_secs(10)).await.unwrap();
        assert_eq!(process.state(), ProcessState::Ready);
        assert!(process.is_running());

        let termination = process
            .shutdown(Signal::SIGTERM, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(termination, Termination::Graceful);
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn test_exit_before_ready_reports_stderr() {
        let options = shell("echo 'Address already in use' >&2; exit 3")
            .with_ready_pattern(Regex::new("never printed").unwrap());
        let process = spawn_process(options).unwrap();

        let err = process
            .wait_ready(Duration::from_secs(10))
            .await
            .unwrap_err();

        match err {
            Error::ExitedBeforeReady { status, stderr, .. } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr, vec!["Address already in use".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_ready_timeout() {
        let options = shell("sleep 30").with_ready_pattern(Regex::new("ready").unwrap());
        let process = spawn_process(options).unwrap();

        let err = process
            .wait_ready(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReadyTimeout { .. }));

        process
            .shutdown(Signal::SIGKILL, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_settle_catches_immediate_failure() {
        let process = spawn_process(shell("echo boom >&2; exit 1")).unwrap();

        let err = process.settle(Duration::from_millis(500)).await.unwrap_err();
        assert_eq!(err.stderr(), ["boom".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let err =
            spawn_process(ProcessOptions::new("/nonexistent/launcher", ["-f"])).unwrap_err();
        assert!(matches!(err, Error::SpawnProcess { .. }));
    }
}
