use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::process::Command;
use tracing::debug;

/// The fixed build command run in a source tree.
#[async_trait]
pub trait BuildTool: Send + Sync + 'static {
    /// Builds the tree in `dir`, appending all output to `log`.
    async fn build(&self, dir: &Path, log: &Path) -> io::Result<ExitStatus>;
}

/// Runs `ant build`.
#[derive(Clone, Copy, Debug, Default)]
pub struct AntBuild;

#[async_trait]
impl BuildTool for AntBuild {
    async fn build(&self, dir: &Path, log: &Path) -> io::Result<ExitStatus> {
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log)
            .await?;
        let stderr = stdout.try_clone().await?;

        debug!("running ant build in {}", dir.display());

        Command::new("ant")
            .arg("build")
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(stdout.into_std().await)
            .stderr(stderr.into_std().await)
            .status()
            .await
    }
}
