//! Where version sources come from.

use std::path::Path;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::FetchError;

/// Network and source-control access used by the repository.
#[async_trait]
pub trait VersionSource: Send + Sync + 'static {
    /// Downloads `url` into `dest`, returning the number of bytes written.
    async fn download(&self, url: &str, dest: &Path) -> Result<u64, FetchError>;

    /// Clones the remote into `target`.
    async fn clone_repository(&self, target: &Path, log: &Path) -> Result<(), FetchError>;

    /// Creates a local branch tracking `origin/<branch>` in `checkout`.
    async fn checkout_branch(
        &self,
        checkout: &Path,
        branch: &str,
        log: &Path,
    ) -> Result<(), FetchError>;

    /// Pulls the latest changes into `checkout`.
    async fn pull(&self, checkout: &Path, log: &Path) -> Result<(), FetchError>;
}

/// Fetches releases over HTTP and branches with the `git` binary.
#[derive(Clone, Debug)]
pub struct RemoteSource {
    client: reqwest::Client,
    git_url: String,
}

impl RemoteSource {
    /// Creates a source cloning from `git_url`.
    #[must_use]
    pub fn new(git_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            git_url: git_url.into(),
        }
    }

    async fn git(&self, dir: Option<&Path>, args: &[&str], log: &Path) -> Result<(), FetchError> {
        let log_file = open_log(log).await?;
        let stderr = log_file
            .try_clone()
            .await
            .map_err(|e| FetchError::Io("failed to open git log", e))?;

        let mut cmd = Command::new("git");
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(log_file.into_std().await)
            .stderr(stderr.into_std().await);

        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }

        debug!("running git {}", args.join(" "));

        let status = cmd
            .status()
            .await
            .map_err(|e| FetchError::Io("failed to run git", e))?;

        check_status(args, status, log)
    }
}

#[async_trait]
impl VersionSource for RemoteSource {
    async fn download(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let transport = |source: reqwest::Error| FetchError::Transport {
            url: url.to_string(),
            source,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(transport)?;

        let total = response.content_length();
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| FetchError::Io("failed to create download file", e))?;

        info!("downloading {url}");

        let mut written: u64 = 0;
        let mut last_decile = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(transport)?;
            file.write_all(&chunk)
                .await
                .map_err(|e| FetchError::Io("failed to write download file", e))?;
            written += chunk.len() as u64;

            if let Some(total) = total
                && total > 0
            {
                let decile = written * 10 / total;
                if decile > last_decile {
                    last_decile = decile;
                    info!(bytes = written, total, "downloaded {}%", decile * 10);
                }
            }
        }

        file.flush()
            .await
            .map_err(|e| FetchError::Io("failed to flush download file", e))?;

        info!(bytes = written, "download of {url} complete");

        Ok(written)
    }

    async fn clone_repository(&self, target: &Path, log: &Path) -> Result<(), FetchError> {
        info!("cloning {} to {}", self.git_url, target.display());

        let target = target.to_string_lossy();
        self.git(None, &["clone", &self.git_url, &target], log).await
    }

    async fn checkout_branch(
        &self,
        checkout: &Path,
        branch: &str,
        log: &Path,
    ) -> Result<(), FetchError> {
        info!("checking out branch {branch}");

        let upstream = format!("origin/{branch}");
        self.git(Some(checkout), &["checkout", "-b", branch, &upstream], log)
            .await
    }

    async fn pull(&self, checkout: &Path, log: &Path) -> Result<(), FetchError> {
        info!("pulling latest changes into {}", checkout.display());

        self.git(Some(checkout), &["pull"], log).await
    }
}

async fn open_log(log: &Path) -> Result<tokio::fs::File, FetchError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(log)
        .await
        .map_err(|e| FetchError::Io("failed to open git log", e))
}

fn check_status(args: &[&str], status: ExitStatus, log: &Path) -> Result<(), FetchError> {
    if status.success() {
        Ok(())
    } else {
        Err(FetchError::Git {
            command: args.join(" "),
            status,
            log: log.to_path_buf(),
        })
    }
}
