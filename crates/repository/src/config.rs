use std::path::{Path, PathBuf};

/// Default archive holding release source tarballs.
pub const DEFAULT_ARCHIVE_URL: &str = "https://archive.apache.org/dist/cassandra";

/// Default source-control remote for development branches.
pub const DEFAULT_GIT_URL: &str = "https://github.com/apache/cassandra.git";

/// Branch checked out by a fresh clone.
pub const DEFAULT_BRANCH: &str = "trunk";

/// Configuration for a `VersionRepository`.
#[derive(Clone, Debug)]
pub struct RepositoryConfig {
    /// Base url of the release archive.
    pub archive_url: String,

    /// Branch a fresh clone starts on.
    pub default_branch: String,

    /// Remote to clone development branches from.
    pub git_url: String,

    /// Directory holding every cached version.
    pub root: PathBuf,
}

impl RepositoryConfig {
    /// Creates a configuration caching versions under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            archive_url: DEFAULT_ARCHIVE_URL.to_string(),
            default_branch: DEFAULT_BRANCH.to_string(),
            git_url: DEFAULT_GIT_URL.to_string(),
            root: root.into(),
        }
    }

    /// Sets the release archive base url.
    #[must_use]
    pub fn with_archive_url(mut self, url: impl Into<String>) -> Self {
        self.archive_url = url.into();
        self
    }

    /// Sets the default branch name.
    #[must_use]
    pub fn with_default_branch(mut self, branch: impl Into<String>) -> Self {
        self.default_branch = branch.into();
        self
    }

    /// Sets the git remote.
    #[must_use]
    pub fn with_git_url(mut self, url: impl Into<String>) -> Self {
        self.git_url = url.into();
        self
    }

    /// Download url of the source tarball for a release.
    ///
    /// Releases are grouped by the part of the identifier before the first
    /// dash, so `1.0.0-beta1` lives under `1.0.0/`.
    #[must_use]
    pub fn release_url(&self, version: &str) -> String {
        let base = version.split('-').next().unwrap_or(version);
        format!(
            "{}/{base}/apache-cassandra-{version}-src.tar.gz",
            self.archive_url.trim_end_matches('/')
        )
    }

    /// Log file receiving build output.
    #[must_use]
    pub fn build_log(&self) -> PathBuf {
        self.root.join("last.log")
    }

    /// Log file receiving git output.
    #[must_use]
    pub fn development_log(&self) -> PathBuf {
        self.root.join("last_development.log")
    }

    /// The cache root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}
