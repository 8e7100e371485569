use std::fs::File;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use flate2::read::GzDecoder;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::builder::{AntBuild, BuildTool};
use crate::config::RepositoryConfig;
use crate::error::{Error, FetchError, Result};
use crate::layout;
use crate::source::{RemoteSource, VersionSource};
use crate::version::{AuxiliaryTool, Origin, Version, VersionSpec, VersionStatus};

static BASE_VERSION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<property\s+name="base\.version"\s+value="([^"]+)""#)
        .expect("Invalid regex pattern")
});

/// Cache of downloaded and built database versions.
///
/// Every version lives in its own directory under the configured root.
/// Resolves of the same identifier are serialized; different identifiers
/// proceed independently. `clean` waits for every resolve in flight.
pub struct VersionRepository {
    build_tool: Arc<dyn BuildTool>,
    config: RepositoryConfig,
    gate: RwLock<()>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    source: Arc<dyn VersionSource>,
    statuses: DashMap<String, VersionStatus>,
}

impl std::fmt::Debug for VersionRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionRepository")
            .field("config", &self.config)
            .field("statuses", &self.statuses)
            .finish_non_exhaustive()
    }
}

impl VersionRepository {
    /// Creates a repository fetching from the network and building with ant.
    #[must_use]
    pub fn new(config: RepositoryConfig) -> Self {
        let source = Arc::new(RemoteSource::new(config.git_url.clone()));
        Self::with_tools(config, source, Arc::new(AntBuild))
    }

    /// Creates a repository with explicit fetch and build implementations.
    #[must_use]
    pub fn with_tools(
        config: RepositoryConfig,
        source: Arc<dyn VersionSource>,
        build_tool: Arc<dyn BuildTool>,
    ) -> Self {
        Self {
            build_tool,
            config,
            gate: RwLock::new(()),
            locks: DashMap::new(),
            source,
            statuses: DashMap::new(),
        }
    }

    /// The repository configuration.
    #[must_use]
    pub const fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    /// The cache root.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.config.root()
    }

    /// Directory a version is cached in, whether or not it exists yet.
    #[must_use]
    pub fn directory_for(&self, spec: &VersionSpec) -> PathBuf {
        self.root().join(spec.directory_name())
    }

    /// Last known build status of a version.
    #[must_use]
    pub fn status(&self, spec: &VersionSpec) -> VersionStatus {
        let key = spec.directory_name();
        if let Some(status) = self.statuses.get(&key) {
            return *status;
        }

        if layout::check_built(&self.root().join(&key)).is_ok() {
            VersionStatus::Ready
        } else {
            VersionStatus::Absent
        }
    }

    /// Returns a ready version, fetching and building it first if needed.
    ///
    /// A cached release is returned without any network or build work.
    /// A branch is always synchronized with its remote and rebuilt.
    ///
    /// # Errors
    ///
    /// Returns `Error::Fetch` if the sources could not be obtained and
    /// `Error::Build` if the main build failed.
    pub async fn resolve(&self, spec: &VersionSpec) -> Result<Version> {
        let key = spec.directory_name();
        check_identifier(&key)?;

        let _gate = self.gate.read().await;
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        tokio::fs::create_dir_all(self.root())
            .await
            .map_err(|e| Error::Io("failed to create repository root", e))?;

        let directory = self.root().join(&key);
        let result = match spec {
            VersionSpec::Release(id) => self.resolve_release(spec, id, &directory).await,
            VersionSpec::Branch(branch) => self.resolve_branch(spec, branch, &directory).await,
        };

        match result {
            Ok(auxiliary) => {
                self.statuses.insert(key, VersionStatus::Ready);
                Ok(Version {
                    auxiliary,
                    directory,
                    identifier: spec.identifier().to_string(),
                    origin: spec.origin(),
                })
            }
            Err(err) => {
                self.statuses.insert(key, VersionStatus::Failed);
                Err(err)
            }
        }
    }

    /// Checks that a cached directory is usable, discarding it otherwise.
    ///
    /// Returns `false` when the directory is missing or was discarded, so
    /// the next resolve fetches it again.
    ///
    /// # Errors
    ///
    /// Returns `Error::Argument` if `path` is not directly under the root.
    pub async fn validate(&self, path: &Path) -> Result<bool> {
        let key = self.managed_key(path).ok_or_else(|| {
            Error::Argument(format!(
                "{} is not a directory of the repository at {}",
                path.display(),
                self.root().display()
            ))
        })?;

        let _gate = self.gate.read().await;
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        if !path.exists() {
            return Ok(false);
        }

        match layout::check_built(path) {
            Ok(()) => Ok(true),
            Err(err) => {
                warn!("discarding invalid cached version {}: {err}", path.display());
                tokio::fs::remove_dir_all(path)
                    .await
                    .map_err(|e| Error::Io("failed to remove invalid version", e))?;
                self.statuses.insert(key, VersionStatus::Absent);
                Ok(false)
            }
        }
    }

    /// Returns the cached directory of a version if it validates.
    ///
    /// # Errors
    ///
    /// Returns an error if an invalid directory could not be removed.
    pub async fn version_directory(&self, spec: &VersionSpec) -> Result<Option<PathBuf>> {
        let directory = self.directory_for(spec);
        Ok(self.validate(&directory).await?.then_some(directory))
    }

    /// Reopens a version recorded earlier at `install_dir`.
    ///
    /// Directories owned by this repository are re-validated and fetched
    /// again if they no longer validate. Other directories are only checked
    /// for the expected layout.
    ///
    /// # Errors
    ///
    /// Returns an error if the version can no longer be made ready.
    pub async fn reopen(&self, spec: &VersionSpec, install_dir: &Path) -> Result<Version> {
        if self.managed_key(install_dir).is_none() {
            return local_version(install_dir).map(|version| Version {
                identifier: spec.identifier().to_string(),
                origin: spec.origin(),
                ..version
            });
        }

        if self.validate(install_dir).await? && install_dir == self.directory_for(spec) {
            return Ok(Version {
                auxiliary: layout::read_marker(install_dir)?,
                directory: install_dir.to_path_buf(),
                identifier: spec.identifier().to_string(),
                origin: spec.origin(),
            });
        }

        info!("{} is no longer valid, fetching {spec} again", install_dir.display());
        self.resolve(spec).await
    }

    /// Removes every cached version, once resolves in flight have finished.
    ///
    /// # Errors
    ///
    /// Returns an error if the root could not be removed.
    pub async fn clean(&self) -> Result<()> {
        let _gate = self.gate.write().await;

        if tokio::fs::try_exists(self.root()).await.unwrap_or(false) {
            info!("removing repository at {}", self.root().display());
            tokio::fs::remove_dir_all(self.root())
                .await
                .map_err(|e| Error::Io("failed to remove repository root", e))?;
        }

        self.statuses.clear();
        Ok(())
    }

    async fn resolve_release(
        &self,
        spec: &VersionSpec,
        id: &str,
        directory: &Path,
    ) -> Result<AuxiliaryTool> {
        if layout::check_built(directory).is_ok() {
            debug!("{id} already cached at {}", directory.display());
            return layout::read_marker(directory);
        }

        let key = spec.directory_name();
        self.statuses.insert(key.clone(), VersionStatus::Downloading);

        let fetch = |source: FetchError| Error::Fetch {
            version: id.to_string(),
            source,
        };

        let archive = tempfile::Builder::new()
            .prefix("ringmaster-")
            .suffix(".tar.gz")
            .tempfile_in(self.root())
            .map_err(|e| Error::Io("failed to create download file", e))?;

        let url = self.config.release_url(id);
        self.source
            .download(&url, archive.path())
            .await
            .map_err(fetch)?;

        let staging = tempfile::Builder::new()
            .prefix(".ringmaster-extract-")
            .tempdir_in(self.root())
            .map_err(|e| Error::Io("failed to create extraction directory", e))?;

        info!("extracting {}", archive.path().display());
        let archive_path = archive.path().to_path_buf();
        let staging_path = staging.path().to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || extract(&archive_path, &staging_path))
            .await
            .map_err(|e| Error::Io("extraction task failed", std::io::Error::other(e)))?
            .map_err(fetch)?;

        if tokio::fs::try_exists(directory).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(directory)
                .await
                .map_err(|e| Error::Io("failed to remove previous attempt", e))?;
        }

        tokio::fs::rename(&extracted, directory)
            .await
            .map_err(|e| Error::Io("failed to move extracted sources", e))?;

        if let Err(err) = layout::check(directory) {
            let _ = tokio::fs::remove_dir_all(directory).await;
            return Err(fetch(FetchError::Layout(err.to_string())));
        }

        self.build(spec, directory).await
    }

    async fn resolve_branch(
        &self,
        spec: &VersionSpec,
        branch: &str,
        directory: &Path,
    ) -> Result<AuxiliaryTool> {
        self.statuses
            .insert(spec.directory_name(), VersionStatus::Downloading);

        let log = self.config.development_log();
        let fetch = |source: FetchError| Error::Fetch {
            version: branch.to_string(),
            source,
        };

        if layout::read_checkout(directory).await.as_deref() != Some(branch) {
            if tokio::fs::try_exists(directory).await.unwrap_or(false) {
                warn!(
                    "{} holds no complete checkout of {branch}, cloning again",
                    directory.display()
                );
                tokio::fs::remove_dir_all(directory)
                    .await
                    .map_err(|e| Error::Io("failed to remove incomplete clone", e))?;
            }

            if let Err(err) = self.source.clone_repository(directory, &log).await {
                let _ = tokio::fs::remove_dir_all(directory).await;
                return Err(fetch(err));
            }

            if branch != self.config.default_branch
                && let Err(err) = self.source.checkout_branch(directory, branch, &log).await
            {
                warn!("branch {branch} could not be checked out, discarding clone");
                let _ = tokio::fs::remove_dir_all(directory).await;
                return Err(fetch(err));
            }

            layout::write_checkout(directory, branch).await?;
        }

        self.source.pull(directory, &log).await.map_err(fetch)?;

        layout::check(directory).map_err(|err| fetch(FetchError::Layout(err.to_string())))?;

        // A rebuild is always required after a pull
        match tokio::fs::remove_file(directory.join(layout::BUILD_MARKER)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io("failed to remove build marker", e)),
        }

        self.build(spec, directory).await
    }

    async fn build(&self, spec: &VersionSpec, directory: &Path) -> Result<AuxiliaryTool> {
        self.statuses
            .insert(spec.directory_name(), VersionStatus::Building);

        let log = self.config.build_log();
        let mut log_file = tokio::fs::File::create(&log)
            .await
            .map_err(|e| Error::Io("failed to create build log", e))?;
        log_file
            .write_all(format!("building {spec} in {}\n", directory.display()).as_bytes())
            .await
            .map_err(|e| Error::Io("failed to write build log", e))?;
        drop(log_file);

        info!("compiling {spec} (this may take a while)");

        let status = self
            .build_tool
            .build(directory, &log)
            .await
            .map_err(|e| Error::Io("failed to run build command", e))?;

        if !status.success() {
            return Err(Error::Build {
                version: spec.identifier().to_string(),
                log,
            });
        }

        let auxiliary = self.build_stress(directory, &log).await;
        if let AuxiliaryTool::Unavailable { reason } = &auxiliary {
            warn!("error compiling the stress tool for {spec}: {reason}");
        }

        layout::write_marker(directory, &auxiliary).await?;

        info!("{spec} is ready at {}", directory.display());
        Ok(auxiliary)
    }

    async fn build_stress(&self, directory: &Path, log: &Path) -> AuxiliaryTool {
        let stress_dir = directory.join(layout::STRESS_DIR);
        if !stress_dir.is_dir() {
            return AuxiliaryTool::Unavailable {
                reason: format!("{} not found", layout::STRESS_DIR),
            };
        }

        if let Err(e) = make_executable(&stress_dir.join("bin")).await {
            return AuxiliaryTool::Unavailable {
                reason: format!("could not make scripts executable: {e}"),
            };
        }

        match self.build_tool.build(&stress_dir, log).await {
            Ok(status) if status.success() => AuxiliaryTool::Ready,
            Ok(status) => AuxiliaryTool::Unavailable {
                reason: format!("build exited with {status}"),
            },
            Err(e) => AuxiliaryTool::Unavailable {
                reason: format!("build could not run: {e}"),
            },
        }
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    fn managed_key(&self, path: &Path) -> Option<String> {
        let parent = path.parent()?;
        let name = path.file_name()?.to_str()?;

        same_directory(parent, self.root()).then(|| name.to_string())
    }
}

/// Describes an install directory the repository does not manage.
///
/// The identifier is read from the tree's `build.xml` when present.
///
/// # Errors
///
/// Returns `Error::Argument` if the directory lacks the expected layout.
pub fn local_version(install_dir: &Path) -> Result<Version> {
    layout::check(install_dir)?;

    let identifier = std::fs::read_to_string(install_dir.join("build.xml"))
        .ok()
        .and_then(|xml| {
            BASE_VERSION_REGEX
                .captures(&xml)
                .map(|c| c[1].to_string())
        })
        .or_else(|| {
            install_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
        })
        .unwrap_or_default();

    let auxiliary = layout::read_marker(install_dir).unwrap_or(AuxiliaryTool::Ready);

    Ok(Version {
        auxiliary,
        directory: install_dir.to_path_buf(),
        identifier,
        origin: Origin::Release,
    })
}

fn check_identifier(key: &str) -> Result<()> {
    let mut components = Path::new(key).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(Error::Argument(format!("invalid version identifier {key:?}"))),
    }
}

fn same_directory(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }

    matches!((a.canonicalize(), b.canonicalize()), (Ok(a), Ok(b)) if a == b)
}

/// Unpacks a gzipped tarball, returning its single top-level directory.
fn extract(archive: &Path, dest: &Path) -> std::result::Result<PathBuf, FetchError> {
    let file = File::open(archive).map_err(|e| FetchError::Io("failed to open archive", e))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    let mut top: Option<PathBuf> = None;
    for entry in archive.entries().map_err(FetchError::Archive)? {
        let mut entry = entry.map_err(FetchError::Archive)?;
        let path = entry.path().map_err(FetchError::Archive)?.into_owned();

        let first = path
            .components()
            .find(|c| !matches!(c, Component::CurDir))
            .map(|c| PathBuf::from(c.as_os_str()));

        match (&top, first) {
            (_, None) => continue,
            (None, Some(first)) => top = Some(first),
            (Some(existing), Some(first)) if *existing == first => {}
            (Some(_), Some(_)) => {
                return Err(FetchError::Layout(
                    "archive has more than one top-level directory".to_string(),
                ));
            }
        }

        entry.unpack_in(dest).map_err(FetchError::Archive)?;
    }

    let top = top.ok_or_else(|| FetchError::Layout("archive is empty".to_string()))?;
    let extracted = dest.join(top);
    if extracted.is_dir() {
        Ok(extracted)
    } else {
        Err(FetchError::Layout(
            "archive does not contain a top-level directory".to_string(),
        ))
    }
}

async fn make_executable(bin: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut entries = tokio::fs::read_dir(bin).await?;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if metadata.is_file() {
            let mut permissions = metadata.permissions();
            permissions.set_mode(permissions.mode() | 0o755);
            tokio::fs::set_permissions(entry.path(), permissions).await?;
        }
    }

    Ok(())
}
