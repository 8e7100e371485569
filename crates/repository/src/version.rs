use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Prefix for cache directories holding development branches, so a branch
/// never collides with a release of the same name.
const BRANCH_DIR_PREFIX: &str = "git_";

/// What the caller asks the repository for.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum VersionSpec {
    /// An immutable release, fetched once from the archive.
    Release(String),

    /// A mutable development branch, re-synchronized on every resolve.
    Branch(String),
}

impl VersionSpec {
    /// The identifier as given by the caller.
    #[must_use]
    pub fn identifier(&self) -> &str {
        match self {
            Self::Release(id) | Self::Branch(id) => id,
        }
    }

    /// Where the version comes from.
    #[must_use]
    pub const fn origin(&self) -> Origin {
        match self {
            Self::Release(_) => Origin::Release,
            Self::Branch(_) => Origin::Branch,
        }
    }

    /// Name of the cache directory for this version.
    #[must_use]
    pub fn directory_name(&self) -> String {
        match self {
            Self::Release(id) => id.clone(),
            Self::Branch(branch) => format!("{BRANCH_DIR_PREFIX}{}", branch.replace('/', "_")),
        }
    }

    /// Rebuilds a spec from a persisted identifier and origin.
    #[must_use]
    pub fn from_parts(identifier: impl Into<String>, origin: Origin) -> Self {
        match origin {
            Origin::Release => Self::Release(identifier.into()),
            Origin::Branch => Self::Branch(identifier.into()),
        }
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Release(id) => write!(f, "{id}"),
            Self::Branch(branch) => write!(f, "git:{branch}"),
        }
    }
}

/// Where a version's sources come from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Archived release tarball.
    #[default]
    Release,

    /// Source-control branch.
    Branch,
}

/// Build status of a version in the cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VersionStatus {
    /// Nothing cached.
    #[default]
    Absent,

    /// Sources are being downloaded or synchronized.
    Downloading,

    /// The build command is running.
    Building,

    /// Validated and built.
    Ready,

    /// The last attempt failed.
    Failed,
}

/// Outcome of building the auxiliary load-generator tool.
///
/// Cluster operation does not need the tool, so a failed build is kept here
/// instead of failing the resolve.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AuxiliaryTool {
    /// Built and usable.
    Ready,

    /// Not usable; the reason says why.
    Unavailable {
        /// Why the tool cannot be used.
        reason: String,
    },
}

/// A resolved, ready version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Version {
    /// State of the load-generator tool.
    pub auxiliary: AuxiliaryTool,

    /// Directory holding the built tree.
    pub directory: PathBuf,

    /// Release identifier or branch name.
    pub identifier: String,

    /// Where the sources came from.
    pub origin: Origin,
}

impl Version {
    /// The spec that resolves to this version.
    #[must_use]
    pub fn spec(&self) -> VersionSpec {
        VersionSpec::from_parts(self.identifier.clone(), self.origin)
    }
}
