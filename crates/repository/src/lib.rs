//! Local cache of database versions.
//!
//! A version is either an archived release, downloaded once and kept, or a
//! development branch, cloned once and pulled on every resolve. Both are
//! built with a single fixed build command before they are handed out.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

mod builder;
mod config;
mod error;
pub mod layout;
mod repository;
mod source;
mod version;

pub use builder::{AntBuild, BuildTool};
pub use config::{DEFAULT_ARCHIVE_URL, DEFAULT_BRANCH, DEFAULT_GIT_URL, RepositoryConfig};
pub use error::{Error, FetchError, Result};
pub use repository::{VersionRepository, local_version};
pub use source::{RemoteSource, VersionSource};
pub use version::{AuxiliaryTool, Origin, Version, VersionSpec, VersionStatus};
