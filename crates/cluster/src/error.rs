use std::path::PathBuf;

use thiserror::Error;

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller supplied an invalid name, node or option.
    #[error("{0}")]
    Argument(String),

    /// IO operation failed.
    #[error("{0}: {1}")]
    Io(&'static str, #[source] std::io::Error),

    /// A persisted record could not be turned back into a cluster.
    #[error("error loading {}, {reason}", .path.display())]
    Load {
        /// The record being loaded.
        path: PathBuf,
        /// What is wrong with it.
        #[source]
        reason: LoadError,
    },

    /// The version backing a cluster could not be made ready.
    #[error(transparent)]
    Repository(#[from] ringmaster_repository::Error),

    /// A node failed to start.
    #[error("error starting node {node}: {source}")]
    Start {
        /// The node that failed.
        node: String,
        /// The underlying process failure.
        #[source]
        source: ringmaster_process::Error,
    },

    /// A node could not be stopped.
    #[error("error stopping node {node}: {source}")]
    Stop {
        /// The node that failed.
        node: String,
        /// The underlying process failure.
        #[source]
        source: ringmaster_process::Error,
    },

    /// A configuration file could not be read or written.
    #[error("invalid yaml in {}: {source}", .path.display())]
    Yaml {
        /// The file being processed.
        path: PathBuf,
        /// The decoding error.
        #[source]
        source: serde_yaml::Error,
    },
}

impl Error {
    /// Captured stderr of a node that failed to start.
    #[must_use]
    pub fn stderr(&self) -> &[String] {
        match self {
            Self::Start { source, .. } => source.stderr(),
            _ => &[],
        }
    }
}

/// Reasons a persisted record is rejected.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The record cannot be decoded.
    #[error("{0}")]
    Decode(#[source] serde_yaml::Error),

    /// A field has an unusable value.
    #[error("invalid property {field}: {reason}")]
    Invalid {
        /// The offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// A required field is absent.
    #[error("missing property: {0}")]
    MissingField(&'static str),

    /// A listed node has no record.
    #[error("missing record of node {0}")]
    MissingNode(String),

    /// A seed names a node that is not part of the cluster.
    #[error("seed {0} is not a node of the cluster")]
    UnknownSeed(String),
}
