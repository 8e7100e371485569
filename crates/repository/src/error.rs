use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller supplied an invalid path or identifier.
    #[error("{0}")]
    Argument(String),

    /// The build command for the main artifact failed.
    #[error("error compiling {version}, see {} for details", .log.display())]
    Build {
        /// The version being built.
        version: String,
        /// Log file holding the build output.
        log: PathBuf,
    },

    /// Could not obtain the sources for a version.
    #[error("failed to fetch {version}: {source}")]
    Fetch {
        /// The version being fetched.
        version: String,
        /// What went wrong.
        #[source]
        source: FetchError,
    },

    /// IO operation failed.
    #[error("{0}: {1}")]
    Io(&'static str, #[source] std::io::Error),

    /// Could not read or write the build marker.
    #[error("invalid build marker {}: {source}", .path.display())]
    Marker {
        /// Path of the marker file.
        path: PathBuf,
        /// The decoding error.
        #[source]
        source: serde_yaml::Error,
    },
}

/// Reasons a download or checkout can fail.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The archive could not be read.
    #[error("unable to uncompress downloaded file: {0}")]
    Archive(#[source] std::io::Error),

    /// A git command failed.
    #[error("`git {command}` exited with {status}, see {} for details", .log.display())]
    Git {
        /// The git subcommand that failed.
        command: String,
        /// Its exit status.
        status: ExitStatus,
        /// Log file holding the git output.
        log: PathBuf,
    },

    /// Local IO failed while storing fetched data.
    #[error("{0}: {1}")]
    Io(&'static str, #[source] std::io::Error),

    /// The fetched tree does not look like a database distribution.
    #[error("unexpected layout: {0}")]
    Layout(String),

    /// Network or HTTP failure.
    #[error("invalid url {url} (underlying error is: {source})")]
    Transport {
        /// The url being fetched.
        url: String,
        /// The transport error.
        #[source]
        source: reqwest::Error,
    },
}
