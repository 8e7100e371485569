//! Expected on-disk layout of a database distribution.

use std::path::Path;

use crate::error::{Error, Result};
use crate::version::AuxiliaryTool;

/// Launcher script, relative to the install directory.
pub const LAUNCHER: &str = "bin/cassandra";

/// Admin tool, relative to the install directory.
pub const ADMIN_TOOL: &str = "bin/nodetool";

/// Default configuration file, relative to the install directory.
pub const CONFIG_FILE: &str = "conf/cassandra.yaml";

/// Directory holding the default configuration files.
pub const CONFIG_DIR: &str = "conf";

/// Source directory of the load-generator tool.
pub const STRESS_DIR: &str = "tools/stress";

/// Written once a cached version has been built.
pub const BUILD_MARKER: &str = ".ringmaster-build";

/// Names the branch a clone finished checking out.
pub const CHECKOUT_MARKER: &str = ".ringmaster-checkout";

/// Checks that `dir` looks like a database distribution.
///
/// # Errors
///
/// Returns `Error::Argument` naming the first missing piece.
pub fn check(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Err(Error::Argument(format!(
            "{} is not a directory",
            dir.display()
        )));
    }

    for required in [LAUNCHER, ADMIN_TOOL, CONFIG_FILE] {
        if !dir.join(required).is_file() {
            return Err(Error::Argument(format!(
                "{} does not appear to be a cassandra directory: missing {required}",
                dir.display()
            )));
        }
    }

    Ok(())
}

/// Checks the layout and that the repository finished building it.
///
/// # Errors
///
/// Returns `Error::Argument` if the layout is incomplete or unbuilt.
pub fn check_built(dir: &Path) -> Result<()> {
    check(dir)?;

    if dir.join(BUILD_MARKER).is_file() {
        Ok(())
    } else {
        Err(Error::Argument(format!(
            "{} was never built successfully",
            dir.display()
        )))
    }
}

/// Reads the auxiliary tool outcome recorded by the last build.
///
/// # Errors
///
/// Returns an error if the marker is missing or unreadable.
pub fn read_marker(dir: &Path) -> Result<AuxiliaryTool> {
    let path = dir.join(BUILD_MARKER);
    let contents =
        std::fs::read_to_string(&path).map_err(|e| Error::Io("failed to read build marker", e))?;

    serde_yaml::from_str(&contents).map_err(|source| Error::Marker { path, source })
}

/// Records a finished build.
///
/// # Errors
///
/// Returns an error if the marker cannot be written.
pub async fn write_marker(dir: &Path, auxiliary: &AuxiliaryTool) -> Result<()> {
    let path = dir.join(BUILD_MARKER);
    let contents = serde_yaml::to_string(auxiliary).map_err(|source| Error::Marker {
        path: path.clone(),
        source,
    })?;

    tokio::fs::write(&path, contents)
        .await
        .map_err(|e| Error::Io("failed to write build marker", e))
}

/// Branch recorded by a completed clone, if any.
pub async fn read_checkout(dir: &Path) -> Option<String> {
    tokio::fs::read_to_string(dir.join(CHECKOUT_MARKER))
        .await
        .ok()
        .map(|contents| contents.trim().to_string())
}

/// Records that `dir` holds a complete checkout of `branch`.
///
/// # Errors
///
/// Returns an error if the marker cannot be written.
pub async fn write_checkout(dir: &Path, branch: &str) -> Result<()> {
    tokio::fs::write(dir.join(CHECKOUT_MARKER), format!("{branch}\n"))
        .await
        .map_err(|e| Error::Io("failed to write checkout marker", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, relative: &str) {
        let path = dir.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "").unwrap();
    }

    #[test]
    fn test_check_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), LAUNCHER);
        touch(dir.path(), ADMIN_TOOL);

        let err = check(dir.path()).unwrap_err();
        assert!(err.to_string().contains(CONFIG_FILE));

        touch(dir.path(), CONFIG_FILE);
        check(dir.path()).unwrap();
        assert!(check_built(dir.path()).is_err());
    }

    #[tokio::test]
    async fn test_marker_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let auxiliary = AuxiliaryTool::Unavailable {
            reason: "ant exited with 1".to_string(),
        };

        write_marker(dir.path(), &auxiliary).await.unwrap();
        assert_eq!(read_marker(dir.path()).unwrap(), auxiliary);
    }
}
