//! Common test setup for integration tests
#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::Duration;

use ringmaster_cluster::{
    ClusterStore, LocalCluster, NodeProcessManager, ReadyWait, StartOptions,
};
use ringmaster_repository::{RepositoryConfig, VersionRepository};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Initialize the global tracing subscriber for all tests
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Stand-in for the database launcher.
///
/// Exits with a bind error if the node directory holds a `FAIL` file, never
/// reports readiness if it holds a `HANG` file, and otherwise prints the
/// ready marker and sleeps.
const LAUNCHER: &str = r#"#!/bin/sh
if [ -f FAIL ]; then
    echo "ERROR [main] java.net.BindException: Address already in use" >&2
    exit 3
fi
if [ -f HANG ]; then
    exec sleep 600
fi
echo "INFO  [main] Starting listening for CQL clients on /127.0.0.1:9042..."
exec sleep 600
"#;

const NODETOOL: &str = r#"#!/bin/sh
echo "nodetool $*"
"#;

pub const DEFAULT_CONFIG: &str = "\
cluster_name: Test Cluster
commitlog_sync: periodic
commitlog_sync_period_in_ms: 10000
hinted_handoff_enabled: true
concurrent_reads: 32
";

const LOGBACK: &str = r#"<configuration>
  <root level="INFO">
    <appender-ref ref="STDOUT" />
  </root>
</configuration>
"#;

const CASSANDRA_ENV: &str = "MAX_HEAP_SIZE=\"1G\"\nJMX_PORT=\"7199\"\n";

fn write_file(path: &Path, contents: &str, mode: u32) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
}

/// Writes a fake install directory.
pub fn fake_install(dir: &Path) {
    write_file(&dir.join("bin/cassandra"), LAUNCHER, 0o755);
    write_file(&dir.join("bin/nodetool"), NODETOOL, 0o755);
    write_file(&dir.join("conf/cassandra.yaml"), DEFAULT_CONFIG, 0o644);
    write_file(&dir.join("conf/logback.xml"), LOGBACK, 0o644);
    write_file(&dir.join("conf/cassandra-env.sh"), CASSANDRA_ENV, 0o644);
}

/// Process manager with short timeouts.
pub fn test_manager() -> NodeProcessManager {
    NodeProcessManager::new()
        .with_shutdown_timeout(Duration::from_secs(5))
        .with_no_wait_grace(Duration::from_millis(300))
}

/// Start options with a short readiness timeout.
pub fn wait_options() -> StartOptions {
    StartOptions {
        join_ring: true,
        wait: ReadyWait::Wait(Duration::from_secs(10)),
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub install: PathBuf,
    pub repository: Arc<VersionRepository>,
    pub store: ClusterStore,
}

impl Fixture {
    pub fn new() -> Self {
        init_test_logging();

        let dir = TempDir::new().unwrap();
        let install = dir.path().join("install");
        fake_install(&install);

        let repository = Arc::new(VersionRepository::new(RepositoryConfig::new(
            dir.path().join("repository"),
        )));
        let store = ClusterStore::new(dir.path().join("clusters"));

        Self {
            dir,
            install,
            repository,
            store,
        }
    }

    pub async fn create(&self, name: &str, nodes: usize) -> LocalCluster {
        LocalCluster::builder(name)
            .with_install_dir(&self.install)
            .with_nodes(nodes)
            .with_process_manager(test_manager())
            .create(self.store.clone(), self.repository.clone())
            .await
            .unwrap()
    }

    pub async fn load(&self, name: &str) -> LocalCluster {
        LocalCluster::load(self.store.clone(), self.repository.clone(), name)
            .await
            .unwrap()
            .with_process_manager(test_manager())
    }

    pub fn node_dir(&self, cluster: &str, node: &str) -> PathBuf {
        self.store.cluster_directory(cluster).join(node)
    }

    /// Makes the fake launcher fail or hang for one node.
    pub fn mark_node(&self, cluster: &str, node: &str, marker: &str) {
        let dir = self.node_dir(cluster, node);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(marker), "").unwrap();
    }
}
