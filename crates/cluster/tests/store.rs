mod common;

use common::Fixture;
use ringmaster_cluster::{Error, LoadError, LocalCluster, LogLevel, NodeStatus};

#[tokio::test]
async fn test_load_round_trips_topology() {
    let fixture = Fixture::new();
    let mut cluster = LocalCluster::builder("roundtrip")
        .with_install_dir(&fixture.install)
        .with_nodes(3)
        .with_data_dirs(2)
        .with_log_level(LogLevel::Debug)
        .with_partitioner("org.apache.cassandra.dht.RandomPartitioner")
        .with_config_option("concurrent_writes", 64)
        .create(fixture.store.clone(), fixture.repository.clone())
        .await
        .unwrap();

    cluster.remove_configuration_option("commitlog_sync_period_in_ms");
    cluster
        .node_configuration_mut("node3")
        .unwrap()
        .set("concurrent_reads", 4);
    cluster.add_node("node4", false).await.unwrap();

    let loaded = fixture.load("roundtrip").await;

    for node in cluster.cluster().nodes() {
        assert_eq!(loaded.cluster().node(node.name()), Some(node));
    }
    assert_eq!(loaded.cluster().config, cluster.cluster().config);
    assert_eq!(loaded.cluster().partitioner, cluster.cluster().partitioner);
    assert_eq!(loaded.cluster().log_level, LogLevel::Debug);
    assert_eq!(
        loaded.cluster().install_dir(),
        cluster.cluster().install_dir()
    );
    assert_eq!(
        loaded.cluster().node_names(),
        ["node1", "node2", "node3", "node4"]
    );
    assert_eq!(loaded.cluster().seeds(), ["node1", "node2", "node3"]);
    assert_eq!(loaded.cluster().data_dir_count, 2);
    assert!(
        loaded
            .cluster()
            .config
            .is_removed("commitlog_sync_period_in_ms")
    );
}

#[tokio::test]
async fn test_missing_nodes_is_a_load_error() {
    let fixture = Fixture::new();
    fixture.create("broken", 1).await;

    let path = fixture.store.cluster_directory("broken").join("cluster.conf");
    let record = std::fs::read_to_string(&path).unwrap();
    let without_nodes: String = record
        .lines()
        .scan(false, |in_nodes, line| {
            if line.starts_with("nodes:") {
                *in_nodes = true;
                return Some(None);
            }
            if *in_nodes && line.starts_with("- ") {
                return Some(None);
            }
            *in_nodes = false;
            Some(Some(format!("{line}\n")))
        })
        .flatten()
        .collect();
    std::fs::write(&path, without_nodes).unwrap();

    let err = fixture
        .store
        .load("broken", &fixture.repository)
        .await
        .unwrap_err();

    match err {
        Error::Load {
            path: failed,
            reason: LoadError::MissingField(field),
        } => {
            assert_eq!(field, "nodes");
            assert_eq!(failed, path);
        }
        other => panic!("expected missing nodes, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_seed_is_a_load_error() {
    let fixture = Fixture::new();
    fixture.create("seeds", 1).await;

    let path = fixture.store.cluster_directory("seeds").join("cluster.conf");
    let record = std::fs::read_to_string(&path)
        .unwrap()
        .replace("seeds:\n- node1", "seeds:\n- node7");
    std::fs::write(&path, record).unwrap();

    let err = fixture
        .store
        .load("seeds", &fixture.repository)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Load {
            reason: LoadError::UnknownSeed(ref seed),
            ..
        } if seed == "node7"
    ));
}

#[tokio::test]
async fn test_renamed_node_record_is_a_load_error() {
    let fixture = Fixture::new();
    fixture.create("renamed", 2).await;

    let path = fixture.node_dir("renamed", "node1").join("node.conf");
    let record = std::fs::read_to_string(&path)
        .unwrap()
        .replace("name: node1", "name: other");
    std::fs::write(&path, record).unwrap();

    let err = fixture
        .store
        .load("renamed", &fixture.repository)
        .await
        .unwrap_err();

    match err {
        Error::Load {
            path: failed,
            reason: LoadError::Invalid { field, reason },
        } => {
            assert_eq!(field, "name");
            assert!(reason.contains("other"));
            assert_eq!(failed, path);
        }
        other => panic!("expected invalid name, got {other:?}"),
    }
}

#[tokio::test]
async fn test_missing_node_record_is_a_load_error() {
    let fixture = Fixture::new();
    fixture.create("partial", 3).await;

    let path = fixture.node_dir("partial", "node2").join("node.conf");
    std::fs::remove_file(&path).unwrap();

    let err = fixture
        .store
        .load("partial", &fixture.repository)
        .await
        .unwrap_err();

    match err {
        Error::Load {
            path: failed,
            reason: LoadError::MissingNode(node),
        } => {
            assert_eq!(node, "node2");
            assert_eq!(failed, path);
        }
        other => panic!("expected missing node, got {other:?}"),
    }
}

#[tokio::test]
async fn test_save_replaces_records_in_place() {
    let fixture = Fixture::new();
    let cluster = fixture.create("atomic", 2).await;

    cluster.save().await.unwrap();
    cluster.save().await.unwrap();

    let entries = |dir: std::path::PathBuf| {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    };

    assert_eq!(
        entries(fixture.store.cluster_directory("atomic")),
        ["cluster.conf", "node1", "node2"]
    );
    assert!(
        entries(fixture.node_dir("atomic", "node1"))
            .iter()
            .all(|name| !name.starts_with(".tmp"))
    );

    let loaded = fixture.load("atomic").await;
    assert_eq!(loaded.cluster().node_names(), ["node1", "node2"]);
}

#[tokio::test]
async fn test_unknown_keys_survive_a_save() {
    let fixture = Fixture::new();
    fixture.create("extended", 1).await;

    let path = fixture
        .store
        .cluster_directory("extended")
        .join("cluster.conf");
    let mut record = std::fs::read_to_string(&path).unwrap();
    record.push_str("dse_config_options:\n  graph: true\n");
    std::fs::write(&path, record).unwrap();

    let cluster = fixture.load("extended").await;
    cluster.save().await.unwrap();

    let saved = std::fs::read_to_string(&path).unwrap();
    assert!(saved.contains("dse_config_options"));
    assert!(saved.contains("graph: true"));
}

#[tokio::test]
async fn test_stale_running_status_is_corrected_on_load() {
    let fixture = Fixture::new();
    fixture.create("stale", 1).await;

    let path = fixture.node_dir("stale", "node1").join("node.conf");
    let mut record = std::fs::read_to_string(&path)
        .unwrap()
        .replace("status: NOT_STARTED", "status: RUNNING");
    // No process can have this pid
    record.push_str("pid: 4194304\n");
    std::fs::write(&path, record).unwrap();

    let cluster = fixture.load("stale").await;

    let node = cluster.cluster().node("node1").unwrap();
    assert_eq!(node.status(), NodeStatus::Errored);
    assert_eq!(node.pid(), None);
}

#[tokio::test]
async fn test_current_list_and_remove() {
    let fixture = Fixture::new();
    fixture.create("alpha", 1).await;
    fixture.create("beta", 1).await;

    assert_eq!(fixture.store.list().await.unwrap(), ["alpha", "beta"]);
    assert_eq!(
        fixture.store.current().await.unwrap().as_deref(),
        Some("beta")
    );

    fixture.store.set_current("alpha").await.unwrap();
    assert!(fixture.store.set_current("gamma").await.is_err());

    let current = LocalCluster::load_current(fixture.store.clone(), fixture.repository.clone())
        .await
        .unwrap();
    assert_eq!(current.name(), "alpha");

    fixture.store.remove("alpha").await.unwrap();
    assert_eq!(fixture.store.list().await.unwrap(), ["beta"]);
    assert_eq!(fixture.store.current().await.unwrap(), None);
}

#[tokio::test]
async fn test_duplicate_cluster_is_rejected() {
    let fixture = Fixture::new();
    fixture.create("dup", 1).await;

    let err = LocalCluster::builder("dup")
        .with_install_dir(&fixture.install)
        .create(fixture.store.clone(), fixture.repository.clone())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Argument(_)));
}

#[tokio::test]
async fn test_create_requires_a_version() {
    let fixture = Fixture::new();

    let err = LocalCluster::builder("empty")
        .create(fixture.store.clone(), fixture.repository.clone())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Argument(_)));
}
