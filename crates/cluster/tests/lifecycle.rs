mod common;

use std::collections::HashSet;

use common::{DEFAULT_CONFIG, Fixture, wait_options};
use ringmaster_cluster::{Error, NodeStatus, ReadyWait, StartOptions, StopMode};
use serde_yaml::{Mapping, Value};

fn read_config(fixture: &Fixture, cluster: &str, node: &str) -> Mapping {
    let path = fixture.node_dir(cluster, node).join("conf/cassandra.yaml");
    serde_yaml::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn test_three_node_cluster_starts_and_stops() {
    let fixture = Fixture::new();
    let mut cluster = fixture.create("test1", 3).await;

    let outcomes = cluster.start_all(wait_options()).await.unwrap();

    assert_eq!(
        outcomes.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>(),
        ["node1", "node2", "node3"]
    );
    let pids: HashSet<u32> = outcomes
        .iter()
        .map(|(_, outcome)| outcome.as_ref().unwrap().pid())
        .collect();
    assert_eq!(pids.len(), 3);

    for node in cluster.cluster().nodes() {
        assert_eq!(node.status(), NodeStatus::Running);
        assert!(pids.contains(&node.pid().unwrap()));
    }

    let report = cluster.stop_all(StopMode::Graceful).await.unwrap();
    assert_eq!(report.stopped, ["node1", "node2", "node3"]);
    assert!(report.not_running.is_empty());
    assert!(report.is_success());

    let report = cluster.stop_all(StopMode::Graceful).await.unwrap();
    assert!(report.stopped.is_empty());
    assert_eq!(report.not_running.len(), 3);

    for node in cluster.cluster().nodes() {
        assert_eq!(node.status(), NodeStatus::Stopped);
        assert_eq!(node.pid(), None);
    }
}

#[tokio::test]
async fn test_failing_node_does_not_block_others() {
    let fixture = Fixture::new();
    let mut cluster = fixture.create("partial", 2).await;
    fixture.mark_node("partial", "node2", "FAIL");

    let outcomes = cluster.start_all(wait_options()).await.unwrap();

    assert!(outcomes[0].1.is_ok());
    let err = outcomes[1].1.as_ref().unwrap_err();
    assert!(matches!(err, Error::Start { node, .. } if node == "node2"));
    assert!(
        err.stderr()
            .iter()
            .any(|line| line.contains("Address already in use"))
    );

    // The successful start was persisted
    let reloaded = fixture.load("partial").await;
    let node1 = reloaded.cluster().node("node1").unwrap();
    assert_eq!(node1.status(), NodeStatus::Running);
    assert!(node1.pid().is_some());
    assert_eq!(
        reloaded.cluster().node("node2").unwrap().status(),
        NodeStatus::Errored
    );

    let report = cluster.stop_all(StopMode::Graceful).await.unwrap();
    assert_eq!(report.stopped, ["node1"]);
    assert_eq!(report.not_running, ["node2"]);
}

#[tokio::test]
async fn test_stop_all_without_running_nodes() {
    let fixture = Fixture::new();
    let mut cluster = fixture.create("idle", 2).await;

    let report = cluster.stop_all(StopMode::Graceful).await.unwrap();

    assert!(report.stopped.is_empty());
    assert_eq!(report.not_running, ["node1", "node2"]);
    assert!(report.is_success());
}

#[tokio::test]
async fn test_ready_timeout_marks_node_errored() {
    let fixture = Fixture::new();
    let mut cluster = fixture.create("slow", 1).await;
    fixture.mark_node("slow", "node1", "HANG");

    let options = StartOptions {
        join_ring: true,
        wait: ReadyWait::Wait(std::time::Duration::from_millis(500)),
    };
    let err = cluster.start_node("node1", options).await.unwrap_err();

    assert!(matches!(err, Error::Start { .. }));
    let node = cluster.cluster().node("node1").unwrap();
    assert_eq!(node.status(), NodeStatus::Errored);
    assert_eq!(node.pid(), None);

    // An errored node can be retried
    std::fs::remove_file(fixture.node_dir("slow", "node1").join("HANG")).unwrap();
    cluster.start_node("node1", wait_options()).await.unwrap();
    assert!(cluster.stop_node("node1", StopMode::Forced).await.unwrap());
}

#[tokio::test]
async fn test_no_wait_start() {
    let fixture = Fixture::new();
    let mut cluster = fixture.create("nowait", 1).await;
    fixture.mark_node("nowait", "node1", "HANG");

    let options = StartOptions {
        join_ring: false,
        wait: ReadyWait::NoWait,
    };
    let handle = cluster.start_node("node1", options).await.unwrap();

    assert!(handle.is_running());
    assert_eq!(
        cluster.cluster().node("node1").unwrap().status(),
        NodeStatus::Running
    );

    assert!(cluster.stop_node("node1", StopMode::Graceful).await.unwrap());
    assert!(!cluster.stop_node("node1", StopMode::Graceful).await.unwrap());
}

#[tokio::test]
async fn test_start_running_node_is_rejected() {
    let fixture = Fixture::new();
    let mut cluster = fixture.create("twice", 1).await;

    cluster.start_node("node1", wait_options()).await.unwrap();
    let err = cluster.start_node("node1", wait_options()).await.unwrap_err();

    assert!(matches!(err, Error::Argument(_)));
    cluster.stop_all(StopMode::Forced).await.unwrap();
}

#[tokio::test]
async fn test_crashed_node_is_detected() {
    let fixture = Fixture::new();
    let mut cluster = fixture.create("crash", 1).await;

    let handle = cluster.start_node("node1", wait_options()).await.unwrap();
    std::process::Command::new("kill")
        .args(["-9", &handle.pid().to_string()])
        .status()
        .unwrap();
    handle.wait().await;

    let statuses = cluster.status().await.unwrap();

    assert_eq!(statuses, [("node1".to_string(), NodeStatus::Errored)]);
    assert_eq!(
        fixture.load("crash").await.cluster().node("node1").unwrap().status(),
        NodeStatus::Errored
    );
}

#[tokio::test]
async fn test_stop_all_reports_crashed_node_as_errored() {
    let fixture = Fixture::new();
    let mut cluster = fixture.create("crashstop", 1).await;

    let handle = cluster.start_node("node1", wait_options()).await.unwrap();
    std::process::Command::new("kill")
        .args(["-9", &handle.pid().to_string()])
        .status()
        .unwrap();
    handle.wait().await;

    let report = cluster.stop_all(StopMode::Graceful).await.unwrap();

    assert_eq!(report.not_running, ["node1"]);
    assert!(report.stopped.is_empty());
    let node = cluster.cluster().node("node1").unwrap();
    assert_eq!(node.status(), NodeStatus::Errored);
    assert_eq!(node.pid(), None);
}

#[tokio::test]
async fn test_update_configuration_rewrites_files() {
    let fixture = Fixture::new();
    let mut cluster = fixture.create("conf", 2).await;

    cluster.set_configuration_option("hinted_handoff_enabled", false);
    cluster.configuration_mut().batch_commitlog(5);
    cluster
        .node_configuration_mut("node2")
        .unwrap()
        .set("concurrent_reads", 8);
    cluster.update_configuration().await.unwrap();

    let node1 = read_config(&fixture, "conf", "node1");
    assert_eq!(node1.get("cluster_name"), Some(&Value::from("conf")));
    assert_eq!(node1.get("listen_address"), Some(&Value::from("127.0.0.1")));
    assert_eq!(node1.get("hinted_handoff_enabled"), Some(&Value::from(false)));
    assert_eq!(node1.get("commitlog_sync"), Some(&Value::from("batch")));
    assert!(node1.get("commitlog_sync_period_in_ms").is_none());
    assert_eq!(node1.get("concurrent_reads"), Some(&Value::from(32)));

    let seeds = &node1["seed_provider"][0]["parameters"][0]["seeds"];
    assert_eq!(seeds, &Value::from("127.0.0.1,127.0.0.2"));

    let node2 = read_config(&fixture, "conf", "node2");
    assert_eq!(node2.get("listen_address"), Some(&Value::from("127.0.0.2")));
    assert_eq!(node2.get("concurrent_reads"), Some(&Value::from(8)));

    // Unsetting restores the shipped default
    assert!(cluster.unset_configuration_option("hinted_handoff_enabled"));
    cluster.update_configuration().await.unwrap();

    let defaults: Mapping = serde_yaml::from_str(DEFAULT_CONFIG).unwrap();
    let node1 = read_config(&fixture, "conf", "node1");
    assert_eq!(
        node1.get("hinted_handoff_enabled"),
        defaults.get("hinted_handoff_enabled")
    );

    let conf_dir = fixture.node_dir("conf", "node2").join("conf");
    let env = std::fs::read_to_string(conf_dir.join("cassandra-env.sh")).unwrap();
    let jmx_port = cluster.cluster().node("node2").unwrap().bindings.jmx_port;
    assert!(env.contains(&format!("JMX_PORT=\"{jmx_port}\"")));
    assert!(env.contains("MAX_HEAP_SIZE"));
}

#[tokio::test]
async fn test_log_level_is_written() {
    let fixture = Fixture::new();
    let mut cluster = fixture.create("logs", 1).await;

    cluster.set_log_level("DEBUG".parse().unwrap());
    cluster.update_configuration().await.unwrap();

    let logback = std::fs::read_to_string(
        fixture.node_dir("logs", "node1").join("conf/logback.xml"),
    )
    .unwrap();
    assert!(logback.contains(r#"<root level="DEBUG">"#));
}

#[tokio::test]
async fn test_nodetool_passes_through() {
    let fixture = Fixture::new();
    let cluster = fixture.create("tool", 1).await;
    let jmx_port = cluster.cluster().node("node1").unwrap().bindings.jmx_port;

    let output = cluster
        .nodetool("node1", &["status".to_string()])
        .await
        .unwrap();

    assert!(output.status.success());
    assert_eq!(
        output.stdout.trim(),
        format!("nodetool -h 127.0.0.1 -p {jmx_port} status")
    );
    assert!(cluster.nodetool("node9", &[]).await.is_err());
}

#[tokio::test]
async fn test_remove_stops_nodes_and_deletes_state() {
    let fixture = Fixture::new();
    let mut cluster = fixture.create("doomed", 1).await;
    let handle = cluster.start_node("node1", wait_options()).await.unwrap();
    let pid = handle.pid();

    cluster.remove().await.unwrap();

    assert!(!fixture.store.exists("doomed"));
    assert!(!fixture.store.cluster_directory("doomed").exists());
    assert_eq!(fixture.store.current().await.unwrap(), None);
    assert!(!ringmaster_process::pid::is_alive(pid));
}
