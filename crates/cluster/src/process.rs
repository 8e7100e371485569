//! Process lifecycle of a single node.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use ringmaster_process::{ManagedApplication, ManagedProcess, Signal, pid, spawn};
use ringmaster_repository::layout;
use serde_yaml::{Mapping, Value};
use tokio::process::Command;
use tracing::{debug, error, info, trace, warn};

use crate::config::{ConfigLayer, merge};
use crate::error::{Error, Result};
use crate::topology::{Cluster, LogLevel, Node, NodeStatus, VNODE_TOKENS};

/// Output line marking a node as ready for clients.
pub const DEFAULT_READY_PATTERN: &str =
    "Starting listening for CQL clients|Listening for thrift clients";

/// How long `start` waits for the ready marker by default.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(120);

/// Grace period of a start that does not wait for readiness.
pub const NO_WAIT_GRACE: Duration = Duration::from_secs(2);

/// How long a graceful stop waits before killing the node.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Seed provider written into every node's configuration.
const SEED_PROVIDER: &str = "org.apache.cassandra.locator.SimpleSeedProvider";

static READY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(DEFAULT_READY_PATTERN).expect("Invalid regex pattern"));

static LOG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(TRACE|DEBUG|INFO|WARN|ERROR)\s+(?:\[[^\]]*\]\s+)?(.*)$")
        .expect("Invalid regex pattern")
});

static ROOT_LEVEL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<root level="[A-Za-z]+">"#).expect("Invalid regex pattern"));

static JMX_PORT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?m)^JMX_PORT=.*$"#).expect("Invalid regex pattern"));

/// A running node process.
pub type ProcessHandle = ManagedProcess;

/// How `start` decides that a node is up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadyWait {
    /// Wait for the ready marker, failing after the timeout.
    Wait(Duration),

    /// Return after a short grace period if the process is still alive.
    NoWait,
}

impl Default for ReadyWait {
    fn default() -> Self {
        Self::Wait(DEFAULT_READY_TIMEOUT)
    }
}

/// Options for starting a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StartOptions {
    /// Whether the node joins the token ring.
    pub join_ring: bool,

    /// Readiness mode.
    pub wait: ReadyWait,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            join_ring: true,
            wait: ReadyWait::default(),
        }
    }
}

/// How `stop` terminates a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StopMode {
    /// SIGTERM, escalating to SIGKILL after the shutdown timeout.
    #[default]
    Graceful,

    /// SIGKILL right away.
    Forced,
}

/// Everything a node needs to know about the cluster it belongs to.
#[derive(Clone, Debug)]
pub struct ClusterContext<'a> {
    /// Cluster name, written as `cluster_name`.
    pub name: &'a str,

    /// Cluster directory holding the node directories.
    pub directory: &'a Path,

    /// Install directory of the version.
    pub install_dir: &'a Path,

    /// Partitioner class.
    pub partitioner: &'a str,

    /// Seed node addresses.
    pub seeds: Vec<IpAddr>,

    /// Cluster-wide option overrides.
    pub config: &'a ConfigLayer,

    /// Number of data directories per node.
    pub data_dir_count: usize,

    /// Node log level.
    pub log_level: LogLevel,

    /// Whether nodes use virtual nodes.
    pub use_vnodes: bool,
}

impl<'a> ClusterContext<'a> {
    /// Borrows the context out of a cluster.
    #[must_use]
    pub fn of(cluster: &'a Cluster) -> Self {
        Self {
            name: cluster.name(),
            directory: cluster.directory(),
            install_dir: cluster.install_dir(),
            partitioner: &cluster.partitioner,
            seeds: cluster.seed_addresses(),
            config: &cluster.config,
            data_dir_count: cluster.data_dir_count,
            log_level: cluster.log_level,
            use_vnodes: cluster.use_vnodes,
        }
    }

    /// Directory of `node`.
    #[must_use]
    pub fn node_directory(&self, node: &Node) -> PathBuf {
        self.directory.join(node.name())
    }
}

/// Output of an admin tool invocation.
#[derive(Clone, Debug)]
pub struct NodetoolOutput {
    /// Exit status of the tool.
    pub status: ExitStatus,

    /// Everything written to stdout.
    pub stdout: String,

    /// Everything written to stderr.
    pub stderr: String,
}

/// The launched database process of one node.
struct CassandraApp {
    args: Vec<String>,
    env: Vec<(String, String)>,
    executable: PathBuf,
    name: String,
    ready_pattern: Option<Regex>,
    working_dir: PathBuf,
}

impl ManagedApplication for CassandraApp {
    fn args(&self) -> Vec<String> {
        self.args.clone()
    }

    fn env(&self) -> Vec<(String, String)> {
        self.env.clone()
    }

    fn executable(&self) -> &Path {
        &self.executable
    }

    #[allow(clippy::cognitive_complexity)]
    fn handle_stdout(&self, line: &str) {
        if let Some(caps) = LOG_REGEX.captures(line) {
            let label = caps.get(1).map_or("INFO", |m| m.as_str());
            let message = caps.get(2).map_or(line, |m| m.as_str());
            match label {
                "TRACE" => trace!(target: "cassandra", node = %self.name, "{}", message),
                "DEBUG" => debug!(target: "cassandra", node = %self.name, "{}", message),
                "WARN" => warn!(target: "cassandra", node = %self.name, "{}", message),
                "ERROR" => error!(target: "cassandra", node = %self.name, "{}", message),
                _ => info!(target: "cassandra", node = %self.name, "{}", message),
            }
        } else {
            info!(target: "cassandra", node = %self.name, "{}", line);
        }
    }

    fn handle_stderr(&self, line: &str) {
        warn!(target: "cassandra", node = %self.name, "{}", line);
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn ready_pattern(&self) -> Option<Regex> {
        self.ready_pattern.clone()
    }

    fn working_dir(&self) -> Option<PathBuf> {
        Some(self.working_dir.clone())
    }
}

/// Drives node processes through their lifecycle.
///
/// The manager itself is stateless; pid and status live on the [`Node`].
#[derive(Clone, Debug)]
pub struct NodeProcessManager {
    no_wait_grace: Duration,
    ready_pattern: Regex,
    shutdown_timeout: Duration,
}

impl Default for NodeProcessManager {
    fn default() -> Self {
        Self {
            no_wait_grace: NO_WAIT_GRACE,
            ready_pattern: READY_REGEX.clone(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl NodeProcessManager {
    /// Creates a manager with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the ready marker pattern.
    #[must_use]
    pub fn with_ready_pattern(mut self, pattern: Regex) -> Self {
        self.ready_pattern = pattern;
        self
    }

    /// Sets the graceful stop timeout.
    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the grace period of a start that does not wait.
    #[must_use]
    pub const fn with_no_wait_grace(mut self, grace: Duration) -> Self {
        self.no_wait_grace = grace;
        self
    }

    /// Starts a node and waits for it according to `options`.
    ///
    /// The node's configuration is rewritten first. On failure the node is
    /// left `ERRORED`, keeping the pid only if the process could not be
    /// killed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Argument` if the node is already running and
    /// `Error::Start`, carrying the captured stderr, if it fails to come up.
    pub async fn start(
        &self,
        node: &mut Node,
        ctx: &ClusterContext<'_>,
        options: StartOptions,
    ) -> Result<ProcessHandle> {
        Self::refresh(node);
        if Self::is_running(node) {
            return Err(Error::Argument(format!("{} is already running", node.name())));
        }

        self.write_configuration(node, ctx).await?;

        let node_dir = ctx.node_directory(node);
        let conf_dir = node_dir.join("conf");
        let log_dir = node_dir.join("logs");
        create_dir(&log_dir).await?;

        let mut args = vec![
            "-f".to_string(),
            format!(
                "-Dcassandra.config=file://{}",
                conf_dir.join("cassandra.yaml").display()
            ),
            format!("-Dcassandra.logdir={}", log_dir.display()),
        ];
        if !options.join_ring {
            args.push("-Dcassandra.join_ring=false".to_string());
        }

        let app = CassandraApp {
            args,
            env: vec![
                ("CASSANDRA_CONF".to_string(), conf_dir.display().to_string()),
                (
                    "CASSANDRA_HOME".to_string(),
                    ctx.install_dir.display().to_string(),
                ),
                (
                    "JMX_PORT".to_string(),
                    node.bindings.jmx_port.to_string(),
                ),
            ],
            executable: ctx.install_dir.join(layout::LAUNCHER),
            name: node.name().to_string(),
            ready_pattern: match options.wait {
                ReadyWait::Wait(_) => Some(self.ready_pattern.clone()),
                ReadyWait::NoWait => None,
            },
            working_dir: node_dir,
        };

        info!("starting node {}", node.name());
        node.set_status(NodeStatus::Starting);

        let handle = match spawn(app) {
            Ok(handle) => handle,
            Err(source) => {
                node.restore(NodeStatus::Errored, None);
                return Err(Error::Start {
                    node: node.name().to_string(),
                    source,
                });
            }
        };

        let ready = match options.wait {
            ReadyWait::Wait(timeout) => handle.wait_ready(timeout).await,
            ReadyWait::NoWait => handle.settle(self.no_wait_grace).await,
        };

        if let Err(source) = ready {
            error!("node {} failed to start: {source}", node.name());
            // A node stuck before readiness would otherwise hold its ports
            let survivor = if handle.is_running()
                && let Err(err) = handle.shutdown(Signal::SIGKILL, self.shutdown_timeout).await
            {
                warn!(
                    "failed to kill node {} (pid {}): {err}",
                    node.name(),
                    handle.pid()
                );
                Some(handle.pid())
            } else {
                None
            };
            node.restore(NodeStatus::Errored, survivor);
            return Err(Error::Start {
                node: node.name().to_string(),
                source,
            });
        }

        Self::update_pid(node, &handle);
        node.set_status(NodeStatus::Running);
        info!("node {} started with pid {}", node.name(), handle.pid());

        Ok(handle)
    }

    /// Records the pid of a freshly started process.
    pub fn update_pid(node: &mut Node, handle: &ProcessHandle) {
        node.set_pid(Some(handle.pid()));
    }

    /// Stops a node.
    ///
    /// Returns `false` without error if the node was not running. A node
    /// recorded as starting or running whose process is gone is left
    /// `ERRORED`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Stop` if the process survives; the node keeps its
    /// previous status in that case.
    pub async fn stop(&self, node: &mut Node, mode: StopMode) -> Result<bool> {
        let Some(pid) = node.pid().filter(|pid| pid::is_alive(*pid)) else {
            match node.status() {
                NodeStatus::Starting | NodeStatus::Running => {
                    warn!("node {} is no longer running", node.name());
                    node.set_status(NodeStatus::Errored);
                }
                NodeStatus::Stopping => node.set_status(NodeStatus::Stopped),
                _ => {}
            }
            node.set_pid(None);
            return Ok(false);
        };

        info!("stopping node {} (pid {pid})", node.name());
        let previous = node.status();
        node.set_status(NodeStatus::Stopping);

        let signal = match mode {
            StopMode::Graceful => Signal::SIGTERM,
            StopMode::Forced => Signal::SIGKILL,
        };

        match pid::terminate(pid, signal, self.shutdown_timeout).await {
            Ok(termination) => {
                debug!("node {} terminated: {termination:?}", node.name());
                node.restore(NodeStatus::Stopped, None);
                Ok(true)
            }
            Err(source) => {
                node.set_status(previous);
                Err(Error::Stop {
                    node: node.name().to_string(),
                    source,
                })
            }
        }
    }

    /// Whether the recorded pid belongs to a live process.
    #[must_use]
    pub fn is_running(node: &Node) -> bool {
        node.pid().is_some_and(pid::is_alive)
    }

    /// Marks a node whose process died unexpectedly as `ERRORED`.
    ///
    /// Returns whether the status changed.
    pub fn refresh(node: &mut Node) -> bool {
        if matches!(node.status(), NodeStatus::Starting | NodeStatus::Running)
            && !Self::is_running(node)
        {
            warn!("node {} is no longer running", node.name());
            node.restore(NodeStatus::Errored, None);
            return true;
        }

        false
    }

    /// Runs the admin tool against a node, relaying its output unmodified.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool could not be executed.
    pub async fn nodetool(
        &self,
        node: &Node,
        ctx: &ClusterContext<'_>,
        args: &[String],
    ) -> Result<NodetoolOutput> {
        let output = Command::new(ctx.install_dir.join(layout::ADMIN_TOOL))
            .arg("-h")
            .arg(node.bindings.address.to_string())
            .arg("-p")
            .arg(node.bindings.jmx_port.to_string())
            .args(args)
            .env("CASSANDRA_CONF", ctx.node_directory(node).join("conf"))
            .env("CASSANDRA_HOME", ctx.install_dir)
            .output()
            .await
            .map_err(|e| Error::Io("failed to run nodetool", e))?;

        Ok(NodetoolOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Writes a node's configuration directory.
    ///
    /// Defaults are copied from the install each time, so options that were
    /// unset go back to the shipped value.
    ///
    /// # Errors
    ///
    /// Returns an error if a file could not be read, parsed or written.
    pub async fn write_configuration(&self, node: &Node, ctx: &ClusterContext<'_>) -> Result<()> {
        let node_dir = ctx.node_directory(node);
        let conf_dir = node_dir.join("conf");
        create_dir(&conf_dir).await?;

        copy_dir(&ctx.install_dir.join(layout::CONFIG_DIR), &conf_dir).await?;

        let defaults_path = ctx.install_dir.join(layout::CONFIG_FILE);
        let defaults = tokio::fs::read_to_string(&defaults_path)
            .await
            .map_err(|e| Error::Io("failed to read default configuration", e))?;

        let mut document: Mapping = if defaults.trim().is_empty() {
            Mapping::new()
        } else {
            serde_yaml::from_str(&defaults).map_err(|source| Error::Yaml {
                path: defaults_path.clone(),
                source,
            })?
        };

        for (key, value) in node_settings(node, ctx, &node_dir) {
            document.insert(Value::String(key.to_string()), value);
        }

        merge(ctx.config, &node.config).apply(&mut document);

        let config_path = conf_dir.join("cassandra.yaml");
        let contents = serde_yaml::to_string(&document).map_err(|source| Error::Yaml {
            path: config_path.clone(),
            source,
        })?;
        tokio::fs::write(&config_path, contents)
            .await
            .map_err(|e| Error::Io("failed to write node configuration", e))?;

        for index in 0..ctx.data_dir_count {
            create_dir(&node_dir.join(format!("data{index}"))).await?;
        }

        rewrite_if_exists(&conf_dir.join("logback.xml"), |contents| {
            ROOT_LEVEL_REGEX
                .replace_all(contents, format!(r#"<root level="{}">"#, ctx.log_level))
                .into_owned()
        })
        .await?;

        rewrite_if_exists(&conf_dir.join("cassandra-env.sh"), |contents| {
            JMX_PORT_REGEX
                .replace_all(contents, format!(r#"JMX_PORT="{}""#, node.bindings.jmx_port))
                .into_owned()
        })
        .await?;

        debug!("wrote configuration of node {} to {}", node.name(), conf_dir.display());
        Ok(())
    }
}

/// Settings derived from the topology, applied before any option overrides.
fn node_settings(node: &Node, ctx: &ClusterContext<'_>, node_dir: &Path) -> Vec<(&'static str, Value)> {
    let address = node.bindings.address.to_string();
    let seeds = ctx
        .seeds
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let data_dirs = (0..ctx.data_dir_count)
        .map(|index| Value::from(node_dir.join(format!("data{index}")).display().to_string()))
        .collect::<Vec<_>>();

    let mut seed_parameters = Mapping::new();
    seed_parameters.insert(Value::from("seeds"), Value::from(seeds));
    let mut seed_provider = Mapping::new();
    seed_provider.insert(Value::from("class_name"), Value::from(SEED_PROVIDER));
    seed_provider.insert(
        Value::from("parameters"),
        Value::Sequence(vec![Value::Mapping(seed_parameters)]),
    );

    let mut settings = vec![
        ("cluster_name", Value::from(ctx.name)),
        ("listen_address", Value::from(address.clone())),
        ("rpc_address", Value::from(address)),
        ("storage_port", Value::from(node.bindings.storage_port)),
        (
            "native_transport_port",
            Value::from(node.bindings.native_transport_port),
        ),
        ("seed_provider", Value::Sequence(vec![Value::Mapping(seed_provider)])),
        ("data_file_directories", Value::Sequence(data_dirs)),
        (
            "commitlog_directory",
            Value::from(node_dir.join("commitlogs").display().to_string()),
        ),
        (
            "saved_caches_directory",
            Value::from(node_dir.join("saved_caches").display().to_string()),
        ),
        ("partitioner", Value::from(ctx.partitioner)),
    ];

    if ctx.use_vnodes {
        settings.push(("num_tokens", Value::from(VNODE_TOKENS)));
    } else {
        settings.push(("num_tokens", Value::from(1)));
        if let Some(token) = &node.initial_token {
            settings.push(("initial_token", Value::from(token.as_str())));
        }
    }

    settings
}

async fn create_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| Error::Io("failed to create node directory", e))
}

async fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    let mut entries = tokio::fs::read_dir(from)
        .await
        .map_err(|e| Error::Io("failed to read configuration directory", e))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::Io("failed to read configuration directory", e))?
    {
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| Error::Io("failed to inspect configuration file", e))?;

        if file_type.is_file() {
            tokio::fs::copy(entry.path(), to.join(entry.file_name()))
                .await
                .map_err(|e| Error::Io("failed to copy configuration file", e))?;
        }
    }

    Ok(())
}

async fn rewrite_if_exists(path: &Path, rewrite: impl FnOnce(&str) -> String) -> Result<()> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::Io("failed to read configuration file", e)),
    };

    tokio::fs::write(path, rewrite(&contents))
        .await
        .map_err(|e| Error::Io("failed to write configuration file", e))
}

#[cfg(test)]
mod tests {
    use ringmaster_util::port_allocator::loopback_address;

    use super::*;
    use crate::topology::NetworkBindings;

    #[test]
    fn test_log_regex_extracts_level() {
        let caps = LOG_REGEX
            .captures("WARN  [main] 2024-01-01 12:00:00,000 StartupChecks.java:1 - jemalloc not found")
            .unwrap();

        assert_eq!(&caps[1], "WARN");
        assert!(caps[2].contains("jemalloc not found"));
    }

    #[test]
    fn test_default_ready_pattern() {
        let pattern = Regex::new(DEFAULT_READY_PATTERN).unwrap();

        assert!(pattern.is_match("INFO  [main] Starting listening for CQL clients on /127.0.0.1:9042"));
        assert!(pattern.is_match("INFO Listening for thrift clients..."));
        assert!(!pattern.is_match("INFO  [main] Loading settings"));
    }

    #[test]
    fn test_jmx_port_rewrite() {
        let rewritten = JMX_PORT_REGEX.replace_all("# jmx\nJMX_PORT=\"7199\"\nexport JMX_PORT\n", "JMX_PORT=\"7299\"");

        assert_eq!(rewritten, "# jmx\nJMX_PORT=\"7299\"\nexport JMX_PORT\n");
    }

    fn node_with(status: NodeStatus, pid: Option<u32>) -> Node {
        let bindings = NetworkBindings {
            address: loopback_address(1),
            jmx_port: 7199,
            native_transport_port: 9042,
            storage_port: 7000,
        };
        let mut node = Node::new("node1", bindings);
        node.restore(status, pid);
        node
    }

    #[tokio::test]
    async fn test_stop_marks_dead_running_node_errored() {
        // No process can have this pid
        let mut node = node_with(NodeStatus::Running, Some(4_194_304));

        let stopped = NodeProcessManager::new()
            .stop(&mut node, StopMode::Graceful)
            .await
            .unwrap();

        assert!(!stopped);
        assert_eq!(node.status(), NodeStatus::Errored);
        assert_eq!(node.pid(), None);
    }

    #[tokio::test]
    async fn test_errored_node_with_live_pid_can_be_stopped() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();
        let reaper = tokio::spawn(async move { child.wait().await });

        let mut node = node_with(NodeStatus::Errored, Some(pid));
        assert!(!NodeProcessManager::refresh(&mut node));
        assert!(NodeProcessManager::is_running(&node));

        let stopped = NodeProcessManager::new()
            .with_shutdown_timeout(Duration::from_secs(5))
            .stop(&mut node, StopMode::Graceful)
            .await
            .unwrap();

        assert!(stopped);
        assert_eq!(node.status(), NodeStatus::Stopped);
        assert_eq!(node.pid(), None);
        reaper.await.unwrap().unwrap();
    }
}
