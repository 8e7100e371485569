//! The cluster aggregate and its nodes.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use indexmap::IndexMap;
use ringmaster_repository::Version;
use ringmaster_util::port_allocator::{loopback_address, next_available_port};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::config::ConfigLayer;
use crate::error::{Error, Result};

/// Partitioner used when none is given.
pub const DEFAULT_PARTITIONER: &str = "org.apache.cassandra.dht.Murmur3Partitioner";

/// Default inter-node storage port.
pub const DEFAULT_STORAGE_PORT: u16 = 7000;

/// Default client protocol port.
pub const DEFAULT_NATIVE_TRANSPORT_PORT: u16 = 9042;

/// Tokens per node when vnodes are enabled.
pub const VNODE_TOKENS: u32 = 256;

/// Lifecycle of a node process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// Never started.
    #[default]
    NotStarted,

    /// Launched, not ready yet.
    Starting,

    /// Ready and alive.
    Running,

    /// Termination in progress.
    Stopping,

    /// Stopped on request.
    Stopped,

    /// Failed to start or died unexpectedly.
    Errored,
}

impl NodeStatus {
    /// Whether a process is expected to exist in this state.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Errored => "ERRORED",
        };
        f.write_str(label)
    }
}

/// Log level written into each node's logging configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Errors only.
    Error,
    /// Warnings and errors.
    Warn,
    /// The database default.
    #[default]
    Info,
    /// Debug output.
    Debug,
    /// Everything.
    Trace,
}

impl LogLevel {
    /// Level name as the logging backend spells it.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ERROR" => Ok(Self::Error),
            "WARN" | "WARNING" => Ok(Self::Warn),
            "INFO" => Ok(Self::Info),
            "DEBUG" => Ok(Self::Debug),
            "TRACE" => Ok(Self::Trace),
            _ => Err(Error::Argument(format!("unknown log level {s}"))),
        }
    }
}

/// Addresses and ports a node listens on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkBindings {
    /// Listen, broadcast and client address.
    pub address: IpAddr,

    /// JMX management port.
    pub jmx_port: u16,

    /// Client protocol port.
    pub native_transport_port: u16,

    /// Inter-node storage port.
    pub storage_port: u16,
}

impl NetworkBindings {
    /// Bindings for the node with the given 1-based index.
    ///
    /// Each node gets its own loopback address so the storage and client
    /// ports stay at their defaults. JMX listens on every interface, so its
    /// port is picked per node from `7000 + 100 * index + 99` upwards.
    ///
    /// # Errors
    ///
    /// Returns `Error::Argument` for index 0 or when no JMX port is free.
    pub fn for_index(index: u8) -> Result<Self> {
        if index == 0 {
            return Err(Error::Argument("node indexes start at 1".to_string()));
        }

        let start = 7000 + 100 * u16::from(index) + 99;
        let jmx_port = next_available_port(start)
            .ok_or_else(|| Error::Argument(format!("no free jmx port above {start}")))?;

        Ok(Self {
            address: loopback_address(index),
            jmx_port,
            native_transport_port: DEFAULT_NATIVE_TRANSPORT_PORT,
            storage_port: DEFAULT_STORAGE_PORT,
        })
    }
}

/// One database node of a cluster.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    /// Network bindings.
    pub bindings: NetworkBindings,

    /// Per-node option overrides.
    pub config: ConfigLayer,

    /// Unknown keys from the persisted record, written back unchanged.
    pub extensions: IndexMap<String, Value>,

    /// Token assigned when vnodes are disabled.
    pub initial_token: Option<String>,

    name: String,
    pid: Option<u32>,
    status: NodeStatus,
}

impl Node {
    /// Creates a node that has never been started.
    #[must_use]
    pub fn new(name: impl Into<String>, bindings: NetworkBindings) -> Self {
        Self {
            bindings,
            config: ConfigLayer::new(),
            extensions: IndexMap::new(),
            initial_token: None,
            name: name.into(),
            pid: None,
            status: NodeStatus::NotStarted,
        }
    }

    /// Sets the initial token.
    #[must_use]
    pub fn with_initial_token(mut self, token: impl Into<String>) -> Self {
        self.initial_token = Some(token.into());
        self
    }

    /// The node name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pid of the process believed to be running.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> NodeStatus {
        self.status
    }

    pub(crate) const fn set_pid(&mut self, pid: Option<u32>) {
        self.pid = pid;
    }

    pub(crate) const fn set_status(&mut self, status: NodeStatus) {
        self.status = status;
    }

    pub(crate) fn restore(&mut self, status: NodeStatus, pid: Option<u32>) {
        self.status = status;
        self.pid = pid;
    }
}

/// Everything that defines a cluster, as persisted between invocations.
#[derive(Clone, Debug, PartialEq)]
pub struct Cluster {
    /// Cluster-wide option overrides.
    pub config: ConfigLayer,

    /// Number of data directories per node.
    pub data_dir_count: usize,

    /// Unknown keys from the persisted record, written back unchanged.
    pub extensions: IndexMap<String, Value>,

    /// Log level of every node.
    pub log_level: LogLevel,

    /// Options for files other than the main configuration file.
    pub misc_config: serde_yaml::Mapping,

    /// Partitioner class.
    pub partitioner: String,

    /// Whether nodes use virtual nodes.
    pub use_vnodes: bool,

    /// The version nodes run.
    pub version: Version,

    directory: PathBuf,
    name: String,
    nodes: IndexMap<String, Node>,
    seeds: Vec<String>,
}

impl Cluster {
    /// Creates an empty cluster stored in `directory`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Argument` if the name is not usable as a directory.
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>, version: Version) -> Result<Self> {
        let name = name.into();
        validate_name("cluster", &name)?;

        Ok(Self {
            config: ConfigLayer::new(),
            data_dir_count: 1,
            extensions: IndexMap::new(),
            log_level: LogLevel::default(),
            misc_config: serde_yaml::Mapping::new(),
            partitioner: DEFAULT_PARTITIONER.to_string(),
            use_vnodes: false,
            version,
            directory: directory.into(),
            name,
            nodes: IndexMap::new(),
            seeds: Vec::new(),
        })
    }

    /// The cluster name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding the record and every node directory.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Directory of one node.
    #[must_use]
    pub fn node_directory(&self, node: &str) -> PathBuf {
        self.directory.join(node)
    }

    /// Install directory of the version.
    #[must_use]
    pub fn install_dir(&self) -> &Path {
        &self.version.directory
    }

    /// Nodes in their persisted order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Node names in their persisted order.
    #[must_use]
    pub fn node_names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the cluster has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Looks up a node.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    /// Looks up a node for mutation.
    pub fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.get_mut(name)
    }

    /// Names of the seed nodes.
    #[must_use]
    pub fn seeds(&self) -> &[String] {
        &self.seeds
    }

    /// Addresses of the seed nodes, in seed order.
    #[must_use]
    pub fn seed_addresses(&self) -> Vec<IpAddr> {
        self.seeds
            .iter()
            .filter_map(|seed| self.nodes.get(seed))
            .map(|node| node.bindings.address)
            .collect()
    }

    /// Adds a node, optionally as a seed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Argument` if the name is taken or its bindings clash
    /// with an existing node.
    pub fn add_node(&mut self, node: Node, is_seed: bool) -> Result<()> {
        validate_name("node", node.name())?;

        if self.nodes.contains_key(node.name()) {
            return Err(Error::Argument(format!(
                "cannot create existing node {}",
                node.name()
            )));
        }

        if let Some(other) = self.nodes.values().find(|other| {
            other.bindings.address == node.bindings.address
                || other.bindings.jmx_port == node.bindings.jmx_port
        }) {
            return Err(Error::Argument(format!(
                "node {} would use the same address or jmx port as {}",
                node.name(),
                other.name()
            )));
        }

        if is_seed {
            self.seeds.push(node.name().to_string());
        }
        self.nodes.insert(node.name().to_string(), node);

        Ok(())
    }

    /// Replaces the seed list.
    ///
    /// # Errors
    ///
    /// Returns `Error::Argument` if a seed is not a node of the cluster.
    pub fn set_seeds(&mut self, seeds: Vec<String>) -> Result<()> {
        if let Some(unknown) = seeds.iter().find(|seed| !self.nodes.contains_key(*seed)) {
            return Err(Error::Argument(format!(
                "seed {unknown} is not a node of cluster {}",
                self.name
            )));
        }

        self.seeds = seeds;
        Ok(())
    }

    /// Removes a node from the topology and the seed list.
    pub fn remove_node(&mut self, name: &str) -> Option<Node> {
        self.seeds.retain(|seed| seed != name);
        self.nodes.shift_remove(name)
    }

    /// Adds `count` nodes named `node1`, `node2`, and so on, all of them seeds.
    ///
    /// With vnodes disabled each node gets an evenly spaced initial token for
    /// the configured partitioner.
    ///
    /// # Errors
    ///
    /// Returns `Error::Argument` if the cluster already has nodes or `count`
    /// does not fit the loopback range.
    pub fn populate(&mut self, count: usize) -> Result<()> {
        if !self.nodes.is_empty() {
            return Err(Error::Argument(format!(
                "cluster {} is already populated",
                self.name
            )));
        }

        let count = u8::try_from(count)
            .ok()
            .filter(|count| (1..=254).contains(count))
            .ok_or_else(|| Error::Argument(format!("cannot populate {count} nodes")))?;

        for index in 1..=count {
            let mut node = Node::new(format!("node{index}"), NetworkBindings::for_index(index)?);
            if !self.use_vnodes {
                node.initial_token = initial_token(&self.partitioner, index, count);
            }
            self.add_node(node, true)?;
        }

        Ok(())
    }

    pub(crate) fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    pub(crate) fn restore_topology(
        &mut self,
        nodes: IndexMap<String, Node>,
        seeds: Vec<String>,
    ) -> std::result::Result<(), String> {
        if let Some(unknown) = seeds.iter().find(|seed| !nodes.contains_key(*seed)) {
            return Err(unknown.clone());
        }

        self.nodes = nodes;
        self.seeds = seeds;
        Ok(())
    }
}

/// Evenly spaced token for node `index` of `count`.
fn initial_token(partitioner: &str, index: u8, count: u8) -> Option<String> {
    let position = i128::from(index - 1);
    let count = i128::from(count);

    if partitioner.ends_with("Murmur3Partitioner") {
        let span = 1_i128 << 64;
        Some((position * span / count - (1_i128 << 63)).to_string())
    } else if partitioner.ends_with("RandomPartitioner") {
        let span = 1_i128 << 127;
        Some((position * (span / count)).to_string())
    } else {
        None
    }
}

pub(crate) fn validate_name(kind: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.starts_with('.');

    if valid {
        Ok(())
    } else {
        Err(Error::Argument(format!("invalid {kind} name {name:?}")))
    }
}
