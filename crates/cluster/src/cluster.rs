//! Main cluster management implementation

use std::path::PathBuf;
use std::sync::Arc;

use futures::{StreamExt, stream};
use ringmaster_repository::{VersionRepository, VersionSpec, local_version};
use ringmaster_util::port_allocator::loopback_address;
use serde_yaml::Value;
use tracing::{info, warn};

use crate::config::ConfigLayer;
use crate::error::{Error, Result};
use crate::process::{
    ClusterContext, NodeProcessManager, NodetoolOutput, ProcessHandle, StartOptions, StopMode,
};
use crate::store::ClusterStore;
use crate::topology::{Cluster, LogLevel, NetworkBindings, Node, NodeStatus, validate_name};

/// How many nodes are started or stopped at once by default.
pub const DEFAULT_PARALLELISM: usize = 4;

/// Outcome of stopping every node.
#[derive(Debug, Default)]
pub struct StopReport {
    /// Nodes that were running and are now stopped.
    pub stopped: Vec<String>,

    /// Nodes that were not running.
    pub not_running: Vec<String>,

    /// Nodes that could not be stopped.
    pub failed: Vec<(String, Error)>,
}

impl StopReport {
    /// Whether every running node was stopped.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A cluster bound to its store, version repository and process manager.
#[derive(Debug)]
pub struct LocalCluster {
    cluster: Cluster,
    manager: NodeProcessManager,
    parallelism: usize,
    repository: Arc<VersionRepository>,
    store: ClusterStore,
}

impl LocalCluster {
    /// Create a new cluster builder
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ClusterBuilder {
        ClusterBuilder::new(name)
    }

    /// Loads a stored cluster and checks which of its nodes are still alive.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is missing or invalid, or its version
    /// can no longer be made ready.
    pub async fn load(
        store: ClusterStore,
        repository: Arc<VersionRepository>,
        name: &str,
    ) -> Result<Self> {
        if !store.exists(name) {
            return Err(Error::Argument(format!("cluster {name} does not exist")));
        }

        let cluster = store.load(name, &repository).await?;
        let mut local = Self {
            cluster,
            manager: NodeProcessManager::default(),
            parallelism: DEFAULT_PARALLELISM,
            repository,
            store,
        };

        if local.refresh() {
            local.save().await?;
        }

        Ok(local)
    }

    /// Loads the cluster named by the store's current marker.
    ///
    /// # Errors
    ///
    /// Returns `Error::Argument` if no cluster is current.
    pub async fn load_current(store: ClusterStore, repository: Arc<VersionRepository>) -> Result<Self> {
        let name = store
            .current()
            .await?
            .ok_or_else(|| Error::Argument("no current cluster defined".to_string()))?;

        Self::load(store, repository, &name).await
    }

    /// Replaces the process manager.
    #[must_use]
    pub fn with_process_manager(mut self, manager: NodeProcessManager) -> Self {
        self.manager = manager;
        self
    }

    /// Sets how many nodes are started or stopped at once.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// The cluster definition.
    #[must_use]
    pub const fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// The cluster name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.cluster.name()
    }

    /// The version repository backing this cluster.
    #[must_use]
    pub const fn repository(&self) -> &Arc<VersionRepository> {
        &self.repository
    }

    /// Persists the cluster record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record could not be written.
    pub async fn save(&self) -> Result<()> {
        self.store.save(&self.cluster).await
    }

    // --- Topology ---

    /// Adds a node with the next free loopback address.
    ///
    /// # Errors
    ///
    /// Returns `Error::Argument` if the name is taken or no address is left.
    pub async fn add_node(&mut self, name: &str, is_seed: bool) -> Result<()> {
        validate_name("node", name)?;

        let index = (1..=u8::MAX)
            .find(|index| {
                let address = loopback_address(*index);
                self.cluster.nodes().all(|node| node.bindings.address != address)
            })
            .ok_or_else(|| Error::Argument("no loopback address left".to_string()))?;

        let node = Node::new(name, NetworkBindings::for_index(index)?);
        self.cluster.add_node(node, is_seed)?;
        self.save().await?;

        info!("added node {name} to cluster {}", self.name());
        Ok(())
    }

    // --- Configuration ---

    /// Sets a cluster-wide option. Takes effect on the next configuration
    /// update or start.
    pub fn set_configuration_option(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.cluster.config.set(key, value);
    }

    /// Drops a cluster-wide option so the file default applies again.
    pub fn unset_configuration_option(&mut self, key: &str) -> bool {
        self.cluster.config.unset(key)
    }

    /// Deletes an option from every node's configuration file.
    pub fn remove_configuration_option(&mut self, key: impl Into<String>) {
        self.cluster.config.remove(key);
    }

    /// Cluster-wide options, for the named setters.
    pub fn configuration_mut(&mut self) -> &mut ConfigLayer {
        &mut self.cluster.config
    }

    /// Per-node options of one node.
    ///
    /// # Errors
    ///
    /// Returns `Error::Argument` if the node does not exist.
    pub fn node_configuration_mut(&mut self, node: &str) -> Result<&mut ConfigLayer> {
        self.cluster
            .node_mut(node)
            .map(|node| &mut node.config)
            .ok_or_else(|| node_not_found(node))
    }

    /// Sets the node log level.
    pub const fn set_log_level(&mut self, level: LogLevel) {
        self.cluster.log_level = level;
    }

    /// Rewrites every node's configuration files without restarting.
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration file could not be written.
    pub async fn update_configuration(&self) -> Result<()> {
        let ctx = ClusterContext::of(&self.cluster);
        for node in self.cluster.nodes() {
            self.manager.write_configuration(node, &ctx).await?;
        }

        self.save().await?;
        info!("updated configuration of cluster {}", self.name());
        Ok(())
    }

    // --- Lifecycle ---

    /// Starts every node that is not running, in node order.
    ///
    /// A failing node does not prevent the others from starting. Returns one
    /// outcome per attempted node; pid and status of every attempt are
    /// persisted.
    ///
    /// # Errors
    ///
    /// Returns an error only if the record could not be saved afterwards.
    pub async fn start_all(
        &mut self,
        options: StartOptions,
    ) -> Result<Vec<(String, Result<ProcessHandle>)>> {
        self.refresh();

        let pending: Vec<Node> = self
            .cluster
            .nodes()
            .filter(|node| node.status() != NodeStatus::Running)
            .cloned()
            .collect();

        let attempts = {
            let ctx = ClusterContext::of(&self.cluster);
            let ctx = &ctx;
            let manager = &self.manager;

            stream::iter(pending)
                .map(move |mut node| async move {
                    let result = manager.start(&mut node, ctx, options).await;
                    (node, result)
                })
                .buffered(self.parallelism)
                .collect::<Vec<_>>()
                .await
        };

        let mut outcomes = Vec::with_capacity(attempts.len());
        for (node, result) in attempts {
            if let Err(err) = &result {
                warn!("{err}");
            }
            let name = node.name().to_string();
            self.replace_node(node);
            outcomes.push((name, result));
        }

        self.save().await?;
        Ok(outcomes)
    }

    /// Stops every node.
    ///
    /// # Errors
    ///
    /// Returns an error only if the record could not be saved afterwards;
    /// per-node failures are listed in the report.
    pub async fn stop_all(&mut self, mode: StopMode) -> Result<StopReport> {
        self.refresh();

        let nodes: Vec<Node> = self.cluster.nodes().cloned().collect();

        let manager = &self.manager;
        let attempts = stream::iter(nodes)
            .map(move |mut node| async move {
                let result = manager.stop(&mut node, mode).await;
                (node, result)
            })
            .buffered(self.parallelism)
            .collect::<Vec<_>>()
            .await;

        let mut report = StopReport::default();
        for (node, result) in attempts {
            let name = node.name().to_string();
            self.replace_node(node);
            match result {
                Ok(true) => report.stopped.push(name),
                Ok(false) => report.not_running.push(name),
                Err(err) => {
                    warn!("{err}");
                    report.failed.push((name, err));
                }
            }
        }

        self.save().await?;
        Ok(report)
    }

    /// Starts one node.
    ///
    /// # Errors
    ///
    /// Returns an error if the node does not exist or fails to start. The
    /// outcome is persisted either way.
    pub async fn start_node(&mut self, name: &str, options: StartOptions) -> Result<ProcessHandle> {
        let mut node = self.node(name)?.clone();

        let result = {
            let ctx = ClusterContext::of(&self.cluster);
            self.manager.start(&mut node, &ctx, options).await
        };

        self.replace_node(node);
        self.save().await?;
        result
    }

    /// Stops one node. Returns `false` if it was not running.
    ///
    /// # Errors
    ///
    /// Returns an error if the node does not exist or survives termination.
    pub async fn stop_node(&mut self, name: &str, mode: StopMode) -> Result<bool> {
        self.refresh();

        let mut node = self.node(name)?.clone();
        let result = self.manager.stop(&mut node, mode).await;

        self.replace_node(node);
        self.save().await?;
        result
    }

    /// Stops a node and removes it from the cluster along with its directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the node cannot be stopped or its files removed.
    pub async fn remove_node(&mut self, name: &str) -> Result<()> {
        self.stop_node(name, StopMode::Graceful).await?;
        self.cluster.remove_node(name);

        let node_dir = self.cluster.node_directory(name);
        if tokio::fs::try_exists(&node_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&node_dir)
                .await
                .map_err(|e| Error::Io("failed to remove node directory", e))?;
        }

        self.save().await?;
        info!("removed node {name} from cluster {}", self.name());
        Ok(())
    }

    /// Stops every node and deletes the cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if a node survives termination or the directory
    /// cannot be removed.
    pub async fn remove(mut self) -> Result<()> {
        let report = self.stop_all(StopMode::Graceful).await?;
        if let Some((_, err)) = report.failed.into_iter().next() {
            return Err(err);
        }

        self.store.remove(self.cluster.name()).await
    }

    /// Current status of every node, after checking for crashed processes.
    ///
    /// # Errors
    ///
    /// Returns an error if a changed status could not be persisted.
    pub async fn status(&mut self) -> Result<Vec<(String, NodeStatus)>> {
        if self.refresh() {
            self.save().await?;
        }

        Ok(self
            .cluster
            .nodes()
            .map(|node| (node.name().to_string(), node.status()))
            .collect())
    }

    // --- Admin tool ---

    /// Runs the admin tool against one node.
    ///
    /// # Errors
    ///
    /// Returns an error if the node does not exist or the tool cannot run.
    pub async fn nodetool(&self, name: &str, args: &[String]) -> Result<NodetoolOutput> {
        let node = self.node(name)?;
        let ctx = ClusterContext::of(&self.cluster);

        self.manager.nodetool(node, &ctx, args).await
    }

    /// Runs the admin tool against every running node, in node order.
    pub async fn nodetool_all(&self, args: &[String]) -> Vec<(String, Result<NodetoolOutput>)> {
        let ctx = ClusterContext::of(&self.cluster);
        let mut outcomes = Vec::new();

        for node in self.cluster.nodes() {
            if NodeProcessManager::is_running(node) {
                let result = self.manager.nodetool(node, &ctx, args).await;
                outcomes.push((node.name().to_string(), result));
            }
        }

        outcomes
    }

    fn node(&self, name: &str) -> Result<&Node> {
        self.cluster.node(name).ok_or_else(|| node_not_found(name))
    }

    fn replace_node(&mut self, node: Node) {
        if let Some(slot) = self.cluster.node_mut(node.name()) {
            *slot = node;
        }
    }

    fn refresh(&mut self) -> bool {
        let mut changed = false;
        for node in self.cluster.nodes_mut() {
            changed |= NodeProcessManager::refresh(node);
        }
        changed
    }
}

fn node_not_found(name: &str) -> Error {
    Error::Argument(format!("node {name} not found"))
}

/// Creates a new cluster.
#[derive(Debug)]
pub struct ClusterBuilder {
    config: ConfigLayer,
    data_dir_count: usize,
    install_dir: Option<PathBuf>,
    log_level: LogLevel,
    manager: NodeProcessManager,
    name: String,
    node_count: usize,
    parallelism: usize,
    partitioner: Option<String>,
    use_vnodes: bool,
    version: Option<VersionSpec>,
}

impl ClusterBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            config: ConfigLayer::new(),
            data_dir_count: 1,
            install_dir: None,
            log_level: LogLevel::default(),
            manager: NodeProcessManager::default(),
            name: name.into(),
            node_count: 0,
            parallelism: DEFAULT_PARALLELISM,
            partitioner: None,
            use_vnodes: false,
            version: None,
        }
    }

    /// Use a version from the repository.
    #[must_use]
    pub fn with_version(mut self, version: VersionSpec) -> Self {
        self.version = Some(version);
        self
    }

    /// Use an existing install directory instead of the repository.
    #[must_use]
    pub fn with_install_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.install_dir = Some(dir.into());
        self
    }

    /// Set the partitioner class
    #[must_use]
    pub fn with_partitioner(mut self, partitioner: impl Into<String>) -> Self {
        self.partitioner = Some(partitioner.into());
        self
    }

    /// Create `count` nodes, all of them seeds
    #[must_use]
    pub const fn with_nodes(mut self, count: usize) -> Self {
        self.node_count = count;
        self
    }

    /// Enable virtual nodes
    #[must_use]
    pub const fn with_vnodes(mut self, enabled: bool) -> Self {
        self.use_vnodes = enabled;
        self
    }

    /// Set the number of data directories per node
    #[must_use]
    pub const fn with_data_dirs(mut self, count: usize) -> Self {
        self.data_dir_count = count;
        self
    }

    /// Set the node log level
    #[must_use]
    pub const fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Set a cluster-wide option
    #[must_use]
    pub fn with_config_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.set(key, value);
        self
    }

    /// Use a custom process manager
    #[must_use]
    pub fn with_process_manager(mut self, manager: NodeProcessManager) -> Self {
        self.manager = manager;
        self
    }

    /// Set how many nodes are started or stopped at once
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Resolve the version, write the record and make the cluster current
    ///
    /// # Errors
    ///
    /// Returns `Error::Argument` if the cluster exists or the options are
    /// inconsistent, and a repository error if the version cannot be made
    /// ready.
    pub async fn create(
        self,
        store: ClusterStore,
        repository: Arc<VersionRepository>,
    ) -> Result<LocalCluster> {
        validate_name("cluster", &self.name)?;

        if store.exists(&self.name) {
            return Err(Error::Argument(format!(
                "cluster {} already exists",
                self.name
            )));
        }

        if self.data_dir_count == 0 {
            return Err(Error::Argument(
                "at least one data directory is required".to_string(),
            ));
        }

        let version = match (self.install_dir, self.version) {
            (Some(dir), _) => local_version(&dir)?,
            (None, Some(spec)) => repository.resolve(&spec).await?,
            (None, None) => {
                return Err(Error::Argument(
                    "either a version or an install directory is required".to_string(),
                ));
            }
        };

        let mut cluster = Cluster::new(&self.name, store.cluster_directory(&self.name), version)?;
        if let Some(partitioner) = self.partitioner {
            cluster.partitioner = partitioner;
        }
        cluster.config = self.config;
        cluster.data_dir_count = self.data_dir_count;
        cluster.log_level = self.log_level;
        cluster.use_vnodes = self.use_vnodes;

        if self.node_count > 0 {
            cluster.populate(self.node_count)?;
        }

        store.save(&cluster).await?;
        store.set_current(&self.name).await?;

        info!(
            "created cluster {} with {} nodes using {}",
            self.name,
            cluster.len(),
            cluster.install_dir().display()
        );

        Ok(LocalCluster {
            cluster,
            manager: self.manager,
            parallelism: self.parallelism,
            repository,
            store,
        })
    }
}
