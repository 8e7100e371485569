//! Persistence of clusters under a storage root.
//!
//! ```text
//! <root>/CURRENT                   name of the active cluster
//! <root>/<cluster>/cluster.conf    cluster record
//! <root>/<cluster>/<node>/node.conf
//! ```

use std::collections::BTreeMap;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use ringmaster_repository::{Origin, VersionRepository, VersionSpec};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::config::ConfigLayer;
use crate::error::{Error, LoadError, Result};
use crate::topology::{Cluster, LogLevel, NetworkBindings, Node, NodeStatus, validate_name};

/// File naming the active cluster.
const CURRENT_FILE: &str = "CURRENT";

/// Cluster record file name.
const CLUSTER_FILE: &str = "cluster.conf";

/// Node record file name.
const NODE_FILE: &str = "node.conf";

#[derive(Debug, Default, Deserialize, Serialize)]
struct ClusterRecord {
    name: Option<String>,
    version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version_origin: Option<Origin>,
    install_dir: Option<PathBuf>,
    partitioner: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    config_options: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    removed_config_options: Vec<String>,
    #[serde(default, skip_serializing_if = "Mapping::is_empty")]
    misc_config_options: Mapping,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    log_level: Option<LogLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    use_vnodes: Option<bool>,
    #[serde(default, rename = "datadirs", skip_serializing_if = "Option::is_none")]
    data_dir_count: Option<usize>,
    nodes: Option<Vec<String>>,
    seeds: Option<Vec<String>>,
    #[serde(flatten)]
    extensions: IndexMap<String, Value>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct NodeRecord {
    name: Option<String>,
    address: Option<IpAddr>,
    storage_port: Option<u16>,
    native_transport_port: Option<u16>,
    jmx_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<NodeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    initial_token: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    config_options: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    removed_config_options: Vec<String>,
    #[serde(flatten)]
    extensions: IndexMap<String, Value>,
}

/// Reads and writes cluster records.
#[derive(Clone, Debug)]
pub struct ClusterStore {
    root: PathBuf,
}

impl ClusterStore {
    /// Creates a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The storage root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a cluster.
    #[must_use]
    pub fn cluster_directory(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Whether a cluster record exists.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.cluster_directory(name).join(CLUSTER_FILE).is_file()
    }

    /// Writes the cluster record and one record per node.
    ///
    /// # Errors
    ///
    /// Returns an error if a record could not be written.
    pub async fn save(&self, cluster: &Cluster) -> Result<()> {
        let directory = cluster.directory();
        create_dir(directory).await?;

        let record = ClusterRecord {
            name: Some(cluster.name().to_string()),
            version: Some(cluster.version.identifier.clone()),
            version_origin: Some(cluster.version.origin),
            install_dir: Some(cluster.install_dir().to_path_buf()),
            partitioner: Some(cluster.partitioner.clone()),
            config_options: layer_values(&cluster.config),
            removed_config_options: cluster.config.removed().cloned().collect(),
            misc_config_options: cluster.misc_config.clone(),
            log_level: Some(cluster.log_level),
            use_vnodes: Some(cluster.use_vnodes),
            data_dir_count: Some(cluster.data_dir_count),
            nodes: Some(cluster.node_names()),
            seeds: Some(cluster.seeds().to_vec()),
            extensions: cluster.extensions.clone(),
        };
        write_record(&directory.join(CLUSTER_FILE), &record).await?;

        for node in cluster.nodes() {
            let node_dir = cluster.node_directory(node.name());
            create_dir(&node_dir).await?;

            let record = NodeRecord {
                name: Some(node.name().to_string()),
                address: Some(node.bindings.address),
                storage_port: Some(node.bindings.storage_port),
                native_transport_port: Some(node.bindings.native_transport_port),
                jmx_port: Some(node.bindings.jmx_port),
                status: Some(node.status()),
                pid: node.pid(),
                initial_token: node.initial_token.clone(),
                config_options: layer_values(&node.config),
                removed_config_options: node.config.removed().cloned().collect(),
                extensions: node.extensions.clone(),
            };
            write_record(&node_dir.join(NODE_FILE), &record).await?;
        }

        debug!("saved cluster {}", cluster.name());
        Ok(())
    }

    /// Reads a cluster back, making sure its version is still usable.
    ///
    /// # Errors
    ///
    /// Returns `Error::Load` naming the file and field when a record is
    /// incomplete, and a repository error if the version cannot be restored.
    pub async fn load(&self, name: &str, repository: &VersionRepository) -> Result<Cluster> {
        validate_name("cluster", name)?;

        let directory = self.cluster_directory(name);
        let path = directory.join(CLUSTER_FILE);
        let record: ClusterRecord = read_record(&path).await?;

        let load_error = |reason: LoadError| Error::Load {
            path: path.clone(),
            reason,
        };

        let record_name = require(record.name, "name").map_err(load_error)?;
        let identifier = require(record.version, "version").map_err(load_error)?;
        let install_dir = require(record.install_dir, "install_dir").map_err(load_error)?;
        let partitioner = require(record.partitioner, "partitioner").map_err(load_error)?;
        let node_names = require(record.nodes, "nodes").map_err(load_error)?;
        let seeds = require(record.seeds, "seeds").map_err(load_error)?;

        let data_dir_count = record.data_dir_count.unwrap_or(1);
        if data_dir_count == 0 {
            return Err(load_error(LoadError::Invalid {
                field: "datadirs",
                reason: "at least one data directory is required".to_string(),
            }));
        }

        let spec = VersionSpec::from_parts(identifier, record.version_origin.unwrap_or_default());
        let version = repository.reopen(&spec, &install_dir).await?;

        let mut cluster = Cluster::new(record_name, directory, version)
            .map_err(|e| load_error(LoadError::Invalid {
                field: "name",
                reason: e.to_string(),
            }))?;
        cluster.partitioner = partitioner;
        cluster.config = ConfigLayer::from_parts(record.config_options, record.removed_config_options);
        cluster.misc_config = record.misc_config_options;
        cluster.log_level = record.log_level.unwrap_or_default();
        cluster.use_vnodes = record.use_vnodes.unwrap_or(false);
        cluster.data_dir_count = data_dir_count;
        cluster.extensions = record.extensions;

        let mut nodes = IndexMap::with_capacity(node_names.len());
        for node_name in node_names {
            validate_name("node", &node_name)?;
            let node = self
                .load_node(&cluster.node_directory(&node_name), &node_name)
                .await?;
            nodes.insert(node_name, node);
        }

        cluster
            .restore_topology(nodes, seeds)
            .map_err(|seed| load_error(LoadError::UnknownSeed(seed)))?;

        debug!("loaded cluster {name} with {} nodes", cluster.len());
        Ok(cluster)
    }

    async fn load_node(&self, node_dir: &Path, expected: &str) -> Result<Node> {
        let path = node_dir.join(NODE_FILE);

        let load_error = |reason: LoadError| Error::Load {
            path: path.clone(),
            reason,
        };

        if !tokio::fs::try_exists(&path)
            .await
            .map_err(|e| Error::Io("failed to read record", e))?
        {
            return Err(load_error(LoadError::MissingNode(expected.to_string())));
        }
        let record: NodeRecord = read_record(&path).await?;

        let bindings = NetworkBindings {
            address: require(record.address, "address").map_err(load_error)?,
            jmx_port: require(record.jmx_port, "jmx_port").map_err(load_error)?,
            native_transport_port: require(record.native_transport_port, "native_transport_port")
                .map_err(load_error)?,
            storage_port: require(record.storage_port, "storage_port").map_err(load_error)?,
        };
        let name = require(record.name, "name").map_err(load_error)?;
        if name != expected {
            return Err(load_error(LoadError::Invalid {
                field: "name",
                reason: format!("expected {expected}, found {name}"),
            }));
        }

        let mut node = Node::new(name, bindings);
        node.config = ConfigLayer::from_parts(record.config_options, record.removed_config_options);
        node.initial_token = record.initial_token;
        node.extensions = record.extensions;
        node.restore(record.status.unwrap_or_default(), record.pid);

        Ok(node)
    }

    /// Name of the active cluster, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker exists but cannot be read.
    pub async fn current(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.root.join(CURRENT_FILE)).await {
            Ok(contents) => {
                let name = contents.trim();
                Ok((!name.is_empty()).then(|| name.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io("failed to read current cluster", e)),
        }
    }

    /// Makes `name` the active cluster.
    ///
    /// # Errors
    ///
    /// Returns `Error::Argument` if no such cluster exists.
    pub async fn set_current(&self, name: &str) -> Result<()> {
        validate_name("cluster", name)?;
        if !self.exists(name) {
            return Err(Error::Argument(format!("cluster {name} does not exist")));
        }

        create_dir(&self.root).await?;
        tokio::fs::write(self.root.join(CURRENT_FILE), format!("{name}\n"))
            .await
            .map_err(|e| Error::Io("failed to write current cluster", e))
    }

    /// Forgets the active cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker cannot be removed.
    pub async fn clear_current(&self) -> Result<()> {
        match tokio::fs::remove_file(self.root.join(CURRENT_FILE)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io("failed to remove current cluster", e)),
        }
    }

    /// Names of every stored cluster, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be read.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io("failed to read storage root", e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Io("failed to read storage root", e))?
        {
            if let Some(name) = entry.file_name().to_str()
                && self.exists(name)
            {
                names.push(name.to_string());
            }
        }

        names.sort();
        Ok(names)
    }

    /// Deletes a cluster and all node state.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be removed.
    pub async fn remove(&self, name: &str) -> Result<()> {
        validate_name("cluster", name)?;

        let directory = self.cluster_directory(name);
        if tokio::fs::try_exists(&directory).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&directory)
                .await
                .map_err(|e| Error::Io("failed to remove cluster directory", e))?;
        }

        if self.current().await?.as_deref() == Some(name) {
            self.clear_current().await?;
        }

        info!("removed cluster {name}");
        Ok(())
    }
}

fn require<T>(value: Option<T>, field: &'static str) -> std::result::Result<T, LoadError> {
    value.ok_or(LoadError::MissingField(field))
}

fn layer_values(layer: &ConfigLayer) -> BTreeMap<String, Value> {
    layer
        .values()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

async fn create_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| Error::Io("failed to create cluster directory", e))
}

async fn read_record<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Io("failed to read record", e))?;

    serde_yaml::from_str(&contents).map_err(|e| Error::Load {
        path: path.to_path_buf(),
        reason: LoadError::Decode(e),
    })
}

async fn write_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let contents = serde_yaml::to_string(record).map_err(|source| Error::Yaml {
        path: path.to_path_buf(),
        source,
    })?;

    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let mut file = NamedTempFile::new_in(parent)?;
        file.write_all(contents.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(&path).map_err(|e| e.error)?;
        Ok::<_, std::io::Error>(())
    })
    .await
    .map_err(|e| Error::Io("failed to write record", std::io::Error::other(e)))?
    .map_err(|e| Error::Io("failed to write record", e))
}
