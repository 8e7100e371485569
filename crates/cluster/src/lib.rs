//! Local multi-node database clusters.
//!
//! A cluster is a set of database nodes running as plain processes on this
//! machine, each bound to its own loopback address. Cluster definitions are
//! stored on disk so later invocations can pick them up, start and stop
//! nodes, and rewrite their configuration.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use ringmaster_cluster::{ClusterStore, LocalCluster, StartOptions, StopMode};
//! use ringmaster_repository::{RepositoryConfig, VersionRepository, VersionSpec};
//!
//! async fn run() -> ringmaster_cluster::Result<()> {
//!     let repository = Arc::new(VersionRepository::new(RepositoryConfig::new(
//!         "/tmp/ringmaster/repository",
//!     )));
//!     let store = ClusterStore::new("/tmp/ringmaster");
//!
//!     let mut cluster = LocalCluster::builder("test")
//!         .with_version(VersionSpec::Release("3.11.4".to_string()))
//!         .with_nodes(3)
//!         .create(store, repository)
//!         .await?;
//!
//!     for (node, outcome) in cluster.start_all(StartOptions::default()).await? {
//!         if let Err(err) = outcome {
//!             eprintln!("{node}: {err}");
//!         }
//!     }
//!
//!     cluster.stop_all(StopMode::Graceful).await?;
//!     Ok(())
//! }
//! ```
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

mod cluster;
pub mod config;
mod error;
mod process;
mod store;
mod topology;

pub use cluster::{ClusterBuilder, DEFAULT_PARALLELISM, LocalCluster, StopReport};
pub use config::{ConfigLayer, EffectiveConfig, merge};
pub use error::{Error, LoadError, Result};
pub use process::{
    ClusterContext, DEFAULT_READY_PATTERN, DEFAULT_READY_TIMEOUT, DEFAULT_SHUTDOWN_TIMEOUT,
    NO_WAIT_GRACE, NodeProcessManager, NodetoolOutput, ProcessHandle, ReadyWait, StartOptions,
    StopMode,
};
pub use store::ClusterStore;
pub use topology::{
    Cluster, DEFAULT_PARTITIONER, LogLevel, NetworkBindings, Node, NodeStatus,
};
