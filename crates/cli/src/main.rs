//! CLI binary to manage local database clusters.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use ringmaster_cluster::config::DEFAULT_BATCH_WINDOW_MS;
use ringmaster_cluster::{
    ClusterStore, ConfigLayer, DEFAULT_PARALLELISM, DEFAULT_PARTITIONER, DEFAULT_READY_TIMEOUT, LocalCluster,
    LogLevel, NodetoolOutput, ReadyWait, StartOptions, StopMode,
};
use ringmaster_repository::{RepositoryConfig, VersionRepository, VersionSpec};
use serde_yaml::Value;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Directory under the storage root holding cached versions.
const REPOSITORY_DIR: &str = "repository";

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid command line argument
    #[error("{0}")]
    Argument(String),

    /// Cluster library error
    #[error(transparent)]
    Cluster(#[from] ringmaster_cluster::Error),

    /// No storage root could be determined
    #[error("cannot determine the home directory, use --root")]
    NoHome,

    /// Version repository error
    #[error(transparent)]
    Repository(#[from] ringmaster_repository::Error),
}

impl Error {
    fn stderr(&self) -> &[String] {
        match self {
            Self::Cluster(e) => e.stderr(),
            _ => &[],
        }
    }
}

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Storage root for clusters and cached versions
    #[arg(long, global = true, env = "RINGMASTER_ROOT")]
    root: Option<PathBuf>,

    /// Archive mirror release tarballs are downloaded from
    #[arg(long, global = true, env = "RINGMASTER_ARCHIVE_URL")]
    archive_url: Option<String>,

    /// Git repository development branches are cloned from
    #[arg(long, global = true, env = "RINGMASTER_GIT_URL")]
    git_url: Option<String>,

    /// How many nodes are started or stopped at once
    #[arg(
        long,
        global = true,
        default_value_t = DEFAULT_PARALLELISM,
        env = "RINGMASTER_PARALLELISM"
    )]
    parallelism: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a cluster and make it current
    Create(CreateArgs),

    /// List clusters, marking the current one
    List,

    /// Make another cluster current
    Switch {
        /// Cluster name
        name: String,
    },

    /// Show the status of every node of the current cluster
    Status,

    /// Add a node to the current cluster
    Add {
        /// Node name
        name: String,

        /// Make the node a seed
        #[arg(short, long)]
        seed: bool,
    },

    /// Start every node of the current cluster
    Start(StartArgs),

    /// Stop every node of the current cluster
    Stop {
        /// Kill the nodes right away
        #[arg(long)]
        force: bool,
    },

    /// Change options and rewrite every node's configuration
    Updateconf(UpdateConfArgs),

    /// Stop every node and delete a cluster (the current one by default)
    Remove {
        /// Cluster name
        name: Option<String>,
    },

    /// Delete every cached version
    CleanRepository,

    /// Operate on a single node of the current cluster
    Node {
        /// Node name
        name: String,

        #[command(subcommand)]
        command: NodeCommand,
    },

    /// Run the admin tool against every running node
    Nodetool {
        /// Arguments passed to the tool
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(Debug, Args)]
struct CreateArgs {
    /// Cluster name
    name: String,

    /// Release version to download and build
    #[arg(short = 'v', long, conflicts_with_all = ["git", "install_dir"])]
    release: Option<String>,

    /// Development branch to clone and build
    #[arg(long, conflicts_with = "install_dir")]
    git: Option<String>,

    /// Existing install directory to use as is
    #[arg(long)]
    install_dir: Option<PathBuf>,

    /// Number of nodes to populate, all of them seeds
    #[arg(short, long, default_value_t = 0)]
    nodes: usize,

    /// Partitioner class, or one of murmur3, random, ordered
    #[arg(short, long)]
    partitioner: Option<String>,

    /// Use virtual nodes instead of fixed tokens
    #[arg(long)]
    vnodes: bool,

    /// Data directories per node
    #[arg(long, default_value_t = 1)]
    data_dirs: usize,

    /// Node log level
    #[arg(long)]
    log_level: Option<String>,

    /// Start the nodes once created
    #[arg(short, long)]
    start: bool,
}

#[derive(Debug, Args)]
struct StartArgs {
    /// Return once the process is alive instead of waiting for readiness
    #[arg(long)]
    no_wait: bool,

    /// Seconds to wait for readiness
    #[arg(long, env = "RINGMASTER_READY_TIMEOUT")]
    timeout: Option<u64>,

    /// Start without joining the ring
    #[arg(long)]
    dont_join_ring: bool,

    /// Report every started process
    #[arg(long)]
    verbose: bool,
}

impl StartArgs {
    fn options(&self) -> StartOptions {
        let wait = if self.no_wait {
            ReadyWait::NoWait
        } else {
            ReadyWait::Wait(
                self.timeout
                    .map_or(DEFAULT_READY_TIMEOUT, Duration::from_secs),
            )
        };

        StartOptions {
            join_ring: !self.dont_join_ring,
            wait,
        }
    }
}

#[derive(Debug, Args)]
struct UpdateConfArgs {
    /// Options to set, as `key: value`
    options: Vec<String>,

    /// Options to drop so the shipped default applies again
    #[arg(long = "unset", value_name = "KEY")]
    unset: Vec<String>,

    /// Disable hinted handoff
    #[arg(long, conflicts_with = "hh")]
    no_hh: bool,

    /// Enable hinted handoff
    #[arg(long)]
    hh: bool,

    /// Use batch commitlog sync
    #[arg(long)]
    batch_cl: bool,

    /// RPC timeout in milliseconds
    #[arg(long, value_name = "MS")]
    rt: Option<u64>,

    /// Node log level
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Debug, Subcommand)]
enum NodeCommand {
    /// Start the node
    Start(StartArgs),

    /// Stop the node
    Stop {
        /// Kill the node right away
        #[arg(long)]
        force: bool,
    },

    /// Stop the node and remove it from the cluster
    Remove,

    /// Set or drop option overrides of this node and rewrite its files
    Updateconf {
        /// Options to set, as `key: value`
        options: Vec<String>,

        /// Options to drop so the cluster value applies again
        #[arg(long = "unset", value_name = "KEY")]
        unset: Vec<String>,
    },

    /// Run the admin tool against the node
    Nodetool {
        /// Arguments passed to the tool
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

/// Store and repository shared by every command.
struct Context {
    parallelism: usize,
    repository: Arc<VersionRepository>,
    store: ClusterStore,
}

impl Context {
    fn new(cli: &Cli) -> Result<Self, Error> {
        let root = match &cli.root {
            Some(root) => root.clone(),
            None => dirs::home_dir().ok_or(Error::NoHome)?.join(".ringmaster"),
        };

        let mut config = RepositoryConfig::new(root.join(REPOSITORY_DIR));
        if let Some(url) = &cli.archive_url {
            config = config.with_archive_url(url);
        }
        if let Some(url) = &cli.git_url {
            config = config.with_git_url(url);
        }

        Ok(Self {
            parallelism: cli.parallelism,
            repository: Arc::new(VersionRepository::new(config)),
            store: ClusterStore::new(root),
        })
    }

    async fn current(&self) -> Result<LocalCluster, Error> {
        let cluster = LocalCluster::load_current(self.store.clone(), self.repository.clone())
            .await?
            .with_parallelism(self.parallelism);
        Ok(cluster)
    }

    async fn named(&self, name: &str) -> Result<LocalCluster, Error> {
        let cluster = LocalCluster::load(self.store.clone(), self.repository.clone(), name)
            .await?
            .with_parallelism(self.parallelism);
        Ok(cluster)
    }
}

fn partitioner_class(name: &str) -> String {
    match name {
        "m" | "murmur3" => DEFAULT_PARTITIONER.to_string(),
        "r" | "random" => "org.apache.cassandra.dht.RandomPartitioner".to_string(),
        "o" | "ordered" => "org.apache.cassandra.dht.ByteOrderedPartitioner".to_string(),
        class => class.to_string(),
    }
}

fn parse_log_level(level: &str) -> Result<LogLevel, Error> {
    level.parse().map_err(Error::Cluster)
}

/// Splits `key: value`, reading the value as YAML.
fn parse_option(option: &str) -> Result<(String, Value), Error> {
    let (key, value) = option
        .split_once(':')
        .or_else(|| option.split_once('='))
        .ok_or_else(|| Error::Argument(format!("expected key: value, got {option:?}")))?;

    let key = key.trim();
    if key.is_empty() {
        return Err(Error::Argument(format!("missing key in {option:?}")));
    }

    let value = value.trim();
    let value = serde_yaml::from_str(value).unwrap_or_else(|_| Value::from(value));
    Ok((key.to_string(), value))
}

fn exit_code(status: std::process::ExitStatus) -> ExitCode {
    status
        .code()
        .and_then(|code| u8::try_from(code).ok())
        .map_or(ExitCode::FAILURE, ExitCode::from)
}

fn relay(output: &NodetoolOutput) {
    print!("{}", output.stdout);
    eprint!("{}", output.stderr);
}

fn report_failure(node: &str, err: &ringmaster_cluster::Error) {
    error!("{node}: {err}");
    for line in err.stderr() {
        eprintln!("  {line}");
    }
}

async fn start_all(cluster: &mut LocalCluster, args: &StartArgs) -> Result<ExitCode, Error> {
    let mut code = ExitCode::SUCCESS;

    for (node, outcome) in cluster.start_all(args.options()).await? {
        match outcome {
            Ok(handle) if args.verbose => info!("started {node} with pid {}", handle.pid()),
            Ok(_) => {}
            Err(err) => {
                report_failure(&node, &err);
                code = ExitCode::FAILURE;
            }
        }
    }

    Ok(code)
}

async fn create(ctx: &Context, args: CreateArgs) -> Result<ExitCode, Error> {
    if args.name == REPOSITORY_DIR {
        return Err(Error::Argument(format!(
            "cluster name {REPOSITORY_DIR} is reserved"
        )));
    }

    let mut builder = LocalCluster::builder(&args.name)
        .with_nodes(args.nodes)
        .with_vnodes(args.vnodes)
        .with_data_dirs(args.data_dirs)
        .with_parallelism(ctx.parallelism);

    builder = match (args.install_dir, args.release, args.git) {
        (Some(dir), _, _) => builder.with_install_dir(dir),
        (None, Some(release), _) => builder.with_version(VersionSpec::Release(release)),
        (None, None, Some(branch)) => builder.with_version(VersionSpec::Branch(branch)),
        (None, None, None) => {
            return Err(Error::Argument(
                "one of --release, --git or --install-dir is required".to_string(),
            ));
        }
    };

    if let Some(partitioner) = &args.partitioner {
        builder = builder.with_partitioner(partitioner_class(partitioner));
    }
    if let Some(level) = &args.log_level {
        builder = builder.with_log_level(parse_log_level(level)?);
    }

    let mut cluster = builder
        .create(ctx.store.clone(), ctx.repository.clone())
        .await?;
    info!("current cluster is now {}", cluster.name());

    if args.start {
        let start = StartArgs {
            no_wait: false,
            timeout: None,
            dont_join_ring: false,
            verbose: false,
        };
        return start_all(&mut cluster, &start).await;
    }

    Ok(ExitCode::SUCCESS)
}

async fn update_configuration(ctx: &Context, args: UpdateConfArgs) -> Result<ExitCode, Error> {
    let mut cluster = ctx.current().await?;

    let options = parse_options(&args.options)?;

    if let Some(level) = &args.log_level {
        cluster.set_log_level(parse_log_level(level)?);
    }

    let config = cluster.configuration_mut();
    if args.no_hh {
        config.hinted_handoff(false);
    } else if args.hh {
        config.hinted_handoff(true);
    }
    if args.batch_cl {
        config.batch_commitlog(DEFAULT_BATCH_WINDOW_MS);
    }
    if let Some(timeout) = args.rt {
        config.rpc_timeout(timeout);
    }
    apply_options(config, options, &args.unset);

    cluster.update_configuration().await?;
    Ok(ExitCode::SUCCESS)
}

fn parse_options(options: &[String]) -> Result<Vec<(String, Value)>, Error> {
    options.iter().map(|option| parse_option(option)).collect()
}

fn apply_options(config: &mut ConfigLayer, options: Vec<(String, Value)>, unset: &[String]) {
    for (key, value) in options {
        config.set(key, value);
    }
    for key in unset {
        if !config.unset(key) {
            warn!("option {key} was not set");
        }
    }
}

async fn node_command(ctx: &Context, name: &str, command: NodeCommand) -> Result<ExitCode, Error> {
    let mut cluster = ctx.current().await?;

    match command {
        NodeCommand::Start(args) => {
            let handle = cluster.start_node(name, args.options()).await?;
            if args.verbose {
                info!("started {name} with pid {}", handle.pid());
            }
        }
        NodeCommand::Stop { force } => {
            let mode = if force { StopMode::Forced } else { StopMode::Graceful };
            if !cluster.stop_node(name, mode).await? {
                warn!("{name} is not running");
            }
        }
        NodeCommand::Remove => cluster.remove_node(name).await?,
        NodeCommand::Updateconf { options, unset } => {
            let options = parse_options(&options)?;
            apply_options(cluster.node_configuration_mut(name)?, options, &unset);
            cluster.update_configuration().await?;
        }
        NodeCommand::Nodetool { args } => {
            let output = cluster.nodetool(name, &args).await?;
            relay(&output);
            return Ok(exit_code(output.status));
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn run(cli: Cli) -> Result<ExitCode, Error> {
    let ctx = Context::new(&cli)?;

    match cli.command {
        Command::Create(args) => return create(&ctx, args).await,
        Command::List => {
            let current = ctx.store.current().await?;
            for name in ctx.store.list().await? {
                let marker = if current.as_deref() == Some(name.as_str()) {
                    '*'
                } else {
                    ' '
                };
                println!("{marker} {name}");
            }
        }
        Command::Switch { name } => ctx.store.set_current(&name).await?,
        Command::Status => {
            let mut cluster = ctx.current().await?;
            println!("Cluster: {}", cluster.name());
            for (node, status) in cluster.status().await? {
                println!("{node}: {status}");
            }
        }
        Command::Add { name, seed } => ctx.current().await?.add_node(&name, seed).await?,
        Command::Start(args) => return start_all(&mut ctx.current().await?, &args).await,
        Command::Stop { force } => {
            let mode = if force { StopMode::Forced } else { StopMode::Graceful };
            let report = ctx.current().await?.stop_all(mode).await?;
            for (node, err) in &report.failed {
                report_failure(node, err);
            }
            if !report.is_success() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Updateconf(args) => return update_configuration(&ctx, args).await,
        Command::Remove { name } => {
            let cluster = match name {
                Some(name) => ctx.named(&name).await?,
                None => ctx.current().await?,
            };
            cluster.remove().await?;
        }
        Command::CleanRepository => ctx.repository.clean().await?,
        Command::Node { name, command } => return node_command(&ctx, &name, command).await,
        Command::Nodetool { args } => {
            let cluster = ctx.current().await?;
            let mut code = ExitCode::SUCCESS;
            for (node, outcome) in cluster.nodetool_all(&args).await {
                println!("{node}:");
                match outcome {
                    Ok(output) => {
                        relay(&output);
                        if !output.status.success() {
                            code = exit_code(output.status);
                        }
                    }
                    Err(err) => {
                        report_failure(&node, &err);
                        code = ExitCode::FAILURE;
                    }
                }
            }
            return Ok(code);
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            for line in err.stderr() {
                eprintln!("  {line}");
            }
            ExitCode::FAILURE
        }
    }
}
