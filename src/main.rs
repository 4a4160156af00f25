use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use jobcoord::agent::JobExecution;
use jobcoord::catalog::ResourceCatalog;
use jobcoord::config::{
    AgentConfig, CleanupStrategy, HandshakeConfig, NodeConfig, PeerConfig, ServerConfig,
};
use jobcoord::model::{
    AgentClientMetadata, Criterion, ExecutionResourceCriteria, JobMetadata, JobRequest, KillSource,
};
use jobcoord::node::Node;
use jobcoord::rpc::LocalRpcClient;
use jobcoord::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "jobcoord")]
#[command(version)]
#[command(about = "Resolve jobs against a resource catalog and run them through agents")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a server node with its HTTP API
    Server(ServerArgs),

    /// Run one job in this process and exit with its exit code
    Run(RunArgs),

    /// Resolve a job request without running it and print the specification
    Resolve(ResolveArgs),
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Name this node is known by
    #[arg(long, default_value = "localhost")]
    hostname: String,

    /// Port for the HTTP API (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Resource catalog (JSON)
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// In-process peer node hostnames (comma-separated)
    #[arg(long, default_value = "")]
    peers: String,

    /// Agent connections with no heartbeat for this long are dropped
    #[arg(long, default_value = "10000")]
    connection_expiration_ms: u64,

    /// Job directory used when a request does not name one
    #[arg(long)]
    default_job_directory: Option<String>,

    /// Archive root; the job id is appended per job
    #[arg(long)]
    archive_location: Option<String>,

    /// Lowest agent version accepted at handshake
    #[arg(long)]
    minimum_agent_version: Option<String>,

    /// Agent versions matching this regex are rejected
    #[arg(long)]
    blocked_agent_versions: Option<String>,

    /// Property handed to agents during configuration (key=value, repeatable)
    #[arg(long = "agent-property", value_parser = parse_key_value)]
    agent_properties: Vec<(String, String)>,

    #[command(flatten)]
    agent: AgentArgs,
}

// =============================================================================
// Agent Arguments (shared by server and run)
// =============================================================================

#[derive(Parser, Debug)]
struct AgentArgs {
    /// What to delete from the job directory after the job
    #[arg(long, value_enum, default_value = "none")]
    cleanup: CleanupStrategy,

    /// Root for job directories when the specification leaves it blank
    #[arg(long)]
    job_directory_root: Option<PathBuf>,

    /// Time between SIGTERM and SIGKILL
    #[arg(long, default_value = "10000")]
    kill_graceful_window_ms: u64,

    /// Time to wait for exit after SIGKILL
    #[arg(long, default_value = "5000")]
    kill_forceful_window_ms: u64,
}

impl AgentArgs {
    fn to_config(&self) -> AgentConfig {
        let mut config = AgentConfig::default()
            .with_cleanup_strategy(self.cleanup)
            .with_kill_windows(self.kill_graceful_window_ms, self.kill_forceful_window_ms);
        if let Some(root) = &self.job_directory_root {
            config = config.with_job_directory_root(root.clone());
        }
        config
    }
}

// =============================================================================
// Job Arguments (shared by run and resolve)
// =============================================================================

#[derive(Parser, Debug)]
struct JobArgs {
    /// Resource catalog (JSON)
    #[arg(long)]
    catalog: PathBuf,

    /// Full job request as JSON; overrides the flags below
    #[arg(long)]
    request: Option<PathBuf>,

    #[arg(long, default_value = "job")]
    name: String,

    #[arg(long, default_value = "jobcoord")]
    user: String,

    #[arg(long, default_value = "0.0.1")]
    job_version: String,

    /// Cluster criterion as comma-separated tags; repeat for fallbacks in order
    #[arg(long = "cluster-tags", required_unless_present = "request")]
    cluster_tags: Vec<String>,

    /// Command criterion as comma-separated tags
    #[arg(long, required_unless_present = "request")]
    command_tags: Option<String>,

    /// Job timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Job directory root for this job
    #[arg(long)]
    job_directory: Option<String>,

    #[arg(long)]
    interactive: bool,

    #[arg(long)]
    no_archive: bool,

    /// Arguments appended to the command's executable
    #[arg(last = true)]
    args: Vec<String>,
}

impl JobArgs {
    fn to_request(&self) -> Result<JobRequest, Box<dyn std::error::Error>> {
        if let Some(path) = &self.request {
            let json = std::fs::read_to_string(path)?;
            return Ok(serde_json::from_str(&json)?);
        }

        let split = |tags: &str| -> Vec<String> {
            tags.split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        };
        let clusters = self
            .cluster_tags
            .iter()
            .map(|tags| Criterion::with_tags(split(tags)))
            .collect::<Result<Vec<_>, _>>()?;
        let command = Criterion::with_tags(split(self.command_tags.as_deref().unwrap_or_default()))?;
        let criteria = ExecutionResourceCriteria::new(clusters, command, Vec::new())?;

        let mut request = JobRequest::new(
            JobMetadata::new(&self.name, &self.user, &self.job_version),
            criteria,
        )
        .with_command_args(self.args.iter().cloned())
        .with_interactive(self.interactive)
        .with_archiving_disabled(self.no_archive);
        if let Some(timeout) = self.timeout {
            request = request.with_timeout_secs(timeout);
        }
        if let Some(dir) = &self.job_directory {
            request = request.with_job_directory(dir.clone());
        }
        Ok(request)
    }
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    job: JobArgs,

    #[command(flatten)]
    agent: AgentArgs,

    /// Archive root; the job id is appended per job
    #[arg(long)]
    archive_location: Option<String>,
}

#[derive(Parser, Debug)]
struct ResolveArgs {
    #[command(flatten)]
    job: JobArgs,
}

fn parse_key_value(value: &str) -> Result<(String, String), String> {
    value
        .split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected key=value, got {}", value))
}

fn parse_peers(peers: &str) -> Vec<PeerConfig> {
    peers
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|hostname| PeerConfig {
            hostname: hostname.to_string(),
        })
        .collect()
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut server = ServerConfig::new(&args.hostname)
        .with_connection_expiration(args.connection_expiration_ms)
        .with_handshake(HandshakeConfig {
            minimum_version: args.minimum_agent_version,
            blocked_version_pattern: args.blocked_agent_versions,
        });
    if let Some(dir) = args.default_job_directory {
        server = server.with_default_job_directory(dir);
    }
    if let Some(location) = args.archive_location {
        server = server.with_default_archive_location(location);
    }
    for (key, value) in args.agent_properties {
        server = server.with_agent_property(key, value);
    }

    let mut config = NodeConfig::new(server).with_agent(args.agent.to_config());
    config.peers = parse_peers(&args.peers);
    if let Some(path) = args.catalog {
        config = config.with_catalog(path);
    }
    if let Some(port) = args.dashboard_port {
        config = config.with_dashboard(SocketAddr::from(([0, 0, 0, 0], port)));
    }

    tracing::info!(
        hostname = %config.server.hostname,
        peers = config.peers.len(),
        dashboard = ?config.dashboard_addr,
        "Starting jobcoord server"
    );

    let shutdown = install_shutdown_handler()?;
    let node = Arc::new(Node::new(config)?);
    node.run(shutdown).await;
    Ok(())
}

/// Run one job with an in-process server and agent. Returns the process
/// exit code.
async fn run_job(args: RunArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let request = args.job.to_request()?;
    let catalog = ResourceCatalog::from_json_file(&args.job.catalog)?;
    let mut server = ServerConfig::default();
    if let Some(location) = args.archive_location {
        server = server.with_default_archive_location(location);
    }
    let node = Node::with_catalog(NodeConfig::new(server), catalog)?;
    let cleanup = node.server().start();

    let agent = AgentClientMetadata::current(node.server().hostname());
    let client = Arc::new(LocalRpcClient::new(node.server().clone()));
    let execution = JobExecution::new(client, args.agent.to_config(), agent, request);

    let process = execution.process();
    let shutdown = install_shutdown_handler()?;
    let signal_watch = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            process.kill(KillSource::SystemSignal).await;
        })
    };

    let outcome = execution.run().await;
    signal_watch.abort();
    node.shutdown().await;
    let _ = cleanup.await;

    match &outcome.job_id {
        Some(job_id) => println!("Job {}: {} ({})", job_id, outcome.status, outcome.message),
        None => println!("Job not started: {}", outcome.message),
    }
    for error in &outcome.errors {
        eprintln!("  {}: {}", error.stage, error.message);
    }
    Ok(outcome.process_exit_code())
}

async fn resolve_job(args: ResolveArgs) -> Result<(), Box<dyn std::error::Error>> {
    let request = args.job.to_request()?;
    let catalog = ResourceCatalog::from_json_file(&args.job.catalog)?;
    let node = Node::with_catalog(NodeConfig::default(), catalog)?;
    let specification = node
        .server()
        .coordinator()
        .resolve_dry_run(&request)
        .await?;
    println!("{}", serde_json::to_string_pretty(&specification)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Run(run_args) => {
            let code = run_job(run_args).await?;
            std::process::exit(code);
        }
        Commands::Resolve(resolve_args) => resolve_job(resolve_args).await?,
    }
    Ok(())
}
