use clap::{Parser, ValueEnum};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use jobgate::api::{run_api, AppState};
use jobgate::catalog::{Catalog, MemoryCatalog};
use jobgate::cluster::runner::{DockerRunner, JobRunner, ProcessRunner};
use jobgate::cluster::{ClusterClient, LocalCluster};
use jobgate::config::{ControllerConfig, Placement, Runtime, SandboxConfig};
use jobgate::dispatch::Dispatcher;
use jobgate::logs::JobLogReader;
use jobgate::scheduler::{HostSelector, LeastLoaded, RandomHost};
use jobgate::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "jobgate")]
#[command(version)]
#[command(about = "Run, attach to and stream logs of cluster jobs over HTTP")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the job API with a set of local hosts
    Server(ServerArgs),
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to bind the HTTP API to
    #[arg(long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Port for the HTTP API
    #[arg(long, default_value = "1200")]
    port: u16,

    /// Local host IDs (comma-separated, must not contain '-')
    /// Example: "host1,host2"
    #[arg(long, default_value = "host1")]
    hosts: String,

    /// How jobs are started on local hosts
    #[arg(long, value_enum, default_value = "process")]
    runtime: RuntimeArg,

    /// How a host is chosen for a new job
    #[arg(long, value_enum, default_value = "random")]
    placement: PlacementArg,

    /// JSON file with apps, releases and artifacts
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Upper bound on waiting for a job to start before attaching (ms)
    #[arg(long, default_value = "30000")]
    attach_wait_timeout_ms: u64,

    /// Upper bound on draining an attach whose job failed to schedule (ms)
    #[arg(long, default_value = "1000")]
    attach_drain_timeout_ms: u64,

    // === Docker Sandbox Options ===
    /// Give containers network access
    #[arg(long)]
    allow_network: bool,

    /// Container memory limit (e.g. "256m")
    #[arg(long, default_value = "256m")]
    memory_limit: String,

    /// Container CPU limit (e.g. "0.5")
    #[arg(long, default_value = "0.5")]
    cpu_limit: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RuntimeArg {
    Process,
    Docker,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PlacementArg {
    Random,
    LeastLoaded,
}

impl ServerArgs {
    fn into_config(self) -> ControllerConfig {
        let mut config = ControllerConfig::new(SocketAddr::new(self.bind, self.port));
        for host in self.hosts.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            config = config.with_host(host);
        }
        config.runtime = match self.runtime {
            RuntimeArg::Process => Runtime::Process,
            RuntimeArg::Docker => Runtime::Docker,
        };
        config.placement = match self.placement {
            PlacementArg::Random => Placement::Random,
            PlacementArg::LeastLoaded => Placement::LeastLoaded,
        };
        config.sandbox = SandboxConfig {
            network_disabled: !self.allow_network,
            memory_limit: Some(self.memory_limit),
            cpu_limit: Some(self.cpu_limit),
        };
        config.catalog_path = self.catalog;
        config.attach_wait_timeout_ms = self.attach_wait_timeout_ms;
        config.attach_drain_timeout_ms = self.attach_drain_timeout_ms;
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await,
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = args.into_config();
    config.validate()?;

    let catalog: Arc<dyn Catalog> = match &config.catalog_path {
        Some(path) => Arc::new(MemoryCatalog::load_file(path).await?),
        None => {
            tracing::warn!("No catalog file given, every app lookup will fail");
            Arc::new(MemoryCatalog::new())
        }
    };

    let runner: Arc<dyn JobRunner> = match config.runtime {
        Runtime::Process => Arc::new(ProcessRunner),
        Runtime::Docker => Arc::new(DockerRunner::new(config.sandbox.clone())),
    };
    let cluster: Arc<dyn ClusterClient> =
        Arc::new(LocalCluster::with_hosts(runner, config.hosts.iter().cloned()).await?);

    let selector: Arc<dyn HostSelector> = match config.placement {
        Placement::Random => Arc::new(RandomHost),
        Placement::LeastLoaded => Arc::new(LeastLoaded),
    };

    tracing::info!(
        hosts = ?config.hosts,
        runtime = ?config.runtime,
        placement = ?config.placement,
        "Starting jobgate"
    );

    let dispatcher = Dispatcher::new(catalog.clone(), cluster.clone(), selector)
        .with_timeouts(config.dispatch_timeouts());
    let log_reader = JobLogReader::new(cluster.clone(), config.attach_wait_timeout());

    let state = AppState {
        catalog,
        cluster,
        dispatcher: Arc::new(dispatcher),
        log_reader: Arc::new(log_reader),
    };

    let shutdown_token = install_shutdown_handler();
    run_api(config.listen_addr, state, shutdown_token).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
