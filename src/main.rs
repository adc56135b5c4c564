//! `clustermeta` binary: starts one coordinator node.
//!
//! Shutdown on SIGINT/SIGTERM/SIGHUP/SIGQUIT runs a bounded sequence: stop
//! accepting RPCs, close watch subscriptions, shut down Raft, exit. Exit
//! code is non-zero on startup failure or a fatal server error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use clustermeta::client;
use clustermeta::cluster::{AccessLog, ClusterHandle, NodeConfig, NodeState};
use clustermeta::errors::CoordError;
use clustermeta::fsm::StateMachine;
use clustermeta::raft::{self, ConsensusNode};
use clustermeta::server::{
    serve_coordinator, serve_raft_transport, CoordinatorService, RaftTransportService,
};
use clustermeta::value::Value;
use clustermeta::watch::WatchHub;

#[derive(Parser, Debug)]
#[command(name = "clustermeta", version)]
#[command(about = "Cluster-metadata coordinator for a distributed search platform")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a coordinator node
    Start(StartArgs),
}

#[derive(Args, Debug)]
struct StartArgs {
    /// Unique node identifier within the cluster
    #[arg(long, default_value = "node1")]
    node_id: String,

    /// Raft peer transport address
    #[arg(long, default_value = "127.0.0.1:16060")]
    bind_addr: String,

    /// RPC service address
    #[arg(long, default_value = "127.0.0.1:17070")]
    grpc_addr: String,

    /// HTTP endpoint address
    #[arg(long, default_value = "127.0.0.1:18080")]
    http_addr: String,

    /// Raft log and snapshot directory
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Existing cluster member to join
    #[arg(long)]
    peer_addr: Option<String>,

    /// JSON index mapping loaded at bootstrap into /config/index_mapping
    #[arg(long)]
    index_mapping_file: Option<PathBuf>,

    /// Index type stored under /config/index_type
    #[arg(long, default_value = "upside_down")]
    index_type: String,

    /// Index storage type stored under /config/index_storage_type
    #[arg(long, default_value = "boltdb")]
    index_storage_type: String,

    /// Log level filter (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write logs to this file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// HTTP access log file
    #[arg(long)]
    http_access_log_file: Option<PathBuf>,
}

fn init_logging(args: &StartArgs) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .map_err(|e| format!("invalid log level {:?}: {}", args.log_level, e))?;

    match &args.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| format!("cannot open log file {}: {}", path.display(), e))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("register SIGINT");
    let mut sigterm = signal(SignalKind::terminate()).expect("register SIGTERM");
    let mut sighup = signal(SignalKind::hangup()).expect("register SIGHUP");
    let mut sigquit = signal(SignalKind::quit()).expect("register SIGQUIT");

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sighup.recv() => info!("received SIGHUP"),
        _ = sigquit.recv() => info!("received SIGQUIT"),
    }
}

/// Fresh node: bootstrap a single-node cluster or join via the configured
/// peer. A node with existing Raft state does neither; replay brings it
/// back into the cluster it already belongs to.
async fn bootstrap_or_join(
    consensus: Arc<ConsensusNode>,
    config: NodeConfig,
    initialized: bool,
    index_mapping: Option<Value>,
) -> Result<(), CoordError> {
    if initialized {
        info!("existing raft state found, resuming membership");
        return Ok(());
    }

    match &config.peer_addr {
        Some(peer) => {
            info!(peer = %peer, "joining existing cluster");
            client::join_cluster(peer, &config.self_node()).await
        }
        None => {
            info!("bootstrapping single-node cluster");
            consensus.bootstrap().await?;
            consensus.seed_index_config(index_mapping).await
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Commands::Start(args) => run_start(args),
    }
}

#[tokio::main]
async fn run_start(args: StartArgs) -> ExitCode {
    if let Err(e) = init_logging(&args) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    // The index mapping file is read before anything starts; a configured
    // but unreadable file is a startup error.
    let index_mapping = match &args.index_mapping_file {
        Some(path) => match std::fs::read(path) {
            Ok(bytes) => match Value::parse_json(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    error!(file = %path.display(), error = %e, "invalid index mapping file");
                    return ExitCode::FAILURE;
                }
            },
            Err(e) => {
                error!(file = %path.display(), error = %e, "cannot read index mapping file");
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };

    let access_log = match AccessLog::open(args.http_access_log_file.as_ref()) {
        Ok(log) => Arc::new(log),
        Err(e) => {
            error!(error = %e, "cannot open http access log");
            return ExitCode::FAILURE;
        }
    };

    let config = NodeConfig {
        node_id: args.node_id,
        bind_addr: args.bind_addr,
        grpc_addr: args.grpc_addr,
        http_addr: args.http_addr,
        data_dir: args.data_dir,
        peer_addr: args.peer_addr,
        index_mapping_file: args.index_mapping_file,
        index_type: args.index_type,
        index_storage_type: args.index_storage_type,
    };

    let hub = WatchHub::new();
    let sm = Arc::new(StateMachine::new(hub.clone()));
    let handle = ClusterHandle::new(config.clone());

    let (consensus, initialized) = match raft::start(handle.clone(), sm.clone()).await {
        Ok(started) => started,
        Err(e) => {
            error!(error = %e, "failed to start raft");
            return ExitCode::FAILURE;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut raft_server = tokio::spawn(serve_raft_transport(
        config.bind_addr.clone(),
        RaftTransportService::new(consensus.raft.clone()),
        shutdown_rx.clone(),
    ));
    let mut grpc_server = tokio::spawn(serve_coordinator(
        config.grpc_addr.clone(),
        CoordinatorService::new(consensus.clone(), sm.clone(), hub.clone()),
        shutdown_rx.clone(),
    ));
    tokio::spawn(clustermeta::cluster::start_health_server(
        handle.clone(),
        sm.clone(),
        hub.clone(),
        access_log,
        shutdown_rx.clone(),
    ));
    let state_watcher = raft::spawn_state_watcher(consensus.clone());

    let mut startup = tokio::spawn(bootstrap_or_join(
        consensus.clone(),
        config.clone(),
        initialized,
        index_mapping,
    ));
    let mut startup_pending = true;

    let signals = wait_for_signal();
    tokio::pin!(signals);

    let exit_code = loop {
        tokio::select! {
            _ = &mut signals => break ExitCode::SUCCESS,
            result = &mut raft_server => {
                error!(result = ?result, "raft transport server exited");
                break ExitCode::FAILURE;
            }
            result = &mut grpc_server => {
                error!(result = ?result, "coordinator server exited");
                break ExitCode::FAILURE;
            }
            result = &mut startup, if startup_pending => match result {
                Ok(Ok(())) => {
                    startup_pending = false;
                    info!("node ready");
                }
                Ok(Err(e)) => {
                    error!(error = %e, "startup failed");
                    break ExitCode::FAILURE;
                }
                Err(e) => {
                    error!(error = %e, "startup task panicked");
                    break ExitCode::FAILURE;
                }
            },
        }
    };

    // Shutdown sequence; each step is bounded, later steps run regardless.
    handle.set_state(NodeState::ShuttingDown);

    let _ = shutdown_tx.send(true);
    hub.close();

    if consensus.is_leader() {
        // openraft 0.9 has no leadership-transfer call; followers elect a
        // new leader after the election timeout once we stop heartbeating.
        info!("shutting down as leader; peers will re-elect");
    }

    if tokio::time::timeout(Duration::from_secs(10), consensus.shutdown())
        .await
        .is_err()
    {
        warn!("raft shutdown timed out");
    }
    state_watcher.abort();

    info!("shutdown complete");
    exit_code
}
