//! qPoW Node - run a full node, a miner, or a local testnet

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use qpow_consensus::ChainManager;
use qpow_node::settings::{default_data_dir, CONFIG_FILE};
use qpow_node::{MinerKind, NodeRuntime, NodeSettings, Testnet};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn, Level};

#[derive(Parser)]
#[command(name = "qpow-node")]
#[command(version)]
#[command(about = "qPoW Node - hybrid PoW/PoS blockchain node with tree-search mining")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum MinerArg {
    Mcts,
    Enumeration,
}

impl From<MinerArg> for MinerKind {
    fn from(arg: MinerArg) -> Self {
        match arg {
            MinerArg::Mcts => MinerKind::Mcts,
            MinerArg::Enumeration => MinerKind::Enumeration,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Node data directory
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Start the node daemon
    Start {
        /// Node data directory
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Configuration file (defaults to <data-dir>/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[arg(long)]
        node_id: Option<String>,

        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        /// Peer as id@host:port (repeatable)
        #[arg(long = "peer")]
        peers: Vec<String>,

        /// Run the mining worker
        #[arg(long)]
        mine: bool,

        #[arg(long, value_enum)]
        miner: Option<MinerArg>,

        /// Hash evaluations per mining attempt
        #[arg(long)]
        iterations: Option<u64>,

        /// Milliseconds per mining attempt
        #[arg(long)]
        time_limit_ms: Option<u64>,

        /// Blocks between difficulty adjustments
        #[arg(long)]
        retarget_window: Option<u64>,
    },

    /// Show the height and head of a stored chain
    Status {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Run several in-memory nodes on loopback
    Testnet {
        #[arg(long, default_value = "3")]
        nodes: usize,

        /// How many of the nodes mine
        #[arg(long, default_value = "1")]
        miners: usize,

        /// Stop once every node reaches this height
        #[arg(long, default_value = "10")]
        height: u64,

        /// Give up after this many seconds
        #[arg(long, default_value = "120")]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let outcome = match cli.command {
        Commands::Init { data_dir, force } => init_node(data_dir, force),
        Commands::Start {
            data_dir,
            config,
            node_id,
            host,
            port,
            peers,
            mine,
            miner,
            iterations,
            time_limit_ms,
            retarget_window,
        } => {
            let settings = load_settings(data_dir, config).map(|mut settings| {
                if let Some(id) = node_id {
                    settings.network.node_id = id;
                }
                if let Some(host) = host {
                    settings.network.host = host;
                }
                if let Some(port) = port {
                    settings.network.port = port;
                }
                settings.peers.extend(peers);
                settings.mining.enabled |= mine;
                if let Some(kind) = miner {
                    settings.mining.miner = kind.into();
                }
                if let Some(iterations) = iterations {
                    settings.mining.max_iterations = iterations;
                }
                if let Some(ms) = time_limit_ms {
                    settings.mining.time_limit_ms = ms;
                }
                if let Some(window) = retarget_window {
                    settings.consensus.retarget_window = window;
                }
                settings
            });
            match settings {
                Ok(settings) => start_node(settings).await,
                Err(e) => Err(e),
            }
        }
        Commands::Status { data_dir } => show_status(data_dir),
        Commands::Testnet {
            nodes,
            miners,
            height,
            timeout_secs,
        } => run_testnet(nodes, miners, height, Duration::from_secs(timeout_secs)).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(verbose > 0)
        .with_writer(std::io::stderr)
        .init();
}

fn config_path(data_dir: &Path, config: Option<PathBuf>) -> PathBuf {
    config.unwrap_or_else(|| data_dir.join(CONFIG_FILE))
}

fn load_settings(data_dir: Option<PathBuf>, config: Option<PathBuf>) -> Result<NodeSettings> {
    let data_dir = data_dir.unwrap_or_else(default_data_dir);
    let path = config_path(&data_dir, config);
    let mut settings = if path.exists() {
        NodeSettings::load(&path)?
    } else {
        warn!(path = %path.display(), "No configuration file, using defaults");
        NodeSettings::default()
    };
    settings.data_dir = Some(data_dir);
    Ok(settings)
}

fn init_node(data_dir: Option<PathBuf>, force: bool) -> Result<()> {
    let data_dir = data_dir.unwrap_or_else(default_data_dir);
    let path = data_dir.join(CONFIG_FILE);
    if path.exists() && !force {
        anyhow::bail!("{} already exists; pass --force to overwrite", path.display());
    }
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("cannot create {}", data_dir.display()))?;

    let settings = NodeSettings {
        data_dir: Some(data_dir),
        ..NodeSettings::default()
    };
    settings.save(&path)?;
    info!(path = %path.display(), node = %settings.network.node_id, "Wrote configuration");
    Ok(())
}

async fn start_node(settings: NodeSettings) -> Result<()> {
    let runtime = NodeRuntime::start(settings).await?;
    info!(
        node = %runtime.node().node_id(),
        address = %runtime.address(),
        mining = runtime.miner().is_some(),
        "Node started"
    );

    signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("Shutdown signal received");

    if let Some(worker) = runtime.miner() {
        let stats = worker.stats().await;
        info!(
            attempts = stats.attempts,
            mined = stats.admitted,
            stale = stats.stale,
            "Mining summary"
        );
    }
    runtime.stop().await?;
    Ok(())
}

fn show_status(data_dir: Option<PathBuf>) -> Result<()> {
    let settings = load_settings(data_dir, None)?;
    let Some(path) = settings.snapshot_path().filter(|p| p.exists()) else {
        println!("No chain stored yet");
        return Ok(());
    };
    let chain = ChainManager::load_snapshot(&path, settings.consensus.clone())
        .with_context(|| format!("cannot read {}", path.display()))?;

    println!("Node:   {}", settings.network.node_id);
    println!("Height: {}", chain.length().saturating_sub(1));
    if let Some(head) = chain.latest() {
        println!("Head:   {}", hex::encode(head.id()));
        println!("Bits:   {:#010x}", head.header.bits);
    }
    Ok(())
}

async fn run_testnet(nodes: usize, miners: usize, height: u64, timeout: Duration) -> Result<()> {
    if nodes == 0 {
        anyhow::bail!("a testnet needs at least one node");
    }
    let testnet = Testnet::with_miners(nodes, miners.min(nodes)).await?;
    for node in testnet.nodes() {
        info!(node = %node.node().node_id(), address = %node.address(), "Testnet node");
    }

    let reached = tokio::select! {
        reached = testnet.wait_for_height(height, timeout) => reached,
        _ = signal::ctrl_c() => false,
    };
    let heights = testnet.heights().await;
    let converged = testnet.converged().await;
    info!(?heights, converged, "Testnet finished");
    testnet.shutdown().await?;

    if !reached {
        warn!(height, "Not every node reached the target height");
    }
    Ok(())
}
