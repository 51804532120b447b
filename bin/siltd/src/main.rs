//! Silt daemon.
//!
//! Runs either a content node (DHT participation, block storage and
//! serving, maintenance loops) or a relay server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use silt_dht::Node;
use silt_relay::Server as RelayServer;
use silt_service::Service;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

mod config;

use config::{default_config_path, UserConfig};

#[derive(Parser)]
#[command(name = "siltd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a content node (default)
    Run {
        /// Relay address to attach to, overriding the config
        #[arg(long)]
        relay: Option<String>,

        /// Bootstrap peers (host:port), repeatable
        #[arg(long = "peer")]
        peers: Vec<String>,

        /// Keep blocks in memory instead of the on-disk store
        #[arg(long)]
        mem: bool,
    },

    /// Run a relay server
    Relay {
        /// Listen address
        #[arg(long, default_value = "0.0.0.0:20018")]
        listen: String,
    },
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let command = cli.command.unwrap_or(Commands::Run {
        relay: None,
        peers: Vec::new(),
        mem: false,
    });

    match command {
        Commands::Run { relay, peers, mem } => run_node(cli.config, relay, peers, mem).await,
        Commands::Relay { listen } => run_relay(&listen).await,
    }
}

async fn run_node(
    config_path: Option<PathBuf>,
    relay_override: Option<String>,
    peers: Vec<String>,
    mem: bool,
) -> Result<()> {
    let path = match config_path {
        Some(path) => path,
        None => default_config_path()?,
    };
    let user = UserConfig::load_or_create(&path)?;
    info!(id = %user.node_id, port = user.tcp_port, "starting node");

    let node = Arc::new(Node::new(
        user.node_id,
        format!("0.0.0.0:{}", user.tcp_port),
    ));
    let service = if mem {
        Service::with_mem_store(node)
    } else {
        Service::with_disk_store(node, &user.blockstore_path)
            .context("open blockstore")?
    };

    let relay = relay_override.or_else(|| {
        if user.relay.is_empty() {
            None
        } else {
            Some(user.relay.clone())
        }
    });

    let cancel = CancellationToken::new();
    let local = service
        .start(cancel.clone(), relay.as_deref(), &peers)
        .await
        .context("start service")?;
    info!(addr = %local, "node running");

    signal::ctrl_c().await.context("wait for shutdown signal")?;
    info!("shutting down");
    cancel.cancel();
    Ok(())
}

async fn run_relay(listen: &str) -> Result<()> {
    let relay = RelayServer::new();
    let cancel = CancellationToken::new();
    let local = relay
        .listen(listen, cancel.clone())
        .await
        .context("bind relay")?;
    info!(addr = %local, "relay running");

    signal::ctrl_c().await.context("wait for shutdown signal")?;
    info!("shutting down");
    cancel.cancel();
    Ok(())
}
