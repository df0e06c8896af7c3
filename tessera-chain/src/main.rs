//! Tessera block producer node
//!
//! Main entry point: loads the configuration, opens the chain and runs it
//! until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};

use tessera_chain::chain::Chain;
use tessera_chain::config;
use tessera_chain::rpc::{ChainRpcServer, LoopbackCaller};
use tessera_chain::types::NodeId;

/// Tessera node CLI
#[derive(Parser, Debug)]
#[command(name = "tessera-node")]
#[command(about = "Tessera block producer node", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "tessera.toml")]
    config: String,

    /// Data directory override
    #[arg(short, long)]
    data_dir: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let config_path = PathBuf::from(&args.config);
    let mut config = config::load_or_create(&config_path)
        .with_context(|| format!("loading config at {}", config_path.display()))?;
    if let Some(data_dir) = args.data_dir {
        let base = PathBuf::from(data_dir);
        config.data_file = base.join("chain").to_string_lossy().to_string();
        config.key_file = base.join("node.key").to_string_lossy().to_string();
    }

    println!(
        r#"
    Tessera Block Producer
    Node:     {}
    Data:     {}
    Slot:     {} ms (tick {} ms)
    Producers: {} (this node at index {})
    "#,
        config.node_id,
        config.data_file,
        config.period_ms,
        config.tick_ms,
        config.bp_num,
        config.index
    );

    // The in-process transport serves single-node deployments; a networked
    // transport plugs in through the same NodeCaller trait.
    let caller = Arc::new(LoopbackCaller::new());
    let chain = Chain::bootstrap(&config, caller.clone()).context("opening chain")?;
    caller.register_chain(
        NodeId(config.node_id.clone()),
        Arc::new(ChainRpcServer::new(chain.clone())),
    );

    chain.start().context("starting chain")?;
    info!("chain running; press Ctrl+C to stop");

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutdown signal received");
    chain.stop().await.context("stopping chain")?;
    Ok(())
}
