//! Ember Node
//!
//! Main entry point - runs a node with P2P gossip, JSON-RPC, persistence and
//! an optional background miner.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use ember_blockchain::api::RpcServer;
use ember_blockchain::node::{BlockchainNode, NodeApi};
use ember_blockchain::storage::PersistentStore;
use ember_blockchain::Blockchain;
use tracing::{info, warn, Level};

/// Ember Node CLI
#[derive(Parser, Debug)]
#[command(name = "ember-node")]
#[command(about = "Ember proof-of-work blockchain node", long_about = None)]
struct Args {
    /// Node identifier used in gossip messages
    #[arg(long, default_value = "node-1")]
    node_id: String,

    /// P2P listen port
    #[arg(short, long, default_value = "9000")]
    port: u16,

    /// JSON-RPC server port
    #[arg(long, default_value = "8545")]
    rpc_port: u16,

    /// Peers to dial, comma-separated host:port pairs
    #[arg(long)]
    peers: Option<String>,

    /// Storage directory
    #[arg(short, long, default_value = "./ember-data")]
    data_dir: String,

    /// Start the background miner immediately
    #[arg(long)]
    mine: bool,

    /// Pause between mining rounds in milliseconds
    #[arg(long, default_value = "2000")]
    mine_interval_ms: u64,

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

    let store = PersistentStore::open(&args.data_dir)?;
    let blockchain = Arc::new(Blockchain::new());
    blockchain.attach_store(store);
    if blockchain.restore()? {
        info!(height = blockchain.chain_height(), "restored chain from storage");
    } else {
        info!("starting from genesis");
        blockchain.persist();
    }

    let node = BlockchainNode::with_chain(&args.node_id, args.port, blockchain);
    node.start().await?;

    if let Some(peers) = &args.peers {
        for peer in peers.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match peer.rsplit_once(':').and_then(|(host, port)| {
                port.parse::<u16>().ok().map(|port| (host.to_string(), port))
            }) {
                Some((host, port)) => {
                    if let Err(e) = node.connect_to_peer(&host, port).await {
                        warn!(peer, error = %e, "failed to dial peer");
                    }
                }
                None => warn!(peer, "ignoring malformed peer address"),
            }
        }
    }

    let rpc = RpcServer::new(NodeApi::new(Arc::clone(&node)), args.rpc_port);
    rpc.start().await?;

    if args.mine {
        node.start_mining(Some(Duration::from_millis(args.mine_interval_ms)));
        info!("background miner started");
    }

    println!(
        "\n    Ember Blockchain Node\n    Node ID:  {}\n    P2P Port: {}\n    RPC Port: {}\n    Data Dir: {}\n",
        args.node_id, args.port, args.rpc_port, args.data_dir
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    node.stop();
    node.blockchain().persist();
    Ok(())
}
