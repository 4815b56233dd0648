use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

mod config;
mod rpc;
mod wallet;

use config::{load_or_create, resolve_data_dir, save, AppConfig};
use rpc::RpcClient;
use wallet::WalletStore;

#[derive(Parser)]
#[command(name = "ember-miner", version, about = "Ember wallet and mining control utility")]
struct Cli {
    #[arg(long, default_value = "config.toml")]
    config: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a wallet and make it the mining address
    Init {
        #[arg(long)]
        data_dir: Option<String>,
    },
    /// List wallet addresses
    Address {
        #[arg(long)]
        data_dir: Option<String>,
    },
    /// Sign and submit a transfer
    Send {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: f64,
        #[arg(long, default_value_t = 0.0)]
        gas_price: f64,
        #[arg(long)]
        data_dir: Option<String>,
    },
    /// Query an account balance
    Balance {
        #[arg(long)]
        address: Option<String>,
    },
    /// Start the node's background miner
    Start,
    /// Stop the node's background miner
    Stop,
    /// Show node and network statistics
    Status,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let cli = Cli::parse();
    let config_path = PathBuf::from(cli.config);
    let mut config = load_or_create(&config_path)?;
    let client = RpcClient::new(&config.node_url);

    match cli.command {
        Commands::Init { data_dir } => {
            let data_dir = apply_data_dir(&mut config, &config_path, data_dir)?;
            let mut store = WalletStore::open(keystore_dir(&data_dir))?;
            let address = store.create_wallet()?;
            config.mining_address = address.clone();
            save(&config_path, &config)?;
            println!("Address: {address}");
        }
        Commands::Address { data_dir } => {
            let data_dir = apply_data_dir(&mut config, &config_path, data_dir)?;
            let store = WalletStore::open(keystore_dir(&data_dir))?;
            for address in store.addresses() {
                println!("{address}");
            }
        }
        Commands::Send {
            from,
            to,
            amount,
            gas_price,
            data_dir,
        } => {
            let data_dir = apply_data_dir(&mut config, &config_path, data_dir)?;
            let store = WalletStore::open(keystore_dir(&data_dir))?;
            let from = resolve_address(&config, from)?;
            let nonce = client.next_nonce(&from).unwrap_or(0);
            let tx = store.sign_transaction(&from, &to, amount, gas_price, nonce)?;
            let tx_hash = client.send_transaction(&tx)?;
            println!("Submitted: {tx_hash}");
        }
        Commands::Balance { address } => {
            let address = resolve_address(&config, address)?;
            let balance = client.get_balance(&address)?;
            println!("{address}: {balance}");
        }
        Commands::Start => {
            client.start_mining()?;
            println!("Mining started");
        }
        Commands::Stop => {
            client.stop_mining()?;
            println!("Mining stopped");
        }
        Commands::Status => {
            let height = client.chain_height()?;
            let stats = client.network_stats()?;
            println!("height: {height}");
            for key in [
                "total_transactions",
                "total_accounts",
                "peer_count",
                "difficulty",
                "mempool_size",
                "state_root",
            ] {
                if let Some(value) = stats.get(key) {
                    println!("{key}: {value}");
                }
            }
        }
    }

    Ok(())
}

fn apply_data_dir(
    config: &mut AppConfig,
    config_path: &Path,
    override_dir: Option<String>,
) -> Result<PathBuf> {
    if let Some(dir) = override_dir {
        config.data_dir = dir;
    }
    let data_dir = resolve_data_dir(config_path, &config.data_dir);
    std::fs::create_dir_all(&data_dir)
        .map_err(|e| anyhow!("Failed to create {}: {e}", data_dir.display()))?;
    Ok(data_dir)
}

fn keystore_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("keystore")
}

fn resolve_address(config: &AppConfig, override_address: Option<String>) -> Result<String> {
    if let Some(address) = override_address {
        return Ok(address);
    }
    if config.mining_address.is_empty() {
        return Err(anyhow!("No address configured. Use --from/--address or run `ember-miner init`."));
    }
    Ok(config.mining_address.clone())
}
