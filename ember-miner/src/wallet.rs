//! Local keystore: one Ed25519 keypair per wallet file
//!
//! Wallets are stored as `wallet_<address>.json` inside the keystore
//! directory. Transactions are signed client-side before submission.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use ember_blockchain::crypto::Keypair;
use ember_blockchain::types::Transaction;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Wallet not found: {0}")]
    NotFound(String),
    #[error("Invalid key material: {0}")]
    InvalidKey(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct WalletFile {
    address: String,
    public_key: String,
    secret_key: String,
}

/// Directory-backed wallet collection
pub struct WalletStore {
    dir: PathBuf,
    wallets: HashMap<String, Keypair>,
}

impl WalletStore {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, WalletError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut wallets = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let is_wallet = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("wallet_") && n.ends_with(".json"))
                .unwrap_or(false);
            if !is_wallet {
                continue;
            }
            let raw = fs::read_to_string(&path)?;
            let file: WalletFile = serde_json::from_str(&raw)?;
            let secret: [u8; 32] = hex::decode(&file.secret_key)
                .map_err(|e| WalletError::InvalidKey(e.to_string()))?
                .try_into()
                .map_err(|_| WalletError::InvalidKey("wrong secret length".into()))?;
            wallets.insert(file.address.clone(), Keypair::from_secret_bytes(&secret));
        }

        Ok(Self { dir, wallets })
    }

    /// Generate a wallet, persist it, and return the address
    pub fn create_wallet(&mut self) -> Result<String, WalletError> {
        let keypair = Keypair::generate();
        let address = keypair.address();

        let file = WalletFile {
            address: address.clone(),
            public_key: keypair.public_key_hex(),
            secret_key: hex::encode(keypair.secret_bytes()),
        };
        let path = self.dir.join(format!("wallet_{}.json", address.to_lowercase()));
        fs::write(&path, serde_json::to_string_pretty(&file)?)?;
        info!(%address, "wallet created");

        self.wallets.insert(address.clone(), keypair);
        Ok(address)
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.wallets.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn has_wallet(&self, address: &str) -> bool {
        self.wallets.contains_key(address)
    }

    /// Sign a transfer with the named wallet's key
    pub fn sign_transaction(
        &self,
        address: &str,
        to: &str,
        amount: f64,
        gas_price: f64,
        nonce: u64,
    ) -> Result<Transaction, WalletError> {
        let keypair = self
            .wallets
            .get(address)
            .ok_or_else(|| WalletError::NotFound(address.to_string()))?;
        Ok(Transaction::new(address, to, amount, gas_price, nonce).sign_with(keypair))
    }
}
