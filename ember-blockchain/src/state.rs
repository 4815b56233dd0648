//! Account-model ledger state: balances, nonces, and the state root
//!
//! The state lives behind the chain write lock and is only mutated by block
//! application, so balances and nonces always change atomically with an
//! append.

use std::collections::HashMap;

use serde_json::{json, Map, Value as JsonValue};
use tracing::debug;

use crate::crypto::sha256_hex;
use crate::types::Transaction;

/// One account in a sorted state snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct AccountEntry {
    pub address: String,
    pub balance: f64,
    /// Last applied nonce; `None` until the first transaction lands
    pub nonce: Option<u64>,
}

/// Balances and per-account replay nonces
#[derive(Debug, Clone, Default)]
pub struct LedgerState {
    balances: HashMap<String, f64>,
    nonces: HashMap<String, u64>,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicitly create (or top up) an account
    pub fn create_account(&mut self, address: &str, balance: f64) {
        self.balances.insert(address.to_string(), balance);
        debug!(address, balance, "account created");
    }

    pub fn get_balance(&self, address: &str) -> f64 {
        self.balances.get(address).copied().unwrap_or(0.0)
    }

    /// Last applied nonce; absent means no transaction applied yet
    pub fn get_nonce(&self, address: &str) -> Option<u64> {
        self.nonces.get(address).copied()
    }

    /// The nonce the next transaction from this sender must carry
    pub fn expected_nonce(&self, address: &str) -> u64 {
        self.nonces.get(address).map(|n| n + 1).unwrap_or(0)
    }

    pub fn account_count(&self) -> usize {
        self.balances.len()
    }

    /// Sorted snapshot of every account, ascending by address
    pub fn snapshot(&self) -> Vec<AccountEntry> {
        let mut entries: Vec<AccountEntry> = self
            .balances
            .iter()
            .map(|(address, balance)| AccountEntry {
                address: address.clone(),
                balance: *balance,
                nonce: self.nonces.get(address).copied(),
            })
            .collect();
        entries.sort_by(|a, b| a.address.cmp(&b.address));
        entries
    }

    /// Deterministic hash commitment over the canonical serialization of all
    /// accounts, sorted ascending by address
    pub fn state_root(&self) -> String {
        let mut accounts = Map::new();
        for entry in self.snapshot() {
            accounts.insert(
                entry.address,
                json!({
                    "balance": entry.balance,
                    "nonce": entry.nonce.unwrap_or(0),
                }),
            );
        }
        sha256_hex(JsonValue::Object(accounts).to_string().as_bytes())
    }

    /// Apply validated transactions in order: debit `amount + gas_price`
    /// from the sender, credit `amount` to the receiver (created lazily),
    /// record the sender's nonce. Gas is burned.
    pub fn apply(&mut self, transactions: &[Transaction]) {
        for tx in transactions {
            let debit = tx.amount + tx.gas_price;
            *self.balances.entry(tx.from.clone()).or_insert(0.0) -= debit;
            *self.balances.entry(tx.to.clone()).or_insert(0.0) += tx.amount;
            self.nonces.insert(tx.from.clone(), tx.nonce);
        }
    }

    /// Raw maps for persistence
    pub fn to_maps(&self) -> (HashMap<String, f64>, HashMap<String, u64>) {
        (self.balances.clone(), self.nonces.clone())
    }

    pub fn from_maps(balances: HashMap<String, f64>, nonces: HashMap<String, u64>) -> Self {
        Self { balances, nonces }
    }

    /// Overwrite one balance (contract TRANSFER settlement)
    pub fn set_balance(&mut self, address: &str, balance: f64) {
        self.balances.insert(address.to_string(), balance);
    }
}
