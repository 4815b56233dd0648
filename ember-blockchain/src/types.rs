//! Core transaction and block model with canonical encoding
//!
//! Canonical encoding is JSON with keys sorted ascending (serde_json object
//! maps are ordered), rendered without whitespace. Producer and verifier must
//! agree bit-for-bit, so every hash in the system goes through the
//! `canonical_*` helpers here.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::contract::Instruction;
use crate::crypto::{sha256_hex, Keypair};

/// Wall-clock timestamp format shared by blocks and transactions
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current UTC wall clock in the canonical format
pub fn now_timestamp() -> String {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

/// A signed transfer, optionally carrying contract deployment or call data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub from: String,
    pub to: String,
    pub amount: f64,
    pub gas_price: f64,
    /// Per-sender replay counter; the first transaction uses 0
    pub nonce: u64,
    pub timestamp: String,
    pub public_key: String,
    pub signature: String,
    pub transaction_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_address: Option<String>,
    #[serde(default)]
    pub is_contract_deployment: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_bytecode: Option<Vec<Instruction>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Transaction {
    /// Build an unsigned transfer; `finalize` or `sign_with` completes it
    pub fn new(from: &str, to: &str, amount: f64, gas_price: f64, nonce: u64) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            amount,
            gas_price,
            nonce,
            timestamp: now_timestamp(),
            public_key: String::new(),
            signature: String::new(),
            transaction_id: String::new(),
            contract_address: None,
            is_contract_deployment: false,
            contract_bytecode: None,
            contract_name: None,
            contract_language: None,
            data: None,
        }
    }

    /// The id preimage: canonical JSON of the fixed field set, signature
    /// excluded
    pub fn id_preimage(&self) -> String {
        json!({
            "amount": self.amount,
            "from": self.from,
            "gas_price": self.gas_price,
            "public_key": self.public_key,
            "timestamp": self.timestamp,
            "to": self.to,
        })
        .to_string()
    }

    pub fn compute_id(&self) -> String {
        sha256_hex(self.id_preimage().as_bytes())
    }

    /// Fill in authentication material in the simplified identity profile
    /// (non-empty placeholder signature, id over the canonical preimage)
    pub fn finalize(mut self, public_key: &str, signature: &str) -> Self {
        self.public_key = public_key.to_string();
        self.signature = signature.to_string();
        self.transaction_id = self.compute_id();
        self
    }

    /// Sign with a real keypair: sets the public key, Ed25519 signature over
    /// the id preimage, and the transaction id
    pub fn sign_with(mut self, keypair: &Keypair) -> Self {
        self.public_key = keypair.public_key_hex();
        self.signature = keypair.sign(self.id_preimage().as_bytes());
        self.transaction_id = self.compute_id();
        self
    }

    /// Full canonical JSON value (keys sorted), used for merkle leaves and
    /// the proof-of-work data string
    pub fn canonical_value(&self) -> JsonValue {
        json!({
            "amount": self.amount,
            "from": self.from,
            "gas_price": self.gas_price,
            "nonce": self.nonce,
            "public_key": self.public_key,
            "signature": self.signature,
            "timestamp": self.timestamp,
            "to": self.to,
            "transaction_id": self.transaction_id,
        })
    }

    pub fn canonical_json(&self) -> String {
        self.canonical_value().to_string()
    }
}

/// A block in the chain; genesis sits at index 1 with `previous_hash = "0"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// 1-based height
    pub index: u64,
    pub timestamp: String,
    pub transactions: Vec<Transaction>,
    pub merkle_root: String,
    /// Account state root as seen BEFORE applying this block's transactions;
    /// empty means unknown and skips state-root validation
    pub state_root: String,
    /// Proof-of-work nonce
    pub proof: i64,
    pub previous_hash: String,
}

impl Block {
    /// Canonical JSON over all seven fields, keys sorted
    pub fn canonical_value(&self) -> JsonValue {
        json!({
            "index": self.index,
            "merkle_root": self.merkle_root,
            "previous_hash": self.previous_hash,
            "proof": self.proof,
            "state_root": self.state_root,
            "timestamp": self.timestamp,
            "transactions": self.transactions.iter().map(Transaction::canonical_value).collect::<Vec<_>>(),
        })
    }

    pub fn canonical_json(&self) -> String {
        self.canonical_value().to_string()
    }

    /// Hash of the canonical encoding
    pub fn hash(&self) -> String {
        sha256_hex(self.canonical_json().as_bytes())
    }

    /// Concatenated canonical transactions, the PoW digest's data component
    pub fn transaction_data(&self) -> String {
        transaction_data(&self.transactions)
    }
}

/// Concatenate canonical transaction encodings in block order
pub fn transaction_data(transactions: &[Transaction]) -> String {
    transactions.iter().map(Transaction::canonical_json).collect()
}

/// Binary merkle root over transaction hashes.
///
/// Leaves are hashes of each transaction's canonical encoding; levels pair
/// left-to-right and an odd tail duplicates its last hash. An empty list
/// yields `sha256("")`.
pub fn merkle_root(transactions: &[Transaction]) -> String {
    if transactions.is_empty() {
        return sha256_hex(b"");
    }

    let mut level: Vec<String> = transactions
        .iter()
        .map(|tx| sha256_hex(tx.canonical_json().as_bytes()))
        .collect();

    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let combined = match pair {
                [left, right] => format!("{left}{right}"),
                [left] => format!("{left}{left}"),
                _ => unreachable!(),
            };
            next.push(sha256_hex(combined.as_bytes()));
        }
        level = next;
    }

    level.remove(0)
}
