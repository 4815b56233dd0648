//! Smart contracts: deployed bytecode, persistent storage, and the registry
//!
//! The manager owns every deployed contract; the VM borrows exactly one
//! contract mutably for the duration of a single `execute` call.

pub mod program;
pub mod value;
pub mod vm;

pub use value::Value;
pub use vm::{ContractVm, ExecutionContext, ExecutionOutcome, Instruction, OpCode, VmError};

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::crypto::{sha256_hex, ADDRESS_HEX_LEN};

/// A deployed contract with its bytecode and persistent storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartContract {
    pub address: String,
    pub creator: String,
    pub name: String,
    pub language: String,
    /// Unix seconds at deployment
    pub creation_timestamp: i64,
    /// Per-creator deployment counter this address was derived from
    pub creation_nonce: u64,
    pub bytecode: Vec<Instruction>,
    /// Persistent key/value storage, survives across calls
    #[serde(default)]
    pub storage: BTreeMap<String, Value>,
}

impl SmartContract {
    pub fn new(
        address: &str,
        creator: &str,
        name: &str,
        language: &str,
        bytecode: Vec<Instruction>,
        creation_nonce: u64,
    ) -> Self {
        Self {
            address: address.to_string(),
            creator: creator.to_string(),
            name: name.to_string(),
            language: language.to_string(),
            creation_timestamp: chrono::Utc::now().timestamp(),
            creation_nonce,
            bytecode,
            storage: BTreeMap::new(),
        }
    }

    /// Read a storage slot, defaulting to `Integer(0)` for absent keys
    pub fn get_storage(&self, key: &str) -> Value {
        self.storage.get(key).cloned().unwrap_or_default()
    }

    pub fn set_storage(&mut self, key: &str, value: Value) {
        self.storage.insert(key.to_string(), value);
    }
}

/// Registry of deployed contracts and per-creator deployment counters
#[derive(Debug, Default)]
pub struct ContractManager {
    contracts: HashMap<String, SmartContract>,
    creation_nonces: HashMap<String, u64>,
}

impl ContractManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic contract address from `(creator, nonce)`
    pub fn contract_address(creator: &str, nonce: u64) -> String {
        let digest = sha256_hex(format!("{creator}:{nonce}").as_bytes());
        format!("0x{}", &digest[..ADDRESS_HEX_LEN])
    }

    /// Deploy a contract and return its allocated address
    pub fn deploy(
        &mut self,
        creator: &str,
        name: &str,
        language: &str,
        bytecode: Vec<Instruction>,
    ) -> String {
        let nonce_slot = self.creation_nonces.entry(creator.to_string()).or_insert(0);
        let nonce = *nonce_slot;
        *nonce_slot += 1;

        let address = Self::contract_address(creator, nonce);
        let contract = SmartContract::new(&address, creator, name, language, bytecode, nonce);
        self.contracts.insert(address.clone(), contract);

        info!(%address, creator, name, language, "contract deployed");
        address
    }

    pub fn get(&self, address: &str) -> Option<&SmartContract> {
        self.contracts.get(address)
    }

    pub fn get_mut(&mut self, address: &str) -> Option<&mut SmartContract> {
        self.contracts.get_mut(address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.contracts.contains_key(address)
    }

    pub fn delete(&mut self, address: &str) -> bool {
        self.contracts.remove(address).is_some()
    }

    pub fn by_creator(&self, creator: &str) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .contracts
            .values()
            .filter(|c| c.creator == creator)
            .map(|c| c.address.clone())
            .collect();
        addresses.sort();
        addresses
    }

    pub fn all(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.contracts.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn count(&self) -> usize {
        self.contracts.len()
    }

    /// Sorted snapshot of every contract, used by persistence
    pub fn snapshot(&self) -> Vec<SmartContract> {
        let mut contracts: Vec<SmartContract> = self.contracts.values().cloned().collect();
        contracts.sort_by(|a, b| a.address.cmp(&b.address));
        contracts
    }

    /// Rebuild the registry (and the per-creator counters) from a snapshot
    pub fn restore(&mut self, contracts: Vec<SmartContract>) {
        self.contracts.clear();
        self.creation_nonces.clear();
        for contract in contracts {
            let next = self
                .creation_nonces
                .entry(contract.creator.clone())
                .or_insert(0);
            *next = (*next).max(contract.creation_nonce + 1);
            self.contracts.insert(contract.address.clone(), contract);
        }
    }
}
