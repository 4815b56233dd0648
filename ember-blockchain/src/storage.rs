//! JSON file persistence for chain, contracts and account state
//!
//! Layout inside the storage directory:
//!   blocks.json             array of block objects
//!   contracts.json          array of contract objects
//!   state.json              { balances, nonces, difficulty }
//!   blockchain_export.json  optional full-state export
//!
//! Persistence failures never abort the node; callers log and retry on the
//! next state change.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::contract::SmartContract;
use crate::types::Block;

const BLOCKS_FILE: &str = "blocks.json";
const CONTRACTS_FILE: &str = "contracts.json";
const STATE_FILE: &str = "state.json";
const EXPORT_FILE: &str = "blockchain_export.json";

/// Serialized account state plus the node's difficulty setting
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StateFile {
    pub balances: HashMap<String, f64>,
    pub nonces: HashMap<String, u64>,
    pub difficulty: u32,
}

/// File-backed store rooted at a storage directory
#[derive(Debug, Clone)]
pub struct PersistentStore {
    dir: PathBuf,
}

impl PersistentStore {
    /// Open the store, creating the directory when missing
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create storage directory {}", dir.display()))?;
        debug!(dir = %dir.display(), "storage initialized");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    fn write_json<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        let path = self.path(file);
        let raw = serde_json::to_string_pretty(value).context("Failed to serialize state")?;
        fs::write(&path, raw).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    fn read_json<T: for<'de> Deserialize<'de>>(&self, file: &str) -> Result<Option<T>> {
        let path = self.path(file);
        if !path.exists() {
            return Ok(None);
        }
        let raw =
            fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let value = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid JSON in {}", path.display()))?;
        Ok(Some(value))
    }

    pub fn save_blocks(&self, blocks: &[Block]) -> Result<()> {
        self.write_json(BLOCKS_FILE, &blocks)?;
        debug!(count = blocks.len(), "blocks saved");
        Ok(())
    }

    pub fn load_blocks(&self) -> Result<Vec<Block>> {
        let blocks: Vec<Block> = self.read_json(BLOCKS_FILE)?.unwrap_or_default();
        if !blocks.is_empty() {
            info!(count = blocks.len(), "blocks loaded from storage");
        }
        Ok(blocks)
    }

    pub fn save_contracts(&self, contracts: &[SmartContract]) -> Result<()> {
        self.write_json(CONTRACTS_FILE, &contracts)
    }

    pub fn load_contracts(&self) -> Result<Vec<SmartContract>> {
        Ok(self.read_json(CONTRACTS_FILE)?.unwrap_or_default())
    }

    pub fn save_state(&self, state: &StateFile) -> Result<()> {
        self.write_json(STATE_FILE, state)
    }

    pub fn load_state(&self) -> Result<Option<StateFile>> {
        self.read_json(STATE_FILE)
    }

    /// Full-state export for offline inspection
    pub fn export_full_state(&self, export: &JsonValue) -> Result<()> {
        self.write_json(EXPORT_FILE, export)
    }

    /// Is there a chain to restore?
    pub fn has_saved_data(&self) -> bool {
        self.path(BLOCKS_FILE).exists()
    }

    pub fn block_count(&self) -> usize {
        self.load_blocks().map(|b| b.len()).unwrap_or(0)
    }

    pub fn contract_count(&self) -> usize {
        self.load_contracts().map(|c| c.len()).unwrap_or(0)
    }

    /// Remove every persisted file; keeps the directory
    pub fn clear_all(&self) {
        for file in [BLOCKS_FILE, CONTRACTS_FILE, STATE_FILE, EXPORT_FILE] {
            let path = self.path(file);
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "failed to remove storage file");
                }
            }
        }
    }
}
