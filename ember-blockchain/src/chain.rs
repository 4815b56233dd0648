//! The ledger state machine: chain, accounts, mining and block ingestion
//!
//! One `RwLock` guards the chain, account state and contract registry
//! together (single writer, many readers). The mempool keeps its own lock,
//! and neither lock is ever held across the proof-of-work search or disk and
//! socket I/O.

use std::sync::RwLock;

use chrono::{Duration, NaiveDateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::contract::{
    ContractManager, ContractVm, ExecutionContext, ExecutionOutcome, Instruction, SmartContract,
};
use crate::error::{ChainError, ChainResult};
use crate::mempool::Mempool;
use crate::pow;
use crate::state::{AccountEntry, LedgerState};
use crate::storage::{PersistentStore, StateFile};
use crate::types::{merkle_root, transaction_data, Block, Transaction, TIMESTAMP_FORMAT};
use crate::validation::{validate_block, validate_transaction, MIN_BLOCK_TIME_SECS};

/// Default cap on transactions drained into one block
pub const MAX_BLOCK_TRANSACTIONS: usize = 10;

/// Genesis carries the literal previous hash "0"
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Fixed genesis timestamp so independently started nodes share a genesis
/// block and can link each other's chains
pub const GENESIS_TIMESTAMP: &str = "2024-01-01 00:00:00";

struct ChainInner {
    chain: Vec<Block>,
    state: LedgerState,
    contracts: ContractManager,
    difficulty: u32,
}

/// A proof-of-work blockchain with an account model and contract registry
pub struct Blockchain {
    inner: RwLock<ChainInner>,
    mempool: Mempool,
    store: RwLock<Option<PersistentStore>>,
}

impl Blockchain {
    /// Create a chain holding only the genesis block
    pub fn new() -> Self {
        let state = LedgerState::new();
        let genesis = Block {
            index: 1,
            timestamp: GENESIS_TIMESTAMP.to_string(),
            transactions: vec![],
            merkle_root: merkle_root(&[]),
            state_root: state.state_root(),
            proof: 1,
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
        };

        Self {
            inner: RwLock::new(ChainInner {
                chain: vec![genesis],
                state,
                contracts: ContractManager::new(),
                difficulty: pow::MIN_DIFFICULTY,
            }),
            mempool: Mempool::new(),
            store: RwLock::new(None),
        }
    }

    /// Attach a persistence store; every state change is saved best-effort
    pub fn attach_store(&self, store: PersistentStore) {
        *self.store.write().expect("store lock poisoned") = Some(store);
    }

    // ========================================================================
    // Accounts
    // ========================================================================

    pub fn create_account(&self, address: &str, balance: f64) {
        self.inner
            .write()
            .expect("chain lock poisoned")
            .state
            .create_account(address, balance);
        self.persist();
    }

    pub fn get_balance(&self, address: &str) -> f64 {
        self.inner
            .read()
            .expect("chain lock poisoned")
            .state
            .get_balance(address)
    }

    pub fn get_nonce(&self, address: &str) -> Option<u64> {
        self.inner
            .read()
            .expect("chain lock poisoned")
            .state
            .get_nonce(address)
    }

    pub fn expected_nonce(&self, address: &str) -> u64 {
        self.inner
            .read()
            .expect("chain lock poisoned")
            .state
            .expected_nonce(address)
    }

    /// Sorted account snapshot
    pub fn get_state(&self) -> Vec<AccountEntry> {
        self.inner.read().expect("chain lock poisoned").state.snapshot()
    }

    pub fn state_root(&self) -> String {
        self.inner.read().expect("chain lock poisoned").state.state_root()
    }

    pub fn account_count(&self) -> usize {
        self.inner.read().expect("chain lock poisoned").state.account_count()
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Validate a transaction and admit it into the mempool
    pub fn submit_transaction(&self, tx: Transaction) -> ChainResult<String> {
        {
            let inner = self.inner.read().expect("chain lock poisoned");
            validate_transaction(&tx, &inner.state, &self.mempool)?;
        }
        let id = tx.transaction_id.clone();
        self.mempool.push(tx);
        debug!(id = %id, "transaction admitted to mempool");
        Ok(id)
    }

    pub fn mempool_size(&self) -> usize {
        self.mempool.len()
    }

    pub fn total_transactions(&self) -> usize {
        self.inner
            .read()
            .expect("chain lock poisoned")
            .chain
            .iter()
            .map(|b| b.transactions.len())
            .sum()
    }

    // ========================================================================
    // Chain reads
    // ========================================================================

    pub fn chain_height(&self) -> u64 {
        self.inner.read().expect("chain lock poisoned").chain.len() as u64
    }

    pub fn latest_block(&self) -> ChainResult<Block> {
        self.inner
            .read()
            .expect("chain lock poisoned")
            .chain
            .last()
            .cloned()
            .ok_or(ChainError::ChainEmpty)
    }

    /// 1-based block lookup
    pub fn block_by_index(&self, index: u64) -> Option<Block> {
        if index == 0 {
            return None;
        }
        self.inner
            .read()
            .expect("chain lock poisoned")
            .chain
            .get(index as usize - 1)
            .cloned()
    }

    /// Lookup by full hash or hash prefix
    pub fn block_by_hash(&self, hash: &str) -> Option<Block> {
        if hash.is_empty() {
            return None;
        }
        self.inner
            .read()
            .expect("chain lock poisoned")
            .chain
            .iter()
            .find(|b| b.hash().starts_with(hash))
            .cloned()
    }

    pub fn get_chain(&self) -> Vec<Block> {
        self.inner.read().expect("chain lock poisoned").chain.clone()
    }

    /// Blocks strictly after the given height (for sync responses)
    pub fn chain_suffix(&self, from_height: u64) -> Vec<Block> {
        self.inner
            .read()
            .expect("chain lock poisoned")
            .chain
            .iter()
            .skip(from_height as usize)
            .cloned()
            .collect()
    }

    pub fn difficulty(&self) -> u32 {
        self.inner.read().expect("chain lock poisoned").difficulty
    }

    // ========================================================================
    // Mining
    // ========================================================================

    fn next_block_timestamp(previous: &Block) -> String {
        let now = Utc::now().naive_utc();
        let floor = NaiveDateTime::parse_from_str(&previous.timestamp, TIMESTAMP_FORMAT)
            .map(|t| t + Duration::seconds(MIN_BLOCK_TIME_SECS))
            .unwrap_or(now);
        let stamp = if now < floor { floor } else { now };
        stamp.format(TIMESTAMP_FORMAT).to_string()
    }

    /// Drain the mempool and mine the next block.
    ///
    /// The nonce search runs without the chain lock; the tip is re-checked
    /// under the write lock and the search restarts if sync moved it.
    pub fn mine_block(&self, max_transactions: usize) -> ChainResult<Block> {
        let transactions = self.mempool.drain(max_transactions);
        let data = transaction_data(&transactions);

        loop {
            let (previous, prior_len, difficulty) = {
                let inner = self.inner.read().expect("chain lock poisoned");
                let previous = inner.chain.last().ok_or(ChainError::ChainEmpty)?.clone();
                let prior_len = inner.chain.len();
                (previous, prior_len, pow::difficulty_for_height(inner.chain.len()))
            };

            let index = prior_len as u64 + 1;
            let proof = pow::find_nonce(previous.proof, index, &data, difficulty);

            let mut inner = self.inner.write().expect("chain lock poisoned");
            if inner.chain.len() != prior_len {
                debug!("chain tip moved during proof-of-work, restarting search");
                continue;
            }

            let pre_state_root = inner.state.state_root();
            let block = Block {
                index,
                timestamp: Self::next_block_timestamp(&previous),
                transactions: transactions.clone(),
                merkle_root: merkle_root(&transactions),
                state_root: pre_state_root.clone(),
                proof,
                previous_hash: previous.hash(),
            };

            if let Err(e) = validate_block(
                &block,
                &previous,
                prior_len,
                &pre_state_root,
                &inner.state,
                Utc::now().naive_utc(),
            ) {
                warn!(error = %e, dropped = transactions.len(), "mined block failed validation, discarding");
                return Err(e);
            }

            inner.state.apply(&block.transactions);
            inner.difficulty = difficulty;
            inner.chain.push(block.clone());
            info!(index, proof, tx_count = block.transactions.len(), "block mined");
            drop(inner);

            self.persist();
            return Ok(block);
        }
    }

    /// Validate and append a block received from a peer, applying its
    /// transactions to the account state
    pub fn apply_synced_block(&self, block: Block) -> ChainResult<()> {
        let mut inner = self.inner.write().expect("chain lock poisoned");
        let previous = inner.chain.last().ok_or(ChainError::ChainEmpty)?.clone();
        let prior_len = inner.chain.len();
        let pre_state_root = inner.state.state_root();

        validate_block(
            &block,
            &previous,
            prior_len,
            &pre_state_root,
            &inner.state,
            Utc::now().naive_utc(),
        )?;

        inner.state.apply(&block.transactions);
        let index = block.index;
        inner.chain.push(block);
        debug!(index, "synced block appended");
        drop(inner);

        self.persist();
        Ok(())
    }

    /// Structural sweep over the whole chain: linkage, merkle roots and the
    /// minimum proof-of-work target for every block after genesis
    pub fn is_chain_valid(&self) -> bool {
        let inner = self.inner.read().expect("chain lock poisoned");
        if inner.chain.is_empty() {
            return false;
        }

        let mut previous = &inner.chain[0];
        for block in &inner.chain[1..] {
            if block.previous_hash != previous.hash() {
                return false;
            }
            if block.merkle_root != merkle_root(&block.transactions) {
                return false;
            }
            let digest =
                pow::pow_digest(block.proof, previous.proof, block.index, &block.transaction_data());
            if !pow::meets_difficulty(&digest, pow::MIN_DIFFICULTY) {
                return false;
            }
            previous = block;
        }
        true
    }

    // ========================================================================
    // Contracts
    // ========================================================================

    /// Deploy a contract and return its address
    pub fn deploy_contract(
        &self,
        creator: &str,
        name: &str,
        language: &str,
        bytecode: Vec<Instruction>,
    ) -> ChainResult<String> {
        let address = {
            let mut inner = self.inner.write().expect("chain lock poisoned");
            inner.contracts.deploy(creator, name, language, bytecode)
        };
        self.persist();
        Ok(address)
    }

    /// Execute a deployed contract. The VM borrows the contract mutably for
    /// the duration of the call; context balances are seeded from the ledger
    /// and settled back only when execution succeeds.
    pub fn call_contract(
        &self,
        address: &str,
        caller: &str,
        gas_limit: Option<u64>,
    ) -> ChainResult<ExecutionOutcome> {
        let mut inner = self.inner.write().expect("chain lock poisoned");
        let block_number = inner.chain.len() as u64;
        let (balances, _) = inner.state.to_maps();

        let mut context = ExecutionContext::new(caller, address)
            .with_block(block_number, Utc::now().timestamp())
            .with_balances(balances);
        if let Some(gas) = gas_limit {
            context = context.with_gas_limit(gas);
        }

        let contract = inner
            .contracts
            .get_mut(address)
            .ok_or_else(|| ChainError::ContractNotFound(address.to_string()))?;

        let mut vm = ContractVm::new();
        let outcome = vm.execute(contract, context);

        if outcome.success {
            for (account, balance) in &outcome.balances {
                inner.state.set_balance(account, *balance);
            }
        }
        drop(inner);

        self.persist();
        Ok(outcome)
    }

    pub fn get_contract(&self, address: &str) -> Option<SmartContract> {
        self.inner
            .read()
            .expect("chain lock poisoned")
            .contracts
            .get(address)
            .cloned()
    }

    pub fn contracts_by_creator(&self, creator: &str) -> Vec<String> {
        self.inner
            .read()
            .expect("chain lock poisoned")
            .contracts
            .by_creator(creator)
    }

    pub fn all_contracts(&self) -> Vec<String> {
        self.inner.read().expect("chain lock poisoned").contracts.all()
    }

    pub fn contract_count(&self) -> usize {
        self.inner.read().expect("chain lock poisoned").contracts.count()
    }

    pub fn delete_contract(&self, address: &str) -> bool {
        let removed = self
            .inner
            .write()
            .expect("chain lock poisoned")
            .contracts
            .delete(address);
        if removed {
            self.persist();
        }
        removed
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Snapshot under the read lock, then write outside it. Failures are
    /// logged and retried on the next state change.
    pub fn persist(&self) {
        let store = self.store.read().expect("store lock poisoned");
        let Some(store) = store.as_ref() else {
            return;
        };

        let (blocks, contracts, state_file, export) = {
            let inner = self.inner.read().expect("chain lock poisoned");
            let (balances, nonces) = inner.state.to_maps();
            let state_file = StateFile {
                balances,
                nonces,
                difficulty: inner.difficulty,
            };
            let export = json!({
                "chain_height": inner.chain.len(),
                "state_root": inner.state.state_root(),
                "difficulty": inner.difficulty,
                "contract_count": inner.contracts.count(),
            });
            (inner.chain.clone(), inner.contracts.snapshot(), state_file, export)
        };

        for result in [
            store.save_blocks(&blocks),
            store.save_contracts(&contracts),
            store.save_state(&state_file),
            store.export_full_state(&export),
        ] {
            if let Err(e) = result {
                warn!(error = %e, "persistence failed, will retry on next state change");
            }
        }
    }

    /// Restore chain, accounts and contracts from storage. Returns whether a
    /// saved chain was found.
    pub fn restore(&self) -> anyhow::Result<bool> {
        let store = self.store.read().expect("store lock poisoned");
        let Some(store) = store.as_ref() else {
            return Ok(false);
        };
        if !store.has_saved_data() {
            return Ok(false);
        }

        let blocks = store.load_blocks()?;
        if blocks.is_empty() {
            return Ok(false);
        }
        let contracts = store.load_contracts()?;
        let state_file = store.load_state()?.unwrap_or_default();

        let mut inner = self.inner.write().expect("chain lock poisoned");
        inner.chain = blocks;
        inner.state = LedgerState::from_maps(state_file.balances, state_file.nonces);
        inner.difficulty = state_file.difficulty.max(pow::MIN_DIFFICULTY);
        inner.contracts.restore(contracts);
        info!(height = inner.chain.len(), "chain restored from storage");
        Ok(true)
    }
}

impl Default for Blockchain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_tx(chain: &Blockchain, from: &str, to: &str, amount: f64, gas: f64) -> Transaction {
        Transaction::new(from, to, amount, gas, chain.expected_nonce(from)).finalize(from, "sig")
    }

    #[test]
    fn genesis_shape() {
        let chain = Blockchain::new();
        let genesis = chain.latest_block().unwrap();
        assert_eq!(genesis.index, 1);
        assert_eq!(genesis.proof, 1);
        assert_eq!(genesis.previous_hash, GENESIS_PREVIOUS_HASH);
        assert!(genesis.transactions.is_empty());
        assert_eq!(chain.chain_height(), 1);
        assert!(chain.is_chain_valid());
    }

    #[test]
    fn transfer_and_mine_updates_balances() {
        let chain = Blockchain::new();
        chain.create_account("0xa", 100.0);
        chain.create_account("0xb", 0.0);

        let tx = signed_tx(&chain, "0xa", "0xb", 10.0, 1.0);
        chain.submit_transaction(tx).unwrap();
        assert_eq!(chain.mempool_size(), 1);

        let block = chain.mine_block(10).unwrap();
        assert_eq!(block.index, 2);
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(chain.get_balance("0xa"), 89.0);
        assert_eq!(chain.get_balance("0xb"), 10.0);
        assert_eq!(chain.chain_height(), 2);
        assert_eq!(chain.mempool_size(), 0);
        assert!(chain.is_chain_valid());
    }

    #[test]
    fn duplicate_submission_is_replay() {
        let chain = Blockchain::new();
        chain.create_account("0xa", 100.0);
        chain.create_account("0xb", 0.0);

        let tx = signed_tx(&chain, "0xa", "0xb", 10.0, 1.0);
        chain.submit_transaction(tx.clone()).unwrap();
        let err = chain.submit_transaction(tx).unwrap_err();
        assert!(matches!(err, ChainError::ReplayDetected));
        assert_eq!(chain.mempool_size(), 1);
    }

    #[test]
    fn replay_after_apply_is_rejected() {
        let chain = Blockchain::new();
        chain.create_account("0xa", 100.0);
        chain.create_account("0xb", 0.0);

        let tx = signed_tx(&chain, "0xa", "0xb", 10.0, 1.0);
        chain.submit_transaction(tx.clone()).unwrap();
        chain.mine_block(10).unwrap();

        let err = chain.submit_transaction(tx).unwrap_err();
        assert!(matches!(err, ChainError::ReplayDetected));
    }

    #[test]
    fn mining_empty_mempool_produces_empty_valid_block() {
        let chain = Blockchain::new();
        let block = chain.mine_block(10).unwrap();
        assert!(block.transactions.is_empty());
        assert_eq!(block.merkle_root, merkle_root(&[]));
        assert!(chain.is_chain_valid());
    }

    #[test]
    fn nonce_gap_block_is_rejected_and_not_appended() {
        let chain = Blockchain::new();
        chain.create_account("0xs", 100.0);
        chain.create_account("0xr", 0.0);

        let first = Transaction::new("0xs", "0xr", 1.0, 0.0, 0).finalize("0xs", "sig");
        let skipped = Transaction::new("0xs", "0xr", 1.0, 0.0, 2).finalize("0xs", "sig");
        chain.submit_transaction(first).unwrap();
        chain.submit_transaction(skipped).unwrap();

        let err = chain.mine_block(10).unwrap_err();
        assert!(matches!(err, ChainError::InvalidBlock(reason) if reason.contains("nonce ordering")));
        assert_eq!(chain.chain_height(), 1);
        assert_eq!(chain.get_balance("0xs"), 100.0);
    }

    #[test]
    fn mined_blocks_link_and_commit_pre_apply_state_root() {
        let chain = Blockchain::new();
        chain.create_account("0xa", 100.0);
        chain.create_account("0xb", 0.0);
        let root_before = chain.state_root();

        chain
            .submit_transaction(signed_tx(&chain, "0xa", "0xb", 10.0, 0.0))
            .unwrap();
        let block = chain.mine_block(10).unwrap();

        assert_eq!(block.state_root, root_before);
        assert_ne!(chain.state_root(), root_before);

        let genesis = chain.block_by_index(1).unwrap();
        assert_eq!(block.previous_hash, genesis.hash());
    }

    #[test]
    fn synced_block_from_peer_is_validated_and_applied() {
        let source = Blockchain::new();
        let target = Blockchain::new();
        // independently constructed chains share the deterministic genesis
        assert_eq!(
            source.latest_block().unwrap().hash(),
            target.latest_block().unwrap().hash()
        );

        let block = source.mine_block(10).unwrap();
        target.apply_synced_block(block).unwrap();
        assert_eq!(target.chain_height(), 2);

        // a block that does not link is rejected without truncation
        let stray = source.mine_block(10).unwrap();
        let mut broken = stray.clone();
        broken.previous_hash = "bogus".into();
        assert!(target.apply_synced_block(broken).is_err());
        assert_eq!(target.chain_height(), 2);
        target.apply_synced_block(stray).unwrap();
        assert_eq!(target.chain_height(), 3);
    }

    #[test]
    fn contract_deploy_and_call_through_chain() {
        let chain = Blockchain::new();
        chain.create_account("0xcreator", 10.0);

        let address = chain
            .deploy_contract("0xcreator", "Counter", "vm", crate::contract::program::counter_program())
            .unwrap();

        for _ in 0..3 {
            let outcome = chain.call_contract(&address, "0xcreator", None).unwrap();
            assert!(outcome.success);
            assert_eq!(outcome.gas_used, 58);
        }
        let contract = chain.get_contract(&address).unwrap();
        assert_eq!(contract.get_storage("counter").as_integer().unwrap(), 3);

        assert!(matches!(
            chain.call_contract("0xmissing", "0xcreator", None),
            Err(ChainError::ContractNotFound(_))
        ));
    }

    #[test]
    fn persistence_round_trip_restores_chain_and_accounts() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PersistentStore::open(tmp.path()).unwrap();

        let chain = Blockchain::new();
        chain.attach_store(store.clone());
        chain.create_account("0xa", 100.0);
        chain.create_account("0xb", 0.0);
        chain
            .submit_transaction(signed_tx(&chain, "0xa", "0xb", 10.0, 1.0))
            .unwrap();
        chain.mine_block(10).unwrap();

        let restored = Blockchain::new();
        restored.attach_store(store);
        assert!(restored.restore().unwrap());

        assert_eq!(restored.chain_height(), chain.chain_height());
        assert_eq!(restored.get_balance("0xa"), 89.0);
        assert_eq!(restored.get_balance("0xb"), 10.0);
        assert_eq!(restored.state_root(), chain.state_root());
        assert!(restored.is_chain_valid());
    }

    #[test]
    fn tampered_persisted_transaction_breaks_chain_validity() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PersistentStore::open(tmp.path()).unwrap();

        let chain = Blockchain::new();
        chain.attach_store(store.clone());
        chain.create_account("0xa", 100.0);
        chain.create_account("0xb", 0.0);
        chain
            .submit_transaction(signed_tx(&chain, "0xa", "0xb", 10.0, 1.0))
            .unwrap();
        chain.mine_block(10).unwrap();
        assert!(chain.is_chain_valid());

        // flip one transaction amount on disk and reload
        let mut blocks = store.load_blocks().unwrap();
        blocks[1].transactions[0].amount = 99.0;
        store.save_blocks(&blocks).unwrap();

        let reloaded = Blockchain::new();
        reloaded.attach_store(store);
        assert!(reloaded.restore().unwrap());
        assert!(!reloaded.is_chain_valid());
    }
}
