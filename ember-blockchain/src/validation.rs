//! Transaction and block validation
//!
//! Transaction checks gate mempool admission; the advanced block validator
//! gates mined blocks and every block ingested during chain sync.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use tracing::debug;

use crate::error::{ChainError, ChainResult};
use crate::mempool::Mempool;
use crate::pow;
use crate::state::LedgerState;
use crate::types::{merkle_root, Block, Transaction, TIMESTAMP_FORMAT};

/// Minimum seconds between consecutive blocks
pub const MIN_BLOCK_TIME_SECS: i64 = 1;

/// Maximum seconds a block timestamp may run ahead of the local clock
pub const MAX_BLOCK_FUTURE_SECS: i64 = 120;

/// Validate a transaction against the applied ledger state and the pending
/// pool.
///
/// A nonce at or below the sender's last applied nonce, or a pending
/// duplicate (same id or same sender/nonce pair), is a replay. A nonce ahead
/// of the expected sequence is admitted; the block validator's ordering rule
/// rejects it at mining time.
pub fn validate_transaction(tx: &Transaction, state: &LedgerState, mempool: &Mempool) -> ChainResult<()> {
    if tx.from.is_empty() || tx.to.is_empty() {
        return Err(ChainError::InvalidTransaction("missing sender or recipient".into()));
    }
    if tx.from == tx.to {
        return Err(ChainError::InvalidTransaction("sender equals recipient".into()));
    }
    if tx.amount <= 0.0 {
        return Err(ChainError::InvalidTransaction("amount must be positive".into()));
    }
    if tx.gas_price < 0.0 {
        return Err(ChainError::InvalidTransaction("negative gas price".into()));
    }
    if tx.transaction_id != tx.compute_id() {
        return Err(ChainError::InvalidTransaction("transaction id mismatch".into()));
    }
    if tx.signature.is_empty() || tx.public_key.is_empty() {
        return Err(ChainError::SignatureInvalid);
    }

    if let Some(last_applied) = state.get_nonce(&tx.from) {
        if tx.nonce <= last_applied {
            return Err(ChainError::ReplayDetected);
        }
    }
    if mempool.has_pending(&tx.transaction_id, &tx.from, tx.nonce) {
        return Err(ChainError::ReplayDetected);
    }

    let required = tx.amount + tx.gas_price;
    if state.get_balance(&tx.from) < required {
        return Err(ChainError::InsufficientBalance);
    }

    Ok(())
}

fn parse_timestamp(raw: &str) -> ChainResult<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map_err(|e| ChainError::InvalidBlock(format!("bad timestamp {raw:?}: {e}")))
}

/// Full block validation against its predecessor.
///
/// `prior_chain_len` is the chain length before this block is appended (the
/// difficulty the miner was bound to); `pre_state_root` is the account state
/// root before applying this block's transactions.
pub fn validate_block(
    block: &Block,
    previous: &Block,
    prior_chain_len: usize,
    pre_state_root: &str,
    state: &LedgerState,
    now: NaiveDateTime,
) -> ChainResult<()> {
    // 1. cryptographic linkage
    if block.previous_hash != previous.hash() {
        return Err(ChainError::InvalidBlock("previous hash mismatch".into()));
    }

    // 2. merkle root recomputation
    if block.merkle_root != merkle_root(&block.transactions) {
        return Err(ChainError::InvalidBlock("merkle root mismatch".into()));
    }

    // 3. timestamp window
    let block_time = parse_timestamp(&block.timestamp)?;
    let prev_time = parse_timestamp(&previous.timestamp)?;
    let delta = (block_time - prev_time).num_seconds();
    if block_time <= prev_time || delta < MIN_BLOCK_TIME_SECS {
        return Err(ChainError::InvalidBlock("timestamp not after previous block".into()));
    }
    if (block_time - now).num_seconds() > MAX_BLOCK_FUTURE_SECS {
        return Err(ChainError::InvalidBlock("timestamp too far in the future".into()));
    }

    // 4. per-sender nonce ordering, contiguous from the applied state
    let mut expected: HashMap<&str, u64> = HashMap::new();
    for tx in &block.transactions {
        let slot = expected
            .entry(tx.from.as_str())
            .or_insert_with(|| state.expected_nonce(&tx.from));
        if tx.nonce != *slot {
            return Err(ChainError::InvalidBlock(format!(
                "nonce ordering violated for {}: expected {}, got {}",
                tx.from, slot, tx.nonce
            )));
        }
        *slot += 1;
    }

    // 5. proof-of-work at the difficulty the chain length dictated
    let difficulty = pow::difficulty_for_height(prior_chain_len).max(pow::MIN_DIFFICULTY);
    let digest = pow::pow_digest(block.proof, previous.proof, block.index, &block.transaction_data());
    if !pow::meets_difficulty(&digest, difficulty) {
        return Err(ChainError::InvalidBlock("proof of work below difficulty target".into()));
    }

    // 6. pre-apply state root, skipped when the block carries none
    if !block.state_root.is_empty() && block.state_root != pre_state_root {
        debug!(block = block.index, "state root mismatch");
        return Err(ChainError::InvalidBlock("state root mismatch".into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn funded_state() -> LedgerState {
        let mut state = LedgerState::new();
        state.create_account("0xa", 100.0);
        state.create_account("0xb", 50.0);
        state
    }

    fn tx(from: &str, to: &str, amount: f64, gas: f64, nonce: u64) -> Transaction {
        Transaction::new(from, to, amount, gas, nonce).finalize(from, "sig")
    }

    #[test]
    fn accepts_a_well_formed_transaction() {
        let state = funded_state();
        let pool = Mempool::new();
        assert!(validate_transaction(&tx("0xa", "0xb", 10.0, 1.0, 0), &state, &pool).is_ok());
    }

    #[test]
    fn rejects_malformed_transactions() {
        let state = funded_state();
        let pool = Mempool::new();

        assert!(matches!(
            validate_transaction(&tx("", "0xb", 1.0, 0.0, 0), &state, &pool),
            Err(ChainError::InvalidTransaction(_))
        ));
        assert!(matches!(
            validate_transaction(&tx("0xa", "0xa", 1.0, 0.0, 0), &state, &pool),
            Err(ChainError::InvalidTransaction(_))
        ));
        assert!(matches!(
            validate_transaction(&tx("0xa", "0xb", 0.0, 0.0, 0), &state, &pool),
            Err(ChainError::InvalidTransaction(_))
        ));
        assert!(matches!(
            validate_transaction(&tx("0xa", "0xb", 1.0, -0.5, 0), &state, &pool),
            Err(ChainError::InvalidTransaction(_))
        ));

        let mut tampered = tx("0xa", "0xb", 1.0, 0.0, 0);
        tampered.amount = 2.0;
        assert!(matches!(
            validate_transaction(&tampered, &state, &pool),
            Err(ChainError::InvalidTransaction(_))
        ));

        let mut unsigned = tx("0xa", "0xb", 1.0, 0.0, 0);
        unsigned.signature = String::new();
        assert!(matches!(
            validate_transaction(&unsigned, &state, &pool),
            Err(ChainError::SignatureInvalid)
        ));
    }

    #[test]
    fn rejects_replayed_nonce_against_applied_state() {
        let mut state = funded_state();
        state.apply(&[tx("0xa", "0xb", 1.0, 0.0, 0)]);
        let pool = Mempool::new();

        assert!(matches!(
            validate_transaction(&tx("0xa", "0xb", 1.0, 0.0, 0), &state, &pool),
            Err(ChainError::ReplayDetected)
        ));
        assert!(validate_transaction(&tx("0xa", "0xb", 1.0, 0.0, 1), &state, &pool).is_ok());
    }

    #[test]
    fn rejects_duplicate_pending_transaction() {
        let state = funded_state();
        let pool = Mempool::new();
        let first = tx("0xa", "0xb", 1.0, 0.0, 0);
        pool.push(first.clone());

        assert!(matches!(
            validate_transaction(&first, &state, &pool),
            Err(ChainError::ReplayDetected)
        ));
    }

    #[test]
    fn rejects_insufficient_balance() {
        let state = funded_state();
        let pool = Mempool::new();
        assert!(matches!(
            validate_transaction(&tx("0xa", "0xb", 100.0, 1.0, 0), &state, &pool),
            Err(ChainError::InsufficientBalance)
        ));
    }

    fn genesis() -> Block {
        Block {
            index: 1,
            timestamp: "2024-06-01 12:00:00".to_string(),
            transactions: vec![],
            merkle_root: merkle_root(&[]),
            state_root: String::new(),
            proof: 1,
            previous_hash: "0".to_string(),
        }
    }

    fn mined_child(previous: &Block, transactions: Vec<Transaction>, state_root: String) -> Block {
        let index = previous.index + 1;
        let data = crate::types::transaction_data(&transactions);
        let proof = pow::find_nonce(previous.proof, index, &data, pow::MIN_DIFFICULTY);
        Block {
            index,
            timestamp: "2024-06-01 12:00:05".to_string(),
            transactions,
            merkle_root: merkle_root(&[]),
            state_root,
            proof,
            previous_hash: previous.hash(),
        }
    }

    fn test_now() -> NaiveDateTime {
        parse_timestamp("2024-06-01 12:00:10").unwrap()
    }

    #[test]
    fn valid_empty_block_passes_all_rules() {
        let state = LedgerState::new();
        let parent = genesis();
        let child = mined_child(&parent, vec![], state.state_root());
        validate_block(&child, &parent, 1, &state.state_root(), &state, test_now()).unwrap();
    }

    #[test]
    fn rejects_broken_linkage_and_merkle() {
        let state = LedgerState::new();
        let parent = genesis();
        let mut child = mined_child(&parent, vec![], state.state_root());

        let mut unlinked = child.clone();
        unlinked.previous_hash = "bogus".to_string();
        assert!(validate_block(&unlinked, &parent, 1, &state.state_root(), &state, test_now()).is_err());

        child.merkle_root = "bogus".to_string();
        assert!(validate_block(&child, &parent, 1, &state.state_root(), &state, test_now()).is_err());
    }

    #[test]
    fn rejects_non_increasing_timestamp() {
        let state = LedgerState::new();
        let parent = genesis();
        let mut child = mined_child(&parent, vec![], state.state_root());
        child.timestamp = parent.timestamp.clone();
        assert!(validate_block(&child, &parent, 1, &state.state_root(), &state, test_now()).is_err());
    }

    #[test]
    fn rejects_far_future_timestamp() {
        let state = LedgerState::new();
        let parent = genesis();
        let mut child = mined_child(&parent, vec![], state.state_root());
        child.timestamp = "2024-06-01 12:30:00".to_string();
        assert!(validate_block(&child, &parent, 1, &state.state_root(), &state, test_now()).is_err());
    }

    #[test]
    fn rejects_nonce_gap_within_block() {
        let mut state = LedgerState::new();
        state.create_account("0xs", 100.0);
        let parent = genesis();

        let txs = vec![tx("0xs", "0xb", 1.0, 0.0, 0), tx("0xs", "0xb", 1.0, 0.0, 2)];
        let data = crate::types::transaction_data(&txs);
        let proof = pow::find_nonce(parent.proof, 2, &data, pow::MIN_DIFFICULTY);
        let block = Block {
            index: 2,
            timestamp: "2024-06-01 12:00:05".to_string(),
            transactions: txs.clone(),
            merkle_root: merkle_root(&txs),
            state_root: String::new(),
            proof,
            previous_hash: parent.hash(),
        };

        let err = validate_block(&block, &parent, 1, &state.state_root(), &state, test_now()).unwrap_err();
        assert!(matches!(err, ChainError::InvalidBlock(reason) if reason.contains("nonce ordering")));
    }

    #[test]
    fn rejects_wrong_state_root_but_skips_empty() {
        let state = LedgerState::new();
        let parent = genesis();

        let mut child = mined_child(&parent, vec![], "deadbeef".to_string());
        assert!(validate_block(&child, &parent, 1, &state.state_root(), &state, test_now()).is_err());

        child.state_root = String::new();
        validate_block(&child, &parent, 1, &state.state_root(), &state, test_now()).unwrap();
    }

    #[test]
    fn rejects_insufficient_proof_of_work() {
        let state = LedgerState::new();
        let parent = genesis();
        let mut child = mined_child(&parent, vec![], state.state_root());
        // almost surely below four leading zeros
        child.proof = -1;
        let digest = pow::pow_digest(child.proof, parent.proof, child.index, "");
        if !pow::meets_difficulty(&digest, pow::MIN_DIFFICULTY) {
            assert!(validate_block(&child, &parent, 1, &state.state_root(), &state, test_now()).is_err());
        }
    }
}
