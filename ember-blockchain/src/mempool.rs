//! Bounded FIFO of validated pending transactions
//!
//! The mempool has its own lock, independent of the chain lock, and the lock
//! is never held across validation, PoW, or I/O.

use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::warn;

use crate::types::Transaction;

/// Hard cap on pending transactions
pub const MAX_MEMPOOL_SIZE: usize = 10_000;

/// How many oldest entries are dropped when the pool is full
pub const MEMPOOL_EVICT_SIZE: usize = 1_000;

#[derive(Debug, Default)]
pub struct Mempool {
    inner: Mutex<VecDeque<Transaction>>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an already-validated transaction, evicting the oldest
    /// `MEMPOOL_EVICT_SIZE` entries first when the pool is at capacity
    pub fn push(&self, tx: Transaction) {
        let mut pool = self.inner.lock().expect("mempool lock poisoned");
        if pool.len() >= MAX_MEMPOOL_SIZE {
            let evicted = pool.drain(..MEMPOOL_EVICT_SIZE).count();
            warn!(evicted, "mempool full, evicted oldest entries");
        }
        pool.push_back(tx);
    }

    /// Remove and return up to `max` oldest transactions in FIFO order
    pub fn drain(&self, max: usize) -> Vec<Transaction> {
        let mut pool = self.inner.lock().expect("mempool lock poisoned");
        let take = max.min(pool.len());
        pool.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("mempool lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replay probe: is a transaction with this id, or this sender/nonce
    /// pair, already pending?
    pub fn has_pending(&self, transaction_id: &str, from: &str, nonce: u64) -> bool {
        let pool = self.inner.lock().expect("mempool lock poisoned");
        pool.iter()
            .any(|tx| tx.transaction_id == transaction_id || (tx.from == from && tx.nonce == nonce))
    }

    pub fn clear(&self) {
        self.inner.lock().expect("mempool lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(nonce: u64) -> Transaction {
        Transaction::new("0xa", "0xb", 1.0, 0.0, nonce).finalize("pk", "sig")
    }

    #[test]
    fn drain_preserves_fifo_order() {
        let pool = Mempool::new();
        for nonce in 0..5 {
            pool.push(tx(nonce));
        }
        let drained = pool.drain(3);
        assert_eq!(drained.iter().map(|t| t.nonce).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn size_never_exceeds_cap() {
        let pool = Mempool::new();
        for nonce in 0..(MAX_MEMPOOL_SIZE as u64 + 10) {
            pool.push(tx(nonce));
        }
        assert!(pool.len() <= MAX_MEMPOOL_SIZE);
    }

    #[test]
    fn full_pool_evicts_oldest_block_of_entries() {
        let pool = Mempool::new();
        for nonce in 0..MAX_MEMPOOL_SIZE as u64 {
            pool.push(tx(nonce));
        }
        pool.push(tx(999_999));
        assert_eq!(pool.len(), MAX_MEMPOOL_SIZE - MEMPOOL_EVICT_SIZE + 1);
        // the oldest entries are gone
        let first = pool.drain(1);
        assert_eq!(first[0].nonce, MEMPOOL_EVICT_SIZE as u64);
    }

    #[test]
    fn pending_probe_matches_id_and_sender_nonce() {
        let pool = Mempool::new();
        let t = tx(4);
        pool.push(t.clone());
        assert!(pool.has_pending(&t.transaction_id, "other", 0));
        assert!(pool.has_pending("other-id", "0xa", 4));
        assert!(!pool.has_pending("other-id", "0xa", 5));
    }
}
