//! Background mining worker
//!
//! A dedicated thread repeatedly drains the mempool through `mine_block` and
//! hands each mined block to the node for broadcast. Control is lock-free:
//! an atomic running flag plus atomic counters for stats.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::chain::{Blockchain, MAX_BLOCK_TRANSACTIONS};
use crate::types::Block;

/// Default pause between mining rounds
pub const DEFAULT_MINE_INTERVAL_MS: u64 = 2_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningStats {
    pub blocks_mined: u64,
    pub is_active: bool,
    pub difficulty: u32,
}

pub struct Miner {
    running: Arc<AtomicBool>,
    blocks_mined: Arc<AtomicU64>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Miner {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            blocks_mined: Arc::new(AtomicU64::new(0)),
            handle: Mutex::new(None),
        }
    }

    /// Start the worker; a second call while running is a no-op.
    ///
    /// Mined blocks are pushed into `found` for the async side to broadcast.
    pub fn start(
        &self,
        chain: Arc<Blockchain>,
        interval: Duration,
        found: Option<UnboundedSender<Block>>,
    ) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("mining worker starting");

        let running = Arc::clone(&self.running);
        let blocks_mined = Arc::clone(&self.blocks_mined);

        let handle = thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                match chain.mine_block(MAX_BLOCK_TRANSACTIONS) {
                    Ok(block) => {
                        blocks_mined.fetch_add(1, Ordering::SeqCst);
                        if let Some(tx) = &found {
                            let _ = tx.send(block);
                        }
                    }
                    Err(e) => warn!(error = %e, "mining round failed"),
                }
                thread::sleep(interval);
            }
            info!("mining worker stopped");
        });

        *self.handle.lock().expect("miner lock poisoned") = Some(handle);
    }

    /// Stop the worker and wait for the current round to finish
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.lock().expect("miner lock poisoned").take() {
            if handle.join().is_err() {
                warn!("mining thread panicked");
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self, chain: &Blockchain) -> MiningStats {
        MiningStats {
            blocks_mined: self.blocks_mined.load(Ordering::SeqCst),
            is_active: self.is_active(),
            difficulty: chain.difficulty(),
        }
    }
}

impl Default for Miner {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Miner {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_mines_and_stops_cleanly() {
        let chain = Arc::new(Blockchain::new());
        let miner = Miner::new();

        miner.start(Arc::clone(&chain), Duration::from_millis(10), None);
        assert!(miner.is_active());
        // second start is a no-op
        miner.start(Arc::clone(&chain), Duration::from_millis(10), None);

        while miner.stats(&chain).blocks_mined == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        miner.stop();
        assert!(!miner.is_active());
        assert!(chain.chain_height() > 1);
        assert!(chain.is_chain_valid());

        // stop is idempotent
        miner.stop();
    }
}
