//! Multi-node coordination: the network manager and consensus monitor
//!
//! The manager owns every node it creates and runs a periodic monitor that
//! compares chain heights and pulls missing suffixes onto shorter chains,
//! validating every block against the growing local tip. A failed block
//! aborts that sync attempt; nothing is ever truncated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::node::BlockchainNode;
use crate::types::Block;

/// Cadence of the consensus monitor
pub const SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Poll step used while waiting for convergence
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Owns a set of nodes and keeps their chains converged
pub struct NetworkManager {
    /// Nodes in first-observed order; order breaks fork-length ties
    nodes: Arc<Mutex<Vec<Arc<BlockchainNode>>>>,
    running: Arc<AtomicBool>,
    monitor: Mutex<Option<thread::JoinHandle<()>>>,
}

impl NetworkManager {
    pub fn new() -> Self {
        Self {
            nodes: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            monitor: Mutex::new(None),
        }
    }

    // ========================================================================
    // Node registry
    // ========================================================================

    pub fn create_node(&self, node_id: &str, port: u16) -> Arc<BlockchainNode> {
        let node = BlockchainNode::new(node_id, port);
        self.nodes.lock().expect("nodes lock poisoned").push(Arc::clone(&node));
        info!(node = node_id, port, "node created");
        node
    }

    /// Register an externally built node (e.g. one restored from storage)
    pub fn add_node(&self, node: Arc<BlockchainNode>) {
        self.nodes.lock().expect("nodes lock poisoned").push(node);
    }

    pub fn get_node(&self, node_id: &str) -> Option<Arc<BlockchainNode>> {
        self.nodes
            .lock()
            .expect("nodes lock poisoned")
            .iter()
            .find(|n| n.node_id() == node_id)
            .cloned()
    }

    pub fn has_node(&self, node_id: &str) -> bool {
        self.get_node(node_id).is_some()
    }

    pub fn all_nodes(&self) -> Vec<Arc<BlockchainNode>> {
        self.nodes.lock().expect("nodes lock poisoned").clone()
    }

    /// Wire two nodes as peers of each other (addresses are dialed when the
    /// nodes start their network listeners)
    pub fn connect_peers(&self, first_id: &str, second_id: &str) {
        let (Some(first), Some(second)) = (self.get_node(first_id), self.get_node(second_id)) else {
            warn!(first_id, second_id, "cannot connect peers, node missing");
            return;
        };
        first.register_peer_address(second_id, &format!("127.0.0.1:{}", second.port()));
        second.register_peer_address(first_id, &format!("127.0.0.1:{}", first.port()));
        info!(first_id, second_id, "peers connected");
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start every node's listener, dial configured peers, then start the
    /// consensus monitor
    pub async fn start_all_nodes(&self) -> anyhow::Result<()> {
        let nodes = self.all_nodes();
        for node in &nodes {
            node.start().await?;
        }
        for node in &nodes {
            node.dial_known_peers().await;
        }
        self.start_monitor();
        Ok(())
    }

    /// Launch the periodic consensus monitor thread
    pub fn start_monitor(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let nodes = Arc::clone(&self.nodes);
        let running = Arc::clone(&self.running);

        let handle = thread::spawn(move || {
            info!("consensus monitor started");
            while running.load(Ordering::SeqCst) {
                thread::sleep(SYNC_INTERVAL);
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let snapshot = nodes.lock().expect("nodes lock poisoned").clone();
                Self::sync_chains(&snapshot);
            }
            info!("consensus monitor stopped");
        });
        *self.monitor.lock().expect("monitor lock poisoned") = Some(handle);
    }

    pub fn stop_all_nodes(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.monitor.lock().expect("monitor lock poisoned").take() {
            let _ = handle.join();
        }
        for node in self.all_nodes() {
            node.stop();
        }
    }

    // ========================================================================
    // Chain synchronization
    // ========================================================================

    /// One sync round: find the longest chain (first-observed wins ties) and
    /// pull its suffix onto every shorter node
    fn sync_chains(nodes: &[Arc<BlockchainNode>]) {
        let Some(best) = nodes.iter().max_by_key(|n| n.blockchain().chain_height()) else {
            return;
        };
        // max_by_key returns the last maximum; scan in observed order instead
        let best_height = best.blockchain().chain_height();
        let best = nodes
            .iter()
            .find(|n| n.blockchain().chain_height() == best_height)
            .expect("non-empty node list");

        for node in nodes {
            if Arc::ptr_eq(node, best) {
                continue;
            }
            let local_height = node.blockchain().chain_height();
            if local_height >= best_height {
                continue;
            }

            debug!(
                node = node.node_id(),
                source = best.node_id(),
                local_height,
                best_height,
                "syncing chain suffix"
            );
            let suffix = best.blockchain().chain_suffix(local_height);
            for block in suffix {
                let index = block.index;
                if let Err(e) = node.blockchain().apply_synced_block(block) {
                    warn!(node = node.node_id(), index, error = %e, "sync attempt aborted");
                    break;
                }
            }
        }
    }

    /// Run one synchronous sync round over the current node set
    pub fn sync_once(&self) {
        let nodes = self.all_nodes();
        Self::sync_chains(&nodes);
    }

    // ========================================================================
    // Convergence queries
    // ========================================================================

    pub fn is_network_synced(&self, max_height_diff: u64) -> bool {
        let nodes = self.all_nodes();
        if nodes.len() < 2 {
            return true;
        }
        let heights: Vec<u64> = nodes.iter().map(|n| n.blockchain().chain_height()).collect();
        let min = heights.iter().min().copied().unwrap_or(0);
        let max = heights.iter().max().copied().unwrap_or(0);
        max - min <= max_height_diff
    }

    /// Block until every chain height matches, or the deadline passes.
    /// Returns whether the network converged; the nodes keep running either
    /// way.
    pub fn wait_for_sync(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.sync_once();
            if self.is_network_synced(0) {
                info!("network synced");
                return true;
            }
            if Instant::now() >= deadline {
                warn!(?timeout, "sync wait expired before convergence");
                return false;
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    pub fn get_network_height(&self) -> u64 {
        self.all_nodes()
            .iter()
            .map(|n| n.blockchain().chain_height())
            .max()
            .unwrap_or(0)
    }

    pub fn get_chain_heights(&self) -> HashMap<String, u64> {
        self.all_nodes()
            .iter()
            .map(|n| (n.node_id().to_string(), n.blockchain().chain_height()))
            .collect()
    }

    pub fn get_sync_status(&self) -> HashMap<String, bool> {
        let network_height = self.get_network_height();
        self.all_nodes()
            .iter()
            .map(|n| {
                (
                    n.node_id().to_string(),
                    n.blockchain().chain_height() == network_height,
                )
            })
            .collect()
    }

    pub fn get_state_roots(&self) -> HashMap<String, String> {
        self.all_nodes()
            .iter()
            .map(|n| (n.node_id().to_string(), n.blockchain().state_root()))
            .collect()
    }

    /// Do all nodes agree on the account state root?
    pub fn is_state_synced(&self) -> bool {
        let roots = self.get_state_roots();
        let mut values = roots.values();
        match values.next() {
            Some(first) => values.all(|r| r == first),
            None => true,
        }
    }

    /// Longest-chain fork resolution; ties go to the first observed
    pub fn resolve_fork(candidates: &[Vec<Block>]) -> Option<&Vec<Block>> {
        let mut best: Option<&Vec<Block>> = None;
        for candidate in candidates {
            match best {
                Some(current) if candidate.len() <= current.len() => {}
                _ => best = Some(candidate),
            }
        }
        if let Some(chain) = best {
            info!(length = chain.len(), "fork resolved to longest chain");
        }
        best
    }
}

impl Default for NetworkManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NetworkManager {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.monitor.lock().expect("monitor lock poisoned").take() {
            let _ = handle.join();
        }
    }
}
