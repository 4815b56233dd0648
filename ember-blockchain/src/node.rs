//! A blockchain node: TCP gossip, chain sync handlers, and mining control
//!
//! The node owns its ledger and exposes a narrow `NodeApi` capability to
//! collaborators (the RPC layer); neither the RPC layer nor peers ever touch
//! the mutable ledger directly.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chain::Blockchain;
use crate::error::ChainResult;
use crate::miner::{Miner, MiningStats, DEFAULT_MINE_INTERVAL_MS};
use crate::network::peer::{spawn_connection, PeerEvent, PeerHandle};
use crate::network::{MessageType, NetworkMessage};
use crate::state::AccountEntry;
use crate::types::{Block, Transaction};

/// Bound on the node's inbound message mailbox
pub const MAX_PENDING_TRANSACTIONS: usize = 5_000;

/// Account state snapshot exchanged during state sync
#[derive(Debug, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub state_root: String,
    pub block_height: u64,
    pub node_id: String,
    pub accounts: BTreeMap<String, AccountInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountInfo {
    pub balance: f64,
    pub nonce: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SyncRequestPayload {
    from_height: u64,
}

/// One node in the network
pub struct BlockchainNode {
    node_id: String,
    port: u16,
    blockchain: Arc<Blockchain>,
    /// Live peers keyed by node id (provisionally by address while dialing)
    peers: RwLock<HashMap<String, PeerHandle>>,
    /// Addresses we may dial, from configuration or PEER_LIST gossip
    known_peers: Mutex<HashMap<String, String>>,
    miner: Miner,
    events_tx: Mutex<Option<mpsc::Sender<PeerEvent>>>,
    mined_tx: mpsc::UnboundedSender<Block>,
    mined_rx: Mutex<Option<mpsc::UnboundedReceiver<Block>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BlockchainNode {
    pub fn new(node_id: &str, port: u16) -> Arc<Self> {
        Self::with_chain(node_id, port, Arc::new(Blockchain::new()))
    }

    pub fn with_chain(node_id: &str, port: u16, blockchain: Arc<Blockchain>) -> Arc<Self> {
        let (mined_tx, mined_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            node_id: node_id.to_string(),
            port,
            blockchain,
            peers: RwLock::new(HashMap::new()),
            known_peers: Mutex::new(HashMap::new()),
            miner: Miner::new(),
            events_tx: Mutex::new(None),
            mined_tx,
            mined_rx: Mutex::new(Some(mined_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn blockchain(&self) -> &Arc<Blockchain> {
        &self.blockchain
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Bind the listener and spawn the acceptor, mailbox and broadcast tasks
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .with_context(|| format!("Failed to bind port {}", self.port))?;

        let (events_tx, mut events_rx) = mpsc::channel(MAX_PENDING_TRANSACTIONS);
        *self.events_tx.lock().expect("events lock poisoned") = Some(events_tx.clone());

        let acceptor = {
            let events = events_tx.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, _)) => {
                            spawn_connection(stream, events.clone());
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            break;
                        }
                    }
                }
            })
        };

        let event_loop = {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    node.handle_event(event).await;
                }
            })
        };

        let mut tasks = vec![acceptor, event_loop];

        if let Some(mut mined_rx) = self.mined_rx.lock().expect("miner rx lock poisoned").take() {
            let node = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                while let Some(block) = mined_rx.recv().await {
                    node.broadcast_block(&block).await;
                }
            }));
        }

        self.tasks.lock().expect("tasks lock poisoned").extend(tasks);
        info!(node = %self.node_id, port = self.port, "node listening");
        Ok(())
    }

    /// Stop mining and tear down network tasks
    pub fn stop(&self) {
        self.miner.stop();
        for task in self.tasks.lock().expect("tasks lock poisoned").drain(..) {
            task.abort();
        }
        info!(node = %self.node_id, "node stopped");
    }

    // ========================================================================
    // Peers
    // ========================================================================

    /// Record an address for later dialing
    pub fn register_peer_address(&self, peer_id: &str, address: &str) {
        self.known_peers
            .lock()
            .expect("known peers lock poisoned")
            .insert(peer_id.to_string(), address.to_string());
    }

    /// Dial and handshake a peer
    pub async fn connect_to_peer(self: &Arc<Self>, host: &str, port: u16) -> anyhow::Result<()> {
        let events_tx = self
            .events_tx
            .lock()
            .expect("events lock poisoned")
            .clone()
            .context("node not started")?;

        let stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("Failed to connect to {host}:{port}"))?;
        let outbound = spawn_connection(stream, events_tx);

        let address = format!("{host}:{port}");
        outbound
            .send(NetworkMessage::new(
                MessageType::Handshake,
                &self.node_id,
                self.node_id.clone(),
            ))
            .await
            .map_err(|_| anyhow::anyhow!("handshake send failed"))?;

        // provisional entry until the peer's handshake names it
        self.peers
            .write()
            .await
            .insert(address.clone(), PeerHandle::new(&address, &address, outbound));
        info!(node = %self.node_id, peer = %address, "connected to peer");
        Ok(())
    }

    /// Dial every known address that has no live connection yet
    pub async fn dial_known_peers(self: &Arc<Self>) {
        let known: Vec<(String, String)> = {
            let known = self.known_peers.lock().expect("known peers lock poisoned");
            known.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        for (peer_id, address) in known {
            if self.peers.read().await.contains_key(&peer_id) {
                continue;
            }
            let Some((host, port)) = address.rsplit_once(':') else {
                warn!(peer = %peer_id, address = %address, "malformed peer address");
                continue;
            };
            let Ok(port) = port.parse::<u16>() else {
                warn!(peer = %peer_id, address = %address, "malformed peer port");
                continue;
            };
            if let Err(e) = self.connect_to_peer(host, port).await {
                warn!(peer = %peer_id, error = %e, "dial failed");
            }
        }
    }

    pub async fn remove_peer(&self, peer_id: &str) {
        self.peers.write().await.remove(peer_id);
    }

    pub async fn get_peers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    // ========================================================================
    // Gossip
    // ========================================================================

    /// Send to every peer except the optional exclusion (the original
    /// sender of a relayed message)
    pub async fn broadcast(&self, message: NetworkMessage, exclude: Option<&str>) {
        let peers = self.peers.read().await;
        for (peer_id, handle) in peers.iter() {
            if Some(peer_id.as_str()) == exclude {
                continue;
            }
            if let Err(e) = handle.send(message.clone()) {
                debug!(peer = %peer_id, error = %e, "broadcast send failed");
            }
        }
    }

    pub async fn broadcast_transaction(&self, tx: &Transaction) {
        match serde_json::to_string(tx) {
            Ok(payload) => {
                let message = NetworkMessage::new(MessageType::NewTransaction, &self.node_id, payload);
                self.broadcast(message, None).await;
            }
            Err(e) => warn!(error = %e, "failed to serialize transaction"),
        }
    }

    pub async fn broadcast_block(&self, block: &Block) {
        match serde_json::to_string(block) {
            Ok(payload) => {
                debug!(node = %self.node_id, index = block.index, "broadcasting block");
                let message = NetworkMessage::new(MessageType::NewBlock, &self.node_id, payload);
                self.broadcast(message, None).await;
            }
            Err(e) => warn!(error = %e, "failed to serialize block"),
        }
    }

    /// Ask a specific peer for its chain
    pub async fn request_chain_sync(&self, peer_id: &str) {
        let peers = self.peers.read().await;
        if let Some(handle) = peers.get(peer_id) {
            let message = NetworkMessage::new(
                MessageType::SyncRequest,
                &self.node_id,
                json!({ "from_height": self.blockchain.chain_height() }).to_string(),
            );
            let _ = handle.send(message);
        }
    }

    /// Ask a specific peer for its account state snapshot
    pub async fn request_state_sync(&self, peer_id: &str) {
        let peers = self.peers.read().await;
        if let Some(handle) = peers.get(peer_id) {
            let message =
                NetworkMessage::new(MessageType::StateSyncRequest, &self.node_id, self.node_id.clone());
            let _ = handle.send(message);
        }
    }

    // ========================================================================
    // Message handling
    // ========================================================================

    async fn handle_event(self: &Arc<Self>, event: PeerEvent) {
        match event {
            PeerEvent::Message {
                message,
                reply,
                remote_addr,
            } => self.handle_message(message, reply, remote_addr).await,
            PeerEvent::Disconnected { remote_addr } => {
                let mut peers = self.peers.write().await;
                let before = peers.len();
                peers.retain(|_, p| p.address != remote_addr);
                if peers.len() != before {
                    info!(node = %self.node_id, peer = %remote_addr, "peer disconnected");
                }
            }
        }
    }

    async fn handle_message(
        self: &Arc<Self>,
        message: NetworkMessage,
        reply: mpsc::Sender<NetworkMessage>,
        remote_addr: String,
    ) {
        let sender_id = message.sender_id.clone();
        match message.message_type {
            MessageType::Handshake => {
                let newly = {
                    let mut peers = self.peers.write().await;
                    // drop the provisional address-keyed entry from our dial
                    peers.remove(&remote_addr);
                    let newly = !peers.contains_key(&sender_id);
                    peers.insert(
                        sender_id.clone(),
                        PeerHandle::new(&sender_id, &remote_addr, reply.clone()),
                    );
                    newly
                };
                if newly {
                    info!(node = %self.node_id, peer = %sender_id, "handshake received");
                    let _ = reply
                        .send(NetworkMessage::new(
                            MessageType::Handshake,
                            &self.node_id,
                            self.node_id.clone(),
                        ))
                        .await;
                }
                // share the addresses we know so the peer can widen its view
                let known = self
                    .known_peers
                    .lock()
                    .expect("known peers lock poisoned")
                    .clone();
                if !known.is_empty() {
                    if let Ok(payload) = serde_json::to_string(&known) {
                        let _ = reply
                            .send(NetworkMessage::new(MessageType::PeerList, &self.node_id, payload))
                            .await;
                    }
                }
            }

            MessageType::NewTransaction => match serde_json::from_str::<Transaction>(&message.payload) {
                Ok(tx) => match self.blockchain.submit_transaction(tx) {
                    Ok(id) => {
                        debug!(node = %self.node_id, id = %id, "gossiped transaction accepted");
                        // relay only what we accepted, never back to the sender
                        self.broadcast(message, Some(&sender_id)).await;
                    }
                    Err(e) => debug!(node = %self.node_id, error = %e, "gossiped transaction rejected"),
                },
                Err(e) => warn!(error = %e, "malformed transaction payload"),
            },

            MessageType::NewBlock => match serde_json::from_str::<Block>(&message.payload) {
                Ok(block) => {
                    let index = block.index;
                    match self.blockchain.apply_synced_block(block) {
                        Ok(()) => {
                            info!(node = %self.node_id, index, "gossiped block appended");
                            self.broadcast(message, Some(&sender_id)).await;
                        }
                        Err(e) => debug!(node = %self.node_id, index, error = %e, "gossiped block rejected"),
                    }
                }
                Err(e) => warn!(error = %e, "malformed block payload"),
            },

            MessageType::RequestChain => match serde_json::to_string(&self.blockchain.get_chain()) {
                Ok(payload) => {
                    let _ = reply
                        .send(NetworkMessage::new(MessageType::ResponseChain, &self.node_id, payload))
                        .await;
                }
                Err(e) => warn!(error = %e, "failed to serialize chain"),
            },

            MessageType::ResponseChain => match serde_json::from_str::<Vec<Block>>(&message.payload) {
                Ok(blocks) => self.adopt_chain_suffix(blocks),
                Err(e) => warn!(error = %e, "malformed chain payload"),
            },

            MessageType::SyncRequest => {
                let from_height = serde_json::from_str::<SyncRequestPayload>(&message.payload)
                    .map(|p| p.from_height)
                    .unwrap_or(0);
                match serde_json::to_string(&self.blockchain.chain_suffix(from_height)) {
                    Ok(payload) => {
                        let _ = reply
                            .send(NetworkMessage::new(MessageType::SyncResponse, &self.node_id, payload))
                            .await;
                    }
                    Err(e) => warn!(error = %e, "failed to serialize chain suffix"),
                }
            }

            MessageType::SyncResponse => match serde_json::from_str::<Vec<Block>>(&message.payload) {
                Ok(blocks) => self.adopt_chain_suffix(blocks),
                Err(e) => warn!(error = %e, "malformed sync payload"),
            },

            MessageType::PeerList => match serde_json::from_str::<HashMap<String, String>>(&message.payload) {
                Ok(list) => {
                    let mut known = self.known_peers.lock().expect("known peers lock poisoned");
                    for (peer_id, address) in list {
                        if peer_id != self.node_id {
                            known.entry(peer_id).or_insert(address);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "malformed peer list payload"),
            },

            MessageType::Ack => debug!(node = %self.node_id, peer = %sender_id, "ack"),

            MessageType::StateSyncRequest => {
                let snapshot = self.state_snapshot();
                match serde_json::to_string(&snapshot) {
                    Ok(payload) => {
                        let _ = reply
                            .send(NetworkMessage::new(
                                MessageType::StateSyncResponse,
                                &self.node_id,
                                payload,
                            ))
                            .await;
                    }
                    Err(e) => warn!(error = %e, "failed to serialize state snapshot"),
                }
            }

            MessageType::StateSyncResponse => {
                match serde_json::from_str::<StateSnapshot>(&message.payload) {
                    Ok(snapshot) => self.compare_state_snapshot(&snapshot),
                    Err(e) => warn!(error = %e, "malformed state snapshot payload"),
                }
            }
        }
    }

    /// Validate and append the incoming blocks beyond the local tip; any
    /// failure aborts the attempt without truncating the local chain
    fn adopt_chain_suffix(&self, blocks: Vec<Block>) {
        let local_height = self.blockchain.chain_height();
        let mut suffix: Vec<Block> = blocks.into_iter().filter(|b| b.index > local_height).collect();
        suffix.sort_by_key(|b| b.index);

        for block in suffix {
            let index = block.index;
            if let Err(e) = self.blockchain.apply_synced_block(block) {
                warn!(node = %self.node_id, index, error = %e, "chain sync aborted");
                return;
            }
        }
    }

    /// Current `{state_root, block_height, accounts}` snapshot
    pub fn state_snapshot(&self) -> StateSnapshot {
        let accounts = self
            .blockchain
            .get_state()
            .into_iter()
            .map(|entry: AccountEntry| {
                (
                    entry.address,
                    AccountInfo {
                        balance: entry.balance,
                        nonce: entry.nonce.unwrap_or(0),
                    },
                )
            })
            .collect();
        StateSnapshot {
            state_root: self.blockchain.state_root(),
            block_height: self.blockchain.chain_height(),
            node_id: self.node_id.clone(),
            accounts,
        }
    }

    fn compare_state_snapshot(&self, snapshot: &StateSnapshot) {
        let local_root = self.blockchain.state_root();
        let local_height = self.blockchain.chain_height();
        if snapshot.state_root == local_root {
            info!(
                node = %self.node_id,
                peer = %snapshot.node_id,
                height = local_height,
                "state in sync"
            );
        } else if snapshot.block_height == local_height {
            // divergence at equal height; resolution is out of scope
            warn!(
                node = %self.node_id,
                peer = %snapshot.node_id,
                local_root = %&local_root[..16.min(local_root.len())],
                remote_root = %&snapshot.state_root[..16.min(snapshot.state_root.len())],
                "state divergence at equal height"
            );
        } else {
            debug!(
                node = %self.node_id,
                peer = %snapshot.node_id,
                local_height,
                remote_height = snapshot.block_height,
                "state snapshot at different height"
            );
        }
    }

    // ========================================================================
    // Mining control
    // ========================================================================

    pub fn start_mining(&self, interval: Option<Duration>) {
        self.miner.start(
            Arc::clone(&self.blockchain),
            interval.unwrap_or(Duration::from_millis(DEFAULT_MINE_INTERVAL_MS)),
            Some(self.mined_tx.clone()),
        );
    }

    pub fn stop_mining(&self) {
        self.miner.stop();
    }

    pub fn mining_stats(&self) -> MiningStats {
        self.miner.stats(&self.blockchain)
    }
}

// ============================================================================
// NodeApi
// ============================================================================

/// Narrow capability object for RPC and other collaborators: ledger reads,
/// transaction submission, and mining control. Never the mutable ledger.
#[derive(Clone)]
pub struct NodeApi {
    node: Arc<BlockchainNode>,
}

impl NodeApi {
    pub fn new(node: Arc<BlockchainNode>) -> Self {
        Self { node }
    }

    pub fn node_id(&self) -> String {
        self.node.node_id().to_string()
    }

    pub fn get_balance(&self, address: &str) -> f64 {
        self.node.blockchain.get_balance(address)
    }

    pub fn get_nonce(&self, address: &str) -> Option<u64> {
        self.node.blockchain.get_nonce(address)
    }

    pub fn expected_nonce(&self, address: &str) -> u64 {
        self.node.blockchain.expected_nonce(address)
    }

    pub fn get_state(&self) -> Vec<AccountEntry> {
        self.node.blockchain.get_state()
    }

    pub fn state_root(&self) -> String {
        self.node.blockchain.state_root()
    }

    /// Submit locally, then gossip on success
    pub async fn submit_transaction(&self, tx: Transaction) -> ChainResult<String> {
        let id = self.node.blockchain.submit_transaction(tx.clone())?;
        self.node.broadcast_transaction(&tx).await;
        Ok(id)
    }

    pub fn chain_height(&self) -> u64 {
        self.node.blockchain.chain_height()
    }

    pub fn block_by_index(&self, index: u64) -> Option<Block> {
        self.node.blockchain.block_by_index(index)
    }

    pub fn block_by_hash(&self, hash: &str) -> Option<Block> {
        self.node.blockchain.block_by_hash(hash)
    }

    pub fn mempool_size(&self) -> usize {
        self.node.blockchain.mempool_size()
    }

    pub fn difficulty(&self) -> u32 {
        self.node.blockchain.difficulty()
    }

    pub fn total_transactions(&self) -> usize {
        self.node.blockchain.total_transactions()
    }

    pub fn account_count(&self) -> usize {
        self.node.blockchain.account_count()
    }

    pub async fn peer_count(&self) -> usize {
        self.node.peer_count().await
    }

    pub fn start_mining(&self) {
        self.node.start_mining(None);
    }

    pub fn stop_mining(&self) {
        self.node.stop_mining();
    }

    pub fn mining_stats(&self) -> MiningStats {
        self.node.mining_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_snapshot_reflects_ledger() {
        let node = BlockchainNode::new("node-1", 0);
        node.blockchain().create_account("0xa", 42.0);

        let snapshot = node.state_snapshot();
        assert_eq!(snapshot.node_id, "node-1");
        assert_eq!(snapshot.block_height, 1);
        assert_eq!(snapshot.accounts["0xa"].balance, 42.0);
        assert_eq!(snapshot.state_root, node.blockchain().state_root());
    }

    #[tokio::test]
    async fn gossip_propagates_transactions_and_blocks() {
        let alice = BlockchainNode::new("alice", 19101);
        let bob = BlockchainNode::new("bob", 19102);

        // share a genesis
        let genesis_store = tempfile::tempdir().unwrap();
        let store = crate::storage::PersistentStore::open(genesis_store.path()).unwrap();
        alice.blockchain().attach_store(store.clone());
        alice.blockchain().create_account("0xa", 100.0);
        alice.blockchain().create_account("0xb", 0.0);
        bob.blockchain().attach_store(store);
        bob.blockchain().restore().unwrap();

        alice.start().await.unwrap();
        bob.start().await.unwrap();
        alice.connect_to_peer("127.0.0.1", 19102).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(alice.peer_count().await, 1);
        assert_eq!(bob.peer_count().await, 1);

        let tx = Transaction::new("0xa", "0xb", 10.0, 1.0, 0).finalize("0xa", "sig");
        alice.blockchain().submit_transaction(tx.clone()).unwrap();
        alice.broadcast_transaction(&tx).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(bob.blockchain().mempool_size(), 1);

        let block = alice.blockchain().mine_block(10).unwrap();
        alice.broadcast_block(&block).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(bob.blockchain().chain_height(), 2);
        assert_eq!(bob.blockchain().get_balance("0xa"), 89.0);

        alice.stop();
        bob.stop();
    }
}
