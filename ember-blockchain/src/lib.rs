//! Ember - a proof-of-work ledger with an account model and contract VM
//!
//! # Modules
//! - `crypto` - hashing, keypairs, address derivation
//! - `types` - transactions, blocks, canonical encoding, merkle roots
//! - `state` - balances, nonces, state-root computation
//! - `mempool` - bounded FIFO of validated pending transactions
//! - `pow` - proof-of-work engine and difficulty schedule
//! - `validation` - transaction checks and the advanced block validator
//! - `chain` - the ledger state machine
//! - `contract` - stack VM, gas accounting, contract registry
//! - `network` - newline-delimited JSON gossip over TCP
//! - `node` - a node: peers, handlers, mining control, `NodeApi`
//! - `sync` - multi-node manager, consensus monitor, fork resolution
//! - `storage` - JSON file persistence
//! - `api` - JSON-RPC 2.0 server

pub mod api;
pub mod chain;
pub mod contract;
pub mod crypto;
pub mod error;
pub mod mempool;
pub mod miner;
pub mod network;
pub mod node;
pub mod pow;
pub mod state;
pub mod storage;
pub mod sync;
pub mod types;
pub mod validation;

pub use chain::Blockchain;
pub use error::{ChainError, ChainResult};
pub use node::{BlockchainNode, NodeApi};
pub use sync::NetworkManager;
pub use types::{Block, Transaction};
