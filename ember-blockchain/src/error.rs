//! Error taxonomy for the core ledger, VM and boundary layers

use thiserror::Error;

use crate::contract::vm::VmError;
use crate::crypto::CryptoError;

/// Errors surfaced by core chain operations
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Chain is empty")]
    ChainEmpty,
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("Insufficient balance")]
    InsufficientBalance,
    #[error("Replay detected")]
    ReplayDetected,
    #[error("Invalid signature")]
    SignatureInvalid,
    #[error("Contract not found: {0}")]
    ContractNotFound(String),
    #[error("VM error: {0}")]
    Vm(#[from] VmError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("IO error at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Network error: {0}")]
    Network(String),
}

pub type ChainResult<T> = Result<T, ChainError>;
