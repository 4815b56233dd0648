//! Crypto primitives: SHA-256 hashing, Ed25519 keypairs, address derivation
//!
//! Addresses are `"0x"` plus the first 40 hex chars of the SHA-256 of the
//! public key. Truncated SHA-256 is intentional (not Keccak-256).

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length of the hex portion of an address (20 bytes)
pub const ADDRESS_HEX_LEN: usize = 40;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature encoding")]
    InvalidSignature,
    #[error("Invalid hex: {0}")]
    InvalidHex(String),
}

/// Lowercase hex SHA-256 digest of arbitrary bytes
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Derive an account address from a hex-encoded public key
pub fn derive_address(public_key_hex: &str) -> String {
    let digest = sha256_hex(public_key_hex.as_bytes());
    format!("0x{}", &digest[..ADDRESS_HEX_LEN])
}

/// Ed25519 keypair used for transaction signing
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS RNG
    pub fn generate() -> Self {
        let mut key_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut key_bytes);
        Self {
            signing: SigningKey::from_bytes(&key_bytes),
        }
    }

    /// Restore a keypair from its 32-byte secret
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing.verifying_key().to_bytes())
    }

    pub fn address(&self) -> String {
        derive_address(&self.public_key_hex())
    }

    /// Sign a message, returning the hex-encoded signature
    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.signing.sign(message).to_bytes())
    }
}

/// Verify a hex signature over a message against a hex public key
pub fn verify(public_key_hex: &str, message: &[u8], signature_hex: &str) -> Result<bool, CryptoError> {
    let key_bytes: [u8; 32] = hex::decode(public_key_hex)
        .map_err(|e| CryptoError::InvalidHex(e.to_string()))?
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    let verifier = VerifyingKey::from_bytes(&key_bytes).map_err(|_| CryptoError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = hex::decode(signature_hex)
        .map_err(|e| CryptoError::InvalidHex(e.to_string()))?
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature)?;
    let signature = Signature::from_bytes(&sig_bytes);

    Ok(verifier.verify_strict(message, &signature).is_ok())
}
