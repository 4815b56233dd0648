//! Proof-of-work: digest construction, nonce search, difficulty schedule

use crate::crypto::sha256_hex;

/// Difficulty never drops below four leading zero hex chars
pub const MIN_DIFFICULTY: u32 = 4;

/// Chain length at which difficulty starts growing
pub const DIFFICULTY_RETARGET_INTERVAL: u64 = 100;

/// Hex digest of the PoW calculation for a candidate nonce.
///
/// `calc = new_proof^2 - previous_proof^2 + index`, hashed together with the
/// block's concatenated transaction data. Squares are taken in i128 so large
/// nonces cannot overflow.
pub fn pow_digest(new_proof: i64, previous_proof: i64, index: u64, data: &str) -> String {
    let new_sq = (new_proof as i128) * (new_proof as i128);
    let prev_sq = (previous_proof as i128) * (previous_proof as i128);
    let calc = new_sq - prev_sq + index as i128;
    sha256_hex(format!("{calc}{data}").as_bytes())
}

/// Does the digest carry at least `difficulty` leading '0' hex chars?
pub fn meets_difficulty(digest: &str, difficulty: u32) -> bool {
    digest.len() >= difficulty as usize
        && digest.bytes().take(difficulty as usize).all(|b| b == b'0')
}

/// Search nonces from zero upward until the digest meets the target
pub fn find_nonce(previous_proof: i64, index: u64, data: &str, difficulty: u32) -> i64 {
    let mut nonce: i64 = 0;
    loop {
        if meets_difficulty(&pow_digest(nonce, previous_proof, index, data), difficulty) {
            return nonce;
        }
        nonce += 1;
    }
}

/// Difficulty schedule: 4 below ten blocks, then one extra zero per
/// `DIFFICULTY_RETARGET_INTERVAL` blocks of chain growth
pub fn difficulty_for_height(chain_len: usize) -> u32 {
    if chain_len < 10 {
        MIN_DIFFICULTY
    } else {
        MIN_DIFFICULTY + (chain_len as u64 / DIFFICULTY_RETARGET_INTERVAL) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn difficulty_schedule() {
        assert_eq!(difficulty_for_height(1), 4);
        assert_eq!(difficulty_for_height(9), 4);
        assert_eq!(difficulty_for_height(10), 4);
        assert_eq!(difficulty_for_height(99), 4);
        assert_eq!(difficulty_for_height(100), 5);
        assert_eq!(difficulty_for_height(250), 6);
    }

    #[test]
    fn digest_is_deterministic() {
        let a = pow_digest(42, 7, 3, "data");
        let b = pow_digest(42, 7, 3, "data");
        assert_eq!(a, b);
        assert_ne!(a, pow_digest(43, 7, 3, "data"));
    }

    #[test]
    fn found_nonce_meets_target() {
        let nonce = find_nonce(1, 2, "payload", 1);
        let digest = pow_digest(nonce, 1, 2, "payload");
        assert!(meets_difficulty(&digest, 1));
    }

    #[test]
    fn low_difficulty_converges_quickly() {
        // difficulty 1 should land within a few dozen attempts
        let nonce = find_nonce(1, 2, "", 1);
        assert!(nonce < 200);
    }

    #[test]
    fn leading_zero_check() {
        assert!(meets_difficulty("0000ab", 4));
        assert!(!meets_difficulty("000a", 4));
        assert!(!meets_difficulty("0", 4));
    }
}
