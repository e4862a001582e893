//! Cryptographic hashing utilities for the ledger
//!
//! Provides the SHA-256 based hashing used for transaction IDs, block
//! hashes, UTXO keys and merkle tree nodes. Every digest that leaves this
//! module is lowercase hex.

use sha2::{Digest, Sha256};

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Computes SHA-256 hash and returns it as a hex string
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Key of the UTXO created by output `index` of transaction `txn_id`
pub fn utxo_key(txn_id: &str, index: u32) -> String {
    sha256_hex(format!("{}:{}", txn_id, index).as_bytes())
}

/// Checks if a hex hash meets the difficulty target
/// The hash must start with `difficulty` zero characters
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    let required = difficulty as usize;
    hash.len() >= required && hash.bytes().take(required).all(|c| c == b'0')
}

/// The zero prefix a hash needs at the given difficulty
pub fn target_prefix(difficulty: u32) -> String {
    "0".repeat(difficulty as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256() {
        let data = b"hello world";
        let hash = sha256(data);
        assert_eq!(hash.len(), 32);
        assert_eq!(
            sha256_hex(data),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_utxo_key_depends_on_index() {
        let a = utxo_key("abc", 0);
        let b = utxo_key("abc", 1);
        assert_ne!(a, b);
        assert_eq!(a, sha256_hex(b"abc:0"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_meets_difficulty() {
        assert!(meets_difficulty("0000ab12", 4));
        assert!(meets_difficulty("0000ab12", 2));
        assert!(meets_difficulty("ab12", 0));
        assert!(!meets_difficulty("000ab12", 4));
        assert!(!meets_difficulty("00", 4));
    }

    #[test]
    fn test_target_prefix() {
        assert_eq!(target_prefix(4), "0000");
        assert_eq!(target_prefix(0), "");
    }
}
