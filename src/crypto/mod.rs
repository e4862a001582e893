//! Cryptographic utilities for the ledger
//!
//! This module provides:
//! - SHA-256 hashing, UTXO keys and the hex difficulty check
//! - secp256k1 node identity
//! - Merkle tree construction and inclusion proofs

pub mod hash;
pub mod keys;
pub mod merkle;

pub use hash::{meets_difficulty, sha256, sha256_hex, target_prefix, utxo_key};
pub use keys::{public_key_to_address, KeyError, KeyPair};
pub use merkle::{build_merkle_tree, merkle_root, tree_depth, MerkleNode, MerkleProof};
