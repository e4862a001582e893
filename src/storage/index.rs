//! Confirmed transaction and merkle root indexes
//!
//! Provides lookup of:
//! - Confirmed transactions by ID (stamped with their block hash)
//! - Merkle trees by root value

use crate::core::{Block, Transaction};
use crate::crypto::{build_merkle_tree, MerkleNode, MerkleProof};
use std::collections::HashMap;

// =============================================================================
// Transaction Index
// =============================================================================

/// Permanent index of confirmed transactions
#[derive(Debug, Default)]
pub struct TransactionIndex {
    by_id: HashMap<String, Transaction>,
}

impl TransactionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every transaction of a confirmed block
    pub fn index_block(&mut self, block: &Block) {
        for txn in &block.transactions {
            self.insert_confirmed(txn.clone(), &block.hash);
        }
    }

    /// Record a transaction, stamping the hash of its confirming block
    pub fn insert_confirmed(&mut self, mut txn: Transaction, block_hash: &str) {
        txn.block_hash = block_hash.to_string();
        self.by_id.insert(txn.id.clone(), txn);
    }

    pub fn get(&self, id: &str) -> Option<&Transaction> {
        self.by_id.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

// =============================================================================
// Merkle Index
// =============================================================================

/// Merkle trees of confirmed blocks, keyed by root value
#[derive(Debug, Default)]
pub struct MerkleIndex {
    by_root: HashMap<String, MerkleNode>,
}

impl MerkleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and register the tree of a block's transaction list
    ///
    /// Returns the root value. Empty blocks register nothing.
    pub fn register_block(&mut self, block: &Block) -> String {
        let ids: Vec<&str> = block.transactions.iter().map(|txn| txn.id.as_str()).collect();
        let tree = build_merkle_tree(&ids);
        let root = tree.value.clone();
        if !root.is_empty() {
            self.by_root.insert(root.clone(), tree);
        }
        root
    }

    pub fn get(&self, root: &str) -> Option<&MerkleNode> {
        self.by_root.get(root)
    }

    /// Inclusion proof for the transaction at `position` under `root`
    pub fn proof(&self, root: &str, position: usize) -> Option<MerkleProof> {
        self.by_root.get(root)?.proof(position)
    }

    pub fn len(&self) -> usize {
        self.by_root.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_root.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Amount;

    fn sample_block() -> Block {
        let txns = vec![
            Transaction::coinbase("miner", Amount::from_units(1)),
            Transaction::coinbase("other", Amount::from_units(2)),
            Transaction::coinbase("third", Amount::from_units(3)),
        ];
        Block::new(1, "parent".into(), txns, 0)
    }

    #[test]
    fn test_transaction_index_stamps_block_hash() {
        let block = sample_block();
        let mut index = TransactionIndex::new();
        index.index_block(&block);

        assert_eq!(index.len(), 3);
        for txn in &block.transactions {
            let stored = index.get(&txn.id).unwrap();
            assert_eq!(stored.block_hash, block.hash);
            assert!(stored.verify_id());
        }
        // The block's own copy is untouched
        assert!(block.transactions[0].block_hash.is_empty());
    }

    #[test]
    fn test_merkle_index_register_and_prove() {
        let block = sample_block();
        let mut index = MerkleIndex::new();
        let root = index.register_block(&block);
        assert_eq!(root, block.merkle_root);

        let proof = index.proof(&root, 2).unwrap();
        assert!(proof.verify(&block.transactions[2].id, &root));

        // Registering the same list again is idempotent
        index.register_block(&block);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_empty_block_registers_nothing() {
        let mut index = MerkleIndex::new();
        let root = index.register_block(&Block::genesis());
        assert!(root.is_empty());
        assert!(index.is_empty());
    }
}
