//! Blockchain implementation
//!
//! The chain store maps block hash to block and tracks two pointers, the
//! genesis hash and the tip hash. Blocks are only ever appended on top of
//! the current tip; following parent pointers from the tip reaches genesis
//! in exactly `height` steps.

use crate::core::block::Block;
use crate::core::validation::ValidationError;
use std::collections::HashMap;
use thiserror::Error;

/// Blockchain-related errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChainError {
    #[error("Duplicate block: {0}")]
    Duplicate(String),
    #[error("Block {hash} at height {height} does not extend the tip at height {tip_height}")]
    NotTip {
        hash: String,
        height: u64,
        tip_height: u64,
    },
    #[error("Block not found: {0}")]
    UnknownBlock(String),
    #[error("Broken parent link at block {0}")]
    BrokenLink(String),
    #[error("Chain integrity failure at block {hash}: {source}")]
    Integrity {
        hash: String,
        source: ValidationError,
    },
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("Chain has no genesis block")]
    MissingGenesis,
    #[error("Mining attempt for block {0} was cancelled")]
    Cancelled(String),
}

/// Block store with genesis and tip pointers
#[derive(Debug, Clone, Default)]
pub struct ChainStore {
    blocks: HashMap<String, Block>,
    genesis: Option<String>,
    tip: Option<String>,
}

impl ChainStore {
    /// Create an empty store (no genesis yet)
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding only the genesis block
    pub fn with_genesis() -> Self {
        let mut store = Self::new();
        store.ensure_genesis();
        store
    }

    /// Synthesize the genesis block if the store has none
    ///
    /// Returns true when genesis was created by this call.
    pub fn ensure_genesis(&mut self) -> bool {
        if self.genesis.is_some() {
            return false;
        }
        let genesis = Block::genesis();
        let hash = genesis.hash.clone();
        self.blocks.insert(hash.clone(), genesis);
        self.genesis = Some(hash.clone());
        self.tip = Some(hash);
        true
    }

    pub fn get(&self, hash: &str) -> Option<&Block> {
        self.blocks.get(hash)
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn genesis(&self) -> Option<&Block> {
        self.genesis.as_deref().and_then(|hash| self.blocks.get(hash))
    }

    /// Get the latest block
    pub fn tip(&self) -> Option<&Block> {
        self.tip.as_deref().and_then(|hash| self.blocks.get(hash))
    }

    pub fn tip_hash(&self) -> Option<&str> {
        self.tip.as_deref()
    }

    /// Height of the tip (0 for a genesis-only or empty store)
    pub fn height(&self) -> u64 {
        self.tip().map(|block| block.height).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Check that a block is new and sits directly on the current tip
    pub fn check_extends_tip(&self, block: &Block) -> Result<(), ChainError> {
        if self.blocks.contains_key(&block.hash) {
            return Err(ChainError::Duplicate(block.hash.clone()));
        }
        let tip = self.tip().ok_or(ChainError::MissingGenesis)?;
        if block.previous_hash != tip.hash || block.height != tip.height + 1 {
            return Err(ChainError::NotTip {
                hash: block.hash.clone(),
                height: block.height,
                tip_height: tip.height,
            });
        }
        Ok(())
    }

    /// Append a block that extends the current tip and advance the tip
    pub fn append_to_tip(&mut self, block: Block) -> Result<(), ChainError> {
        self.check_extends_tip(&block)?;

        let hash = block.hash.clone();
        self.blocks.insert(hash.clone(), block);
        self.tip = Some(hash);
        Ok(())
    }

    /// Walk parent pointers from the tip down to genesis
    ///
    /// Returns the blocks newest-first. Fails with the hash of the first
    /// block whose parent is missing or whose height does not step down by
    /// exactly one.
    pub fn walk_from_tip(&self) -> Result<Vec<&Block>, ChainError> {
        let mut current = self.tip().ok_or(ChainError::MissingGenesis)?;
        let mut chain = Vec::with_capacity(current.height as usize + 1);

        loop {
            chain.push(current);
            if current.height == 0 {
                break;
            }
            let parent = self
                .blocks
                .get(&current.previous_hash)
                .filter(|parent| parent.height + 1 == current.height)
                .ok_or_else(|| ChainError::BrokenLink(current.hash.clone()))?;
            current = parent;
        }

        if Some(current.hash.as_str()) != self.genesis.as_deref() {
            return Err(ChainError::BrokenLink(current.hash.clone()));
        }
        Ok(chain)
    }

    /// Blocks above `height` on the main chain, newest first
    pub fn blocks_above(&self, height: u64) -> Vec<Block> {
        let mut blocks = Vec::new();
        let mut current = self.tip();
        while let Some(block) = current {
            if block.height <= height {
                break;
            }
            blocks.push(block.clone());
            current = self.blocks.get(&block.previous_hash);
        }
        blocks
    }

    /// The last `count` blocks, tip first
    pub fn recent(&self, count: usize) -> Vec<&Block> {
        let mut blocks = Vec::with_capacity(count);
        let mut current = self.tip();
        while let Some(block) = current {
            if blocks.len() == count {
                break;
            }
            blocks.push(block);
            current = self.blocks.get(&block.previous_hash);
        }
        blocks
    }

    /// Get chain statistics
    pub fn stats(&self) -> ChainStats {
        let total_transactions = self
            .blocks
            .values()
            .map(|block| block.transactions.len() as u64)
            .sum();

        ChainStats {
            height: self.height(),
            total_blocks: self.blocks.len() as u64,
            total_transactions,
            genesis_hash: self.genesis.clone().unwrap_or_default(),
            latest_hash: self.tip.clone().unwrap_or_default(),
        }
    }
}

/// Chain statistics
#[derive(Debug, Clone)]
pub struct ChainStats {
    pub height: u64,
    pub total_blocks: u64,
    pub total_transactions: u64,
    pub genesis_hash: String,
    pub latest_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child_of(parent: &Block) -> Block {
        Block::new(parent.height + 1, parent.hash.clone(), Vec::new(), 0)
    }

    fn chain_of(length: u64) -> ChainStore {
        let mut store = ChainStore::with_genesis();
        for _ in 0..length {
            let next = child_of(store.tip().unwrap());
            store.append_to_tip(next).unwrap();
        }
        store
    }

    #[test]
    fn test_genesis_bootstrap() {
        let mut store = ChainStore::new();
        assert!(store.tip().is_none());
        assert!(store.ensure_genesis());
        assert!(!store.ensure_genesis());

        assert_eq!(store.len(), 1);
        assert_eq!(store.height(), 0);
        assert_eq!(store.tip_hash(), Some(Block::genesis().hash.as_str()));
        assert_eq!(store.genesis().unwrap().hash, Block::genesis().hash);
    }

    #[test]
    fn test_append_advances_tip() {
        let store = chain_of(3);
        assert_eq!(store.height(), 3);
        assert_eq!(store.len(), 4);

        let chain = store.walk_from_tip().unwrap();
        assert_eq!(chain.len(), 4);
        assert!(chain.windows(2).all(|w| w[0].height == w[1].height + 1));
        assert_eq!(chain.last().unwrap().height, 0);
    }

    #[test]
    fn test_append_rejects_duplicate_and_fork() {
        let mut store = chain_of(2);
        let tip = store.tip().unwrap().clone();
        assert!(matches!(
            store.append_to_tip(tip),
            Err(ChainError::Duplicate(_))
        ));

        // A sibling of the tip does not extend it
        let parent = store.get(&store.tip().unwrap().previous_hash).unwrap().clone();
        let mut fork = child_of(&parent);
        fork.nonce = 42;
        fork.hash = fork.calculate_hash();
        assert!(matches!(
            store.append_to_tip(fork),
            Err(ChainError::NotTip { height: 2, tip_height: 2, .. })
        ));
        assert_eq!(store.height(), 2);
    }

    #[test]
    fn test_append_requires_genesis() {
        let mut store = ChainStore::new();
        let block = child_of(&Block::genesis());
        assert_eq!(store.append_to_tip(block), Err(ChainError::MissingGenesis));
    }

    #[test]
    fn test_blocks_above_is_newest_first_and_exclusive() {
        let store = chain_of(7);
        let blocks = store.blocks_above(2);
        let heights: Vec<u64> = blocks.iter().map(|b| b.height).collect();
        assert_eq!(heights, vec![7, 6, 5, 4, 3]);
        assert!(store.blocks_above(7).is_empty());
    }

    #[test]
    fn test_recent_and_stats() {
        let store = chain_of(4);
        let recent = store.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].height, 4);

        let stats = store.stats();
        assert_eq!(stats.height, 4);
        assert_eq!(stats.total_blocks, 5);
        assert_eq!(stats.latest_hash, store.tip().unwrap().hash);
    }
}
