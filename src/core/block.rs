//! Block implementation for the ledger
//!
//! A block carries its header fields inline (height, parent hash, nonce,
//! difficulty, merkle root, timestamp) plus the ordered transaction list,
//! whose first entry is the fee-collecting coinbase.

use crate::core::amount::Amount;
use crate::core::transaction::Transaction;
use crate::crypto::{meets_difficulty, merkle_root, sha256_hex};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default mining difficulty (number of leading zero hex characters)
pub const DEFAULT_DIFFICULTY: u32 = 4;

/// Errors turning a wire block back into a full block
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BlockError {
    #[error("Transaction {0} of the block is not known locally")]
    MissingTransaction(String),
    #[error("Coinbase transaction {0} does not match the block's first ID")]
    CoinbaseMismatch(String),
}

/// A block in the ledger
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Block {
    #[serde(rename = "block_hash")]
    pub hash: String,
    #[serde(rename = "block_height")]
    pub height: u64,
    pub previous_hash: String,
    pub nonce: u64,
    pub difficulty: u32,
    #[serde(rename = "merkle_hash")]
    pub merkle_root: String,
    pub timestamp: DateTime<Utc>,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Create a new block (unmined)
    pub fn new(
        height: u64,
        previous_hash: String,
        transactions: Vec<Transaction>,
        difficulty: u32,
    ) -> Self {
        let merkle_root = Self::calculate_merkle_root(&transactions);
        let mut block = Self {
            hash: String::new(),
            height,
            previous_hash,
            nonce: 0,
            difficulty,
            merkle_root,
            timestamp: Utc::now(),
            transactions,
        };
        block.hash = block.calculate_hash();
        block
    }

    /// Create the genesis block
    ///
    /// Genesis is fixed (epoch timestamp, no transactions, no proof of
    /// work), so every node derives the same hash without coordination.
    pub fn genesis() -> Self {
        let mut block = Self {
            hash: String::new(),
            height: 0,
            previous_hash: String::new(),
            nonce: 0,
            difficulty: 0,
            merkle_root: String::new(),
            timestamp: Utc.timestamp_opt(0, 0).single().unwrap_or_default(),
            transactions: Vec::new(),
        };
        block.hash = block.calculate_hash();
        block
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0 && self.previous_hash.is_empty()
    }

    /// Calculate the block hash from the header fields
    pub fn calculate_hash(&self) -> String {
        let data = format!(
            "{}{}{}{}{}{}",
            self.height,
            self.previous_hash,
            self.nonce,
            self.difficulty,
            self.merkle_root,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
        );
        sha256_hex(data.as_bytes())
    }

    /// Calculate the merkle root from transactions
    pub fn calculate_merkle_root(transactions: &[Transaction]) -> String {
        let ids: Vec<&str> = transactions.iter().map(|txn| txn.id.as_str()).collect();
        merkle_root(&ids)
    }

    /// Check if the proof of work is valid
    pub fn is_valid_pow(&self) -> bool {
        meets_difficulty(&self.hash, self.difficulty)
    }

    /// Verify the block's merkle root
    pub fn verify_merkle_root(&self) -> bool {
        Self::calculate_merkle_root(&self.transactions) == self.merkle_root
    }

    /// Verify the block hash
    pub fn verify_hash(&self) -> bool {
        self.hash == self.calculate_hash()
    }

    /// Get the coinbase transaction (first transaction)
    pub fn coinbase_tx(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|txn| txn.is_coinbase())
    }

    /// Transactions other than the coinbase
    pub fn regular_transactions(&self) -> &[Transaction] {
        match self.coinbase_tx() {
            Some(_) => &self.transactions[1..],
            None => &self.transactions,
        }
    }

    /// Sum of the fees the block's regular transactions pay
    pub fn total_fees(&self) -> Amount {
        self.regular_transactions().iter().map(|txn| txn.fee).sum()
    }

    /// Get number of transactions in this block
    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }

    /// Wire form used for block propagation
    pub fn to_transfer(&self) -> BlockTransfer {
        BlockTransfer {
            hash: self.hash.clone(),
            height: self.height,
            previous_hash: self.previous_hash.clone(),
            nonce: self.nonce,
            difficulty: self.difficulty,
            merkle_root: self.merkle_root.clone(),
            timestamp: self.timestamp,
            coinbase: self.coinbase_tx().cloned(),
            transactions: self.transactions.iter().map(|txn| txn.id.clone()).collect(),
        }
    }
}

/// Block as propagated between peers: header fields plus transaction IDs
///
/// Receivers resolve the IDs against their own mempool and transaction
/// index. The coinbase is created by the miner and exists nowhere else, so
/// it travels in full.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockTransfer {
    #[serde(rename = "block_hash")]
    pub hash: String,
    #[serde(rename = "block_height")]
    pub height: u64,
    pub previous_hash: String,
    pub nonce: u64,
    pub difficulty: u32,
    #[serde(rename = "merkle_hash")]
    pub merkle_root: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coinbase: Option<Transaction>,
    pub transactions: Vec<String>,
}

impl BlockTransfer {
    /// Rebuild the full block, looking up every non-coinbase ID
    pub fn into_block<F>(self, mut resolve: F) -> Result<Block, BlockError>
    where
        F: FnMut(&str) -> Option<Transaction>,
    {
        let mut transactions = Vec::with_capacity(self.transactions.len());
        let mut coinbase = self.coinbase;

        for (position, id) in self.transactions.iter().enumerate() {
            if position == 0 {
                if let Some(cb) = coinbase.take() {
                    if &cb.id != id {
                        return Err(BlockError::CoinbaseMismatch(cb.id));
                    }
                    transactions.push(cb);
                    continue;
                }
            }
            let txn = resolve(id).ok_or_else(|| BlockError::MissingTransaction(id.clone()))?;
            transactions.push(txn);
        }

        Ok(Block {
            hash: self.hash,
            height: self.height,
            previous_hash: self.previous_hash,
            nonce: self.nonce,
            difficulty: self.difficulty,
            merkle_root: self.merkle_root,
            timestamp: self.timestamp,
            transactions,
        })
    }
}
