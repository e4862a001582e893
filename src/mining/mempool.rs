//! Transaction pool (mempool) for pending transactions
//!
//! Holds transactions that passed validation against the UTXO set at
//! admission time and are waiting to be included in a block. Admission is
//! idempotent: offering an ID that is already pooled is a no-op.

use crate::core::{Amount, Block, Transaction};
use crate::storage::UtxoSet;
use std::collections::HashMap;

/// Memory pool for pending transactions
#[derive(Debug, Default)]
pub struct Mempool {
    /// Transactions indexed by ID
    entries: HashMap<String, Transaction>,
    /// Transaction IDs ordered by fee (highest first for mining)
    by_fee: Vec<String>,
}

impl Mempool {
    /// Create a new mempool
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a transaction to the pool
    ///
    /// Returns false when the ID was already present. Equal fees keep
    /// arrival order.
    pub fn admit(&mut self, txn: Transaction) -> bool {
        if self.entries.contains_key(&txn.id) {
            return false;
        }

        let fee = txn.fee;
        let pos = self
            .by_fee
            .iter()
            .position(|id| self.entries.get(id).map(|t| t.fee < fee).unwrap_or(true))
            .unwrap_or(self.by_fee.len());
        self.by_fee.insert(pos, txn.id.clone());
        self.entries.insert(txn.id.clone(), txn);
        true
    }

    /// Remove a transaction from the pool
    pub fn remove(&mut self, id: &str) -> Option<Transaction> {
        let txn = self.entries.remove(id)?;
        self.by_fee.retain(|pooled| pooled != id);
        Some(txn)
    }

    /// Remove every transaction a block confirms
    ///
    /// Returns how many were pooled.
    pub fn evict_block(&mut self, block: &Block) -> usize {
        block
            .transactions
            .iter()
            .filter(|txn| self.remove(&txn.id).is_some())
            .count()
    }

    /// Remove transactions with inputs that are no longer unspent
    pub fn remove_conflicting(&mut self, utxos: &UtxoSet) -> Vec<String> {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, txn)| txn.spent_keys().any(|key| !utxos.contains(&key)))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.remove(id);
        }
        stale
    }

    /// Get a transaction by ID
    pub fn get(&self, id: &str) -> Option<&Transaction> {
        self.entries.get(id)
    }

    /// Check if a transaction is in the pool
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// All pooled transactions, highest fee first
    pub fn transactions(&self) -> Vec<Transaction> {
        self.by_fee
            .iter()
            .filter_map(|id| self.entries.get(id).cloned())
            .collect()
    }

    /// Get all transaction IDs (by fee order)
    pub fn transaction_ids(&self) -> Vec<String> {
        self.by_fee.clone()
    }

    /// Get the number of pending transactions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the pool is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get total fees of all transactions
    pub fn total_fees(&self) -> Amount {
        self.entries.values().map(|txn| txn.fee).sum()
    }

    /// Get mempool statistics
    pub fn stats(&self) -> MempoolStats {
        let fee_of = |id: Option<&String>| {
            id.and_then(|id| self.entries.get(id))
                .map(|txn| txn.fee)
                .unwrap_or_default()
        };

        MempoolStats {
            tx_count: self.entries.len(),
            total_fees: self.total_fees(),
            max_fee: fee_of(self.by_fee.first()),
            min_fee: fee_of(self.by_fee.last()),
        }
    }
}

/// Mempool statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MempoolStats {
    pub tx_count: usize,
    pub total_fees: Amount,
    pub max_fee: Amount,
    pub min_fee: Amount,
}

// =============================================================================
// Tests
// =============================================================================
