//! Unspent transaction output set
//!
//! Keyed by `sha256("{txn_id}:{index}")`. The set always equals the outputs
//! of confirmed transactions not yet referenced by a confirmed input.

use crate::core::{Amount, Block, Transaction, Utxo};
use std::collections::HashMap;

/// In-memory UTXO table
#[derive(Debug, Clone, Default)]
pub struct UtxoSet {
    utxos: HashMap<String, Utxo>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Utxo> {
        self.utxos.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.utxos.contains_key(key)
    }

    pub fn insert(&mut self, utxo: Utxo) {
        self.utxos.insert(utxo.key(), utxo);
    }

    pub fn remove(&mut self, key: &str) -> Option<Utxo> {
        self.utxos.remove(key)
    }

    /// Spend the inputs and create the outputs of a confirmed transaction
    pub fn apply_transaction(&mut self, txn: &Transaction) {
        for key in txn.spent_keys() {
            self.utxos.remove(&key);
        }
        for (key, utxo) in txn.created_utxos() {
            self.utxos.insert(key, utxo);
        }
    }

    /// Apply the UTXO delta of every transaction in a block
    pub fn apply_block(&mut self, block: &Block) {
        for txn in &block.transactions {
            self.apply_transaction(txn);
        }
    }

    /// Get UTXOs for a specific recipient
    pub fn utxos_of(&self, recipient: &str) -> Vec<Utxo> {
        let mut owned: Vec<Utxo> = self
            .utxos
            .values()
            .filter(|utxo| utxo.recipient == recipient)
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.txn_id.cmp(&b.txn_id).then(a.index.cmp(&b.index)));
        owned
    }

    /// Get balance for a recipient
    pub fn balance(&self, recipient: &str) -> Amount {
        self.utxos
            .values()
            .filter(|utxo| utxo.recipient == recipient)
            .map(|utxo| utxo.value)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Utxo)> {
        self.utxos.iter()
    }
}
