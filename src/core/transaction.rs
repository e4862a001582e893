//! Transaction handling for the ledger
//!
//! Implements a UTXO-based transaction model. A transaction spends
//! previously confirmed outputs (inputs), creates new outputs, and leaves
//! the difference as a fee for the miner that confirms it.
//!
//! The transaction ID is the content hash of the inputs, outputs, fee and
//! timestamp. It is computed once at creation and never recomputed in
//! place; [`Transaction::verify_id`] checks a received transaction against
//! its claimed ID.

use crate::core::amount::Amount;
use crate::crypto::{sha256_hex, utxo_key};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Transaction Input
// =============================================================================

/// Transaction input (reference to a previous output)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionInput {
    /// Transaction ID of the previous transaction
    pub txn_id: String,
    /// Index of the output in the previous transaction
    pub index: u32,
    /// Authorization placeholder, carried but never verified
    #[serde(rename = "sign", default)]
    pub signature: String,
}

impl TransactionInput {
    pub fn new(txn_id: impl Into<String>, index: u32) -> Self {
        Self {
            txn_id: txn_id.into(),
            index,
            signature: String::new(),
        }
    }

    /// Key of the UTXO this input spends
    pub fn utxo_key(&self) -> String {
        utxo_key(&self.txn_id, self.index)
    }
}

// =============================================================================
// Transaction Output
// =============================================================================

/// Transaction output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionOutput {
    /// Recipient's public identifier
    #[serde(rename = "pub_key")]
    pub recipient: String,
    /// Amount of coins
    #[serde(rename = "amount")]
    pub value: Amount,
}

impl TransactionOutput {
    pub fn new(recipient: impl Into<String>, value: Amount) -> Self {
        Self {
            recipient: recipient.into(),
            value,
        }
    }

    /// Check if this output belongs to the given identifier
    pub fn is_owned_by(&self, recipient: &str) -> bool {
        self.recipient == recipient
    }
}

// =============================================================================
// UTXO
// =============================================================================

/// Unspent Transaction Output, keyed by [`utxo_key`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Utxo {
    pub txn_id: String,
    pub index: u32,
    pub value: Amount,
    #[serde(rename = "pub_key")]
    pub recipient: String,
}

impl Utxo {
    pub fn key(&self) -> String {
        utxo_key(&self.txn_id, self.index)
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// A ledger transaction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    /// Content hash of inputs, outputs, fee and timestamp
    #[serde(rename = "txn_id")]
    pub id: String,
    /// Hash of the confirming block, empty while pending
    #[serde(default)]
    pub block_hash: String,
    pub in_sz: u32,
    pub out_sz: u32,
    pub fee: Amount,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub timestamp: DateTime<Utc>,
}

impl Transaction {
    /// Create a new transaction stamped with the current time
    pub fn new(inputs: Vec<TransactionInput>, outputs: Vec<TransactionOutput>, fee: Amount) -> Self {
        Self::with_timestamp(inputs, outputs, fee, Utc::now())
    }

    /// Create a new transaction with an explicit timestamp
    pub fn with_timestamp(
        inputs: Vec<TransactionInput>,
        outputs: Vec<TransactionOutput>,
        fee: Amount,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut txn = Self {
            id: String::new(),
            block_hash: String::new(),
            in_sz: inputs.len() as u32,
            out_sz: outputs.len() as u32,
            fee,
            inputs,
            outputs,
            timestamp,
        };
        txn.id = txn.calculate_hash();
        txn
    }

    /// Create the fee-collecting coinbase entry of a block
    pub fn coinbase(recipient: &str, value: Amount) -> Self {
        Self::new(
            Vec::new(),
            vec![TransactionOutput::new(recipient, value)],
            Amount::ZERO,
        )
    }

    /// Calculate the transaction hash
    pub fn calculate_hash(&self) -> String {
        let mut data = String::new();
        for input in &self.inputs {
            data.push_str(&input.txn_id);
            data.push_str(&input.index.to_string());
        }
        for output in &self.outputs {
            data.push_str(&output.value.to_string());
            data.push_str(&output.recipient);
        }
        data.push_str(&self.fee.to_string());
        data.push_str(
            &self
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Nanos, true),
        );
        sha256_hex(data.as_bytes())
    }

    /// Check the claimed ID and size fields against the content
    pub fn verify_id(&self) -> bool {
        self.id == self.calculate_hash()
    }

    /// Check that `in_sz` / `out_sz` agree with the lists
    pub fn sizes_match(&self) -> bool {
        self.in_sz as usize == self.inputs.len() && self.out_sz as usize == self.outputs.len()
    }

    /// Zero-input transactions are coinbase entries
    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn is_confirmed(&self) -> bool {
        !self.block_hash.is_empty()
    }

    /// Get total output amount
    pub fn total_output(&self) -> Amount {
        self.outputs.iter().map(|output| output.value).sum()
    }

    /// UTXOs this transaction creates once confirmed, with their keys
    pub fn created_utxos(&self) -> impl Iterator<Item = (String, Utxo)> + '_ {
        self.outputs.iter().enumerate().map(move |(index, output)| {
            let utxo = Utxo {
                txn_id: self.id.clone(),
                index: index as u32,
                value: output.value,
                recipient: output.recipient.clone(),
            };
            (utxo.key(), utxo)
        })
    }

    /// Keys of the UTXOs this transaction spends
    pub fn spent_keys(&self) -> impl Iterator<Item = String> + '_ {
        self.inputs.iter().map(TransactionInput::utxo_key)
    }
}
