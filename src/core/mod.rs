//! Core ledger components
//!
//! This module contains the fundamental building blocks:
//! - Amounts (fixed-point, 8 decimals)
//! - Transactions (UTXO model)
//! - Blocks (proof of work, merkle commitment, wire transfer form)
//! - Chain store (genesis and tip pointers)
//! - Validation rules for transactions, blocks and whole chains

pub mod amount;
pub mod block;
pub mod blockchain;
pub mod transaction;
pub mod validation;

pub use amount::{Amount, AmountError, UNITS_PER_COIN};
pub use block::{Block, BlockError, BlockTransfer, DEFAULT_DIFFICULTY};
pub use blockchain::{ChainError, ChainStats, ChainStore};
pub use transaction::{Transaction, TransactionInput, TransactionOutput, Utxo};
pub use validation::{
    validate_block, validate_candidate, validate_chain, validate_chain_block, validate_genesis,
    validate_transaction, LedgerParams, ValidationError,
};
