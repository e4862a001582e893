//! Heat Ledger: a peer-to-peer UTXO ledger node
//!
//! This crate provides:
//! - UTXO transactions with fixed-point amounts and content-hash IDs
//! - Merkle commitments with duplicate-last-leaf padding
//! - Proof of Work mining that a competing block can preempt
//! - Block and transaction validation, including a full chain replay
//! - Chat gossip, transaction and block flooding, chain and mempool sync
//!
//! # Example
//!
//! ```no_run
//! use heat_ledger::network::{Node, NodeConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let node = Node::new(NodeConfig::default()).await?;
//! node.start().await?;
//!
//! // Mine an empty block on top of genesis
//! let block = node.mine(&[]).await?;
//! println!("Mined block {} at height {}", block.hash, block.height);
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod core;
pub mod crypto;
pub mod mining;
pub mod network;
pub mod storage;

// Re-export commonly used types
pub use core::{
    Amount, Block, BlockTransfer, ChainStore, LedgerParams, Transaction, DEFAULT_DIFFICULTY,
};
pub use crypto::KeyPair;
pub use mining::{Mempool, Miner};
pub use network::{Node, NodeConfig};
pub use storage::{Ledger, UtxoSet};
