//! Mining module for block creation and transaction pooling

pub mod mempool;
pub mod miner;

pub use mempool::{Mempool, MempoolStats};
pub use miner::{search, Miner, MiningError, MiningStats};
