//! In-memory ledger storage

pub mod index;
pub mod ledger;
pub mod utxo_set;

pub use index::{MerkleIndex, TransactionIndex};
pub use ledger::{InclusionProof, Ledger, MiningTicket};
pub use utxo_set::UtxoSet;
