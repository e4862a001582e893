//! Shared ledger state
//!
//! One object owns every ledger table, each behind its own
//! `tokio::sync::RwLock`, plus the single active-mining-attempt slot. It is
//! shared as `Arc<Ledger>` between local actions and inbound stream tasks.
//!
//! When more than one table is locked at a time the order is always
//! chain, mempool, utxos, transactions, merkle roots.

use crate::core::{
    validate_block, validate_candidate, validate_chain, validate_chain_block, validate_transaction,
    Amount, Block, BlockError, BlockTransfer, ChainError, ChainStats, ChainStore, LedgerParams,
    Transaction, Utxo, ValidationError,
};
use crate::crypto::MerkleProof;
use crate::mining::Mempool;
use crate::storage::index::{MerkleIndex, TransactionIndex};
use crate::storage::utxo_set::UtxoSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// The mining attempt currently holding the slot
#[derive(Debug)]
struct MiningAttempt {
    id: u64,
    height: u64,
    token: CancellationToken,
}

/// Claim on the mining slot handed to a mining task
#[derive(Debug, Clone)]
pub struct MiningTicket {
    pub id: u64,
    pub height: u64,
    pub token: CancellationToken,
}

/// A confirmed transaction's path to its block's Merkle root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InclusionProof {
    pub txn_id: String,
    pub block_hash: String,
    pub merkle_root: String,
    pub proof: MerkleProof,
}

impl InclusionProof {
    pub fn verify(&self) -> bool {
        self.proof.verify(&self.txn_id, &self.merkle_root)
    }
}

/// In-memory ledger: chain, mempool, UTXO set and indexes
#[derive(Debug)]
pub struct Ledger {
    params: LedgerParams,
    chain: RwLock<ChainStore>,
    mempool: RwLock<Mempool>,
    utxos: RwLock<UtxoSet>,
    transactions: RwLock<TransactionIndex>,
    merkle_roots: RwLock<MerkleIndex>,
    mining: Mutex<Option<MiningAttempt>>,
    next_attempt: AtomicU64,
}

impl Ledger {
    /// Create a ledger holding only the genesis block
    pub fn new(params: LedgerParams) -> Self {
        Self {
            params,
            chain: RwLock::new(ChainStore::with_genesis()),
            mempool: RwLock::new(Mempool::new()),
            utxos: RwLock::new(UtxoSet::new()),
            transactions: RwLock::new(TransactionIndex::new()),
            merkle_roots: RwLock::new(MerkleIndex::new()),
            mining: Mutex::new(None),
            next_attempt: AtomicU64::new(1),
        }
    }

    pub fn params(&self) -> &LedgerParams {
        &self.params
    }

    pub fn chain(&self) -> &RwLock<ChainStore> {
        &self.chain
    }

    pub fn mempool(&self) -> &RwLock<Mempool> {
        &self.mempool
    }

    pub fn utxos(&self) -> &RwLock<UtxoSet> {
        &self.utxos
    }

    pub fn transactions(&self) -> &RwLock<TransactionIndex> {
        &self.transactions
    }

    pub fn merkle_roots(&self) -> &RwLock<MerkleIndex> {
        &self.merkle_roots
    }

    /// Synthesize genesis if the chain has none; returns true if created
    pub async fn ensure_genesis(&self) -> bool {
        self.chain.write().await.ensure_genesis()
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Check a transaction against the current UTXO set
    pub async fn validate_transaction(&self, txn: &Transaction) -> Result<Amount, ValidationError> {
        let utxos = self.utxos.read().await;
        validate_transaction(txn, &utxos)
    }

    /// Check a block against the chain and the current UTXO set
    pub async fn validate_block(&self, block: &Block) -> Result<(), ValidationError> {
        let chain = self.chain.read().await;
        let utxos = self.utxos.read().await;
        validate_block(block, &chain, &utxos, &self.params)
    }

    /// Check an unmined candidate block (all rules but proof of work)
    pub async fn validate_candidate(&self, block: &Block) -> Result<(), ValidationError> {
        let chain = self.chain.read().await;
        let utxos = self.utxos.read().await;
        validate_candidate(block, &chain, &utxos, &self.params)
    }

    /// Validate the whole chain under one chain read lock
    pub async fn validate_chain(&self) -> Result<(), ChainError> {
        let chain = self.chain.read().await;
        validate_chain(&chain, &self.params)
    }

    /// Validate one stored block against the chain as of its own height
    pub async fn validate_stored_block(&self, hash: &str) -> Result<(), ChainError> {
        let chain = self.chain.read().await;
        validate_chain_block(&chain, hash, &self.params)
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Validate a transaction and admit it to the mempool
    ///
    /// Already pooled or already confirmed IDs are accepted as a no-op and
    /// return `Ok(false)`.
    pub async fn admit_transaction(&self, txn: Transaction) -> Result<bool, ValidationError> {
        if self.mempool.read().await.contains(&txn.id)
            || self.transactions.read().await.contains(&txn.id)
        {
            return Ok(false);
        }

        let mut mempool = self.mempool.write().await;
        {
            let utxos = self.utxos.read().await;
            validate_transaction(&txn, &utxos)?;
        }
        Ok(mempool.admit(txn))
    }

    /// Apply the UTXO effects of a confirmed transaction
    pub async fn apply_transaction(&self, txn: &Transaction) {
        self.utxos.write().await.apply_transaction(txn);
    }

    /// Look a transaction up in the mempool, then among confirmed ones
    pub async fn find_transaction(&self, id: &str) -> Option<Transaction> {
        if let Some(txn) = self.mempool.read().await.get(id) {
            return Some(txn.clone());
        }
        self.transactions.read().await.get(id).cloned()
    }

    /// Merkle inclusion proof for a confirmed transaction
    pub async fn inclusion_proof(&self, txn_id: &str) -> Option<InclusionProof> {
        let chain = self.chain.read().await;
        let transactions = self.transactions.read().await;
        let merkle_roots = self.merkle_roots.read().await;

        let block_hash = transactions.get(txn_id)?.block_hash.clone();
        let block = chain.get(&block_hash)?;
        let position = block.transactions.iter().position(|txn| txn.id == txn_id)?;
        let proof = merkle_roots.proof(&block.merkle_root, position)?;
        Some(InclusionProof {
            txn_id: txn_id.to_string(),
            block_hash,
            merkle_root: block.merkle_root.clone(),
            proof,
        })
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    /// Rebuild a propagated block from locally known transactions
    pub async fn materialize(&self, transfer: BlockTransfer) -> Result<Block, BlockError> {
        let mempool = self.mempool.read().await;
        let index = self.transactions.read().await;
        transfer.into_block(|id| mempool.get(id).or_else(|| index.get(id)).cloned())
    }

    /// Validate a block and append it on top of the tip
    ///
    /// Tip extension, validation and the UTXO delta all happen under the
    /// same write locks, so a competing block cannot slip in between.
    pub async fn commit_block(&self, block: Block) -> Result<(), ChainError> {
        self.commit(block, None).await
    }

    /// Commit a locally mined block unless its attempt was cancelled
    ///
    /// The token is checked again once the chain write lock is held, so an
    /// attempt cancelled while waiting for the lock never lands.
    pub async fn commit_mined(
        &self,
        block: Block,
        token: &CancellationToken,
    ) -> Result<(), ChainError> {
        self.commit(block, Some(token)).await
    }

    async fn commit(
        &self,
        block: Block,
        token: Option<&CancellationToken>,
    ) -> Result<(), ChainError> {
        {
            let mut chain = self.chain.write().await;
            if token.map_or(false, |t| t.is_cancelled()) {
                return Err(ChainError::Cancelled(block.hash.clone()));
            }
            let mut mempool = self.mempool.write().await;
            let mut utxos = self.utxos.write().await;

            chain.check_extends_tip(&block)?;
            validate_block(&block, &chain, &utxos, &self.params)?;

            mempool.evict_block(&block);
            utxos.apply_block(&block);
            let dropped = mempool.remove_conflicting(&utxos);
            if !dropped.is_empty() {
                log::debug!(
                    "Dropped {} pending transactions spending outputs of block {}",
                    dropped.len(),
                    block.hash
                );
            }
            chain.append_to_tip(block.clone())?;
        }

        self.transactions.write().await.index_block(&block);
        self.merkle_roots.write().await.register_block(&block);
        log::info!("Block {} accepted at height {}", block.hash, block.height);
        Ok(())
    }

    /// Merge blocks received oldest-first
    ///
    /// Stops at the first block that fails validation; blocks merged before
    /// it stay on the chain. Blocks already present are skipped. Returns the
    /// number of blocks appended.
    pub async fn merge_blocks(&self, blocks: Vec<Block>) -> Result<usize, ChainError> {
        let mut merged = 0;
        for block in blocks {
            if self.chain.read().await.contains(&block.hash) {
                continue;
            }
            let hash = block.hash.clone();
            match self.commit_block(block).await {
                Ok(()) => merged += 1,
                Err(ChainError::Invalid(source)) => {
                    return Err(ChainError::Integrity { hash, source })
                }
                Err(e) => return Err(e),
            }
        }
        Ok(merged)
    }

    // =========================================================================
    // Mining slot
    // =========================================================================

    /// Claim the mining slot for a new attempt, cancelling the previous one
    pub async fn begin_mining(&self, height: u64) -> MiningTicket {
        let mut slot = self.mining.lock().await;
        if let Some(previous) = slot.take() {
            log::info!("Cancelling mining attempt {} at height {}", previous.id, previous.height);
            previous.token.cancel();
        }

        let id = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        *slot = Some(MiningAttempt {
            id,
            height,
            token: token.clone(),
        });
        MiningTicket { id, height, token }
    }

    /// Cancel the active attempt if it mines at or below `height`
    pub async fn cancel_mining_at(&self, height: u64) -> bool {
        let mut slot = self.mining.lock().await;
        match slot.as_ref() {
            Some(attempt) if attempt.height <= height => {
                attempt.token.cancel();
                log::info!(
                    "Mining attempt {} preempted by a block at height {}",
                    attempt.id,
                    height
                );
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Release the slot if it is still held by attempt `id`
    pub async fn finish_mining(&self, id: u64) {
        let mut slot = self.mining.lock().await;
        if slot.as_ref().map(|attempt| attempt.id) == Some(id) {
            *slot = None;
        }
    }

    /// Height of the attempt currently holding the slot
    pub async fn mining_height(&self) -> Option<u64> {
        self.mining.lock().await.as_ref().map(|attempt| attempt.height)
    }

    // =========================================================================
    // Views
    // =========================================================================

    pub async fn tip(&self) -> Option<Block> {
        self.chain.read().await.tip().cloned()
    }

    pub async fn height(&self) -> u64 {
        self.chain.read().await.height()
    }

    pub async fn get_block(&self, hash: &str) -> Option<Block> {
        self.chain.read().await.get(hash).cloned()
    }

    pub async fn contains_block(&self, hash: &str) -> bool {
        self.chain.read().await.contains(hash)
    }

    /// Blocks above `height`, newest first
    pub async fn blocks_above(&self, height: u64) -> Vec<Block> {
        self.chain.read().await.blocks_above(height)
    }

    /// The last `count` blocks, tip first
    pub async fn recent_blocks(&self, count: usize) -> Vec<Block> {
        self.chain
            .read()
            .await
            .recent(count)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn chain_stats(&self) -> ChainStats {
        self.chain.read().await.stats()
    }

    pub async fn mempool_snapshot(&self) -> Vec<Transaction> {
        self.mempool.read().await.transactions()
    }

    pub async fn utxo(&self, key: &str) -> Option<Utxo> {
        self.utxos.read().await.get(key).cloned()
    }

    pub async fn utxos_of(&self, recipient: &str) -> Vec<Utxo> {
        self.utxos.read().await.utxos_of(recipient)
    }

    pub async fn balance(&self, recipient: &str) -> Amount {
        self.utxos.read().await.balance(recipient)
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(LedgerParams::default())
    }
}
