//! Mining engine for the ledger
//!
//! A mining run goes Idle -> Mining -> {Confirmed, Preempted, Stale}. The
//! nonce search runs on the blocking pool and polls its cancellation token
//! on every iteration; confirmation appends the block only if the tip is
//! still the block's parent.

use crate::core::{Amount, Block, ChainError, Transaction, ValidationError};
use crate::crypto::target_prefix;
use crate::storage::{Ledger, MiningTicket};
use log::info;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Mining outcomes other than a confirmed block
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MiningError {
    #[error("Mining interrupted")]
    Interrupted,
    #[error("Mined block at height {height} is stale, the tip is already at {tip_height}")]
    Stale { height: u64, tip_height: u64 },
    #[error("Invalid candidate block: {0}")]
    Invalid(#[from] ValidationError),
    #[error("Transaction {0} is not in the mempool")]
    UnknownTransaction(String),
    #[error("Chain error: {0}")]
    Chain(ChainError),
    #[error("Mining task failed: {0}")]
    Task(String),
}

impl MiningError {
    /// Cancellation is a normal outcome, not a failure
    pub fn is_interruption(&self) -> bool {
        matches!(self, MiningError::Interrupted)
    }
}

impl From<ChainError> for MiningError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::NotTip {
                height, tip_height, ..
            } => MiningError::Stale { height, tip_height },
            ChainError::Invalid(e) => MiningError::Invalid(e),
            ChainError::Cancelled(_) => MiningError::Interrupted,
            other => MiningError::Chain(other),
        }
    }
}

/// Mining statistics
#[derive(Debug, Clone)]
pub struct MiningStats {
    /// Number of hash attempts
    pub hash_attempts: u64,
    /// Time taken in milliseconds
    pub time_ms: u128,
    /// Hash rate (hashes per second)
    pub hash_rate: f64,
}

/// Search nonces from 0 upward until the hash meets the block's difficulty
///
/// Checks `token` before every attempt and returns
/// [`MiningError::Interrupted`] as soon as it is cancelled.
pub fn search(
    mut block: Block,
    token: &CancellationToken,
) -> Result<(Block, MiningStats), MiningError> {
    let start = Instant::now();
    let mut attempts: u64 = 0;

    block.nonce = 0;
    loop {
        if token.is_cancelled() {
            return Err(MiningError::Interrupted);
        }
        block.hash = block.calculate_hash();
        attempts += 1;
        if block.is_valid_pow() {
            break;
        }
        block.nonce = block.nonce.wrapping_add(1);
    }

    let elapsed = start.elapsed().as_millis();
    let hash_rate = if elapsed > 0 {
        (attempts as f64) / (elapsed as f64 / 1000.0)
    } else {
        attempts as f64
    };

    Ok((
        block,
        MiningStats {
            hash_attempts: attempts,
            time_ms: elapsed,
            hash_rate,
        },
    ))
}

/// Miner for creating and confirming new blocks
#[derive(Clone)]
pub struct Miner {
    ledger: Arc<Ledger>,
    /// Identity the coinbase pays
    pub address: String,
}

impl Miner {
    /// Create a new miner
    pub fn new(ledger: Arc<Ledger>, address: &str) -> Self {
        Self {
            ledger,
            address: address.to_string(),
        }
    }

    /// Assemble a candidate block on top of the tip from pooled transactions
    ///
    /// The coinbase pays the summed fees (plus any block reward) to the
    /// miner's address.
    pub async fn create_block(&self, txn_ids: &[String]) -> Result<Block, MiningError> {
        let chain = self.ledger.chain().read().await;
        let mempool = self.ledger.mempool().read().await;

        let tip = chain
            .tip()
            .ok_or(MiningError::Chain(ChainError::MissingGenesis))?;

        let pending = txn_ids
            .iter()
            .map(|id| {
                mempool
                    .get(id)
                    .cloned()
                    .ok_or_else(|| MiningError::UnknownTransaction(id.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let fees: Amount = pending.iter().map(|txn| txn.fee).sum();
        let reward = self.ledger.params().block_reward;
        let coinbase = Transaction::coinbase(&self.address, fees + reward);

        let mut transactions = Vec::with_capacity(pending.len() + 1);
        transactions.push(coinbase);
        transactions.extend(pending);

        Ok(Block::new(
            tip.height + 1,
            tip.hash.clone(),
            transactions,
            self.ledger.params().difficulty,
        ))
    }

    /// Run one mining attempt to completion
    ///
    /// Validates the candidate, searches for a nonce, then commits the block
    /// if the attempt was not cancelled and the tip is still its parent. The
    /// mining slot is released whatever the outcome.
    pub async fn mine(
        &self,
        candidate: Block,
        ticket: MiningTicket,
    ) -> Result<(Block, MiningStats), MiningError> {
        let result = self.run(candidate, &ticket).await;
        self.ledger.finish_mining(ticket.id).await;

        match &result {
            Ok((block, stats)) => info!(
                "Block {} mined at height {} in {}ms ({} attempts, {:.2} H/s)",
                block.hash, block.height, stats.time_ms, stats.hash_attempts, stats.hash_rate
            ),
            Err(MiningError::Interrupted) => {
                info!("Mining attempt {} at height {} interrupted", ticket.id, ticket.height)
            }
            Err(e) => log::warn!("Mining attempt {} failed: {}", ticket.id, e),
        }
        result
    }

    async fn run(
        &self,
        candidate: Block,
        ticket: &MiningTicket,
    ) -> Result<(Block, MiningStats), MiningError> {
        self.ledger.validate_candidate(&candidate).await?;

        info!(
            "Mining block at height {} (target {}...)",
            candidate.height,
            target_prefix(candidate.difficulty)
        );

        let token = ticket.token.clone();
        let (block, stats) = tokio::task::spawn_blocking(move || search(candidate, &token))
            .await
            .map_err(|e| MiningError::Task(e.to_string()))??;

        self.ledger.commit_mined(block.clone(), &ticket.token).await?;
        Ok((block, stats))
    }

    /// Claim the mining slot and spawn an attempt for `candidate`
    ///
    /// Any attempt already running is cancelled first.
    pub async fn start(
        &self,
        candidate: Block,
    ) -> JoinHandle<Result<(Block, MiningStats), MiningError>> {
        let ticket = self.ledger.begin_mining(candidate.height).await;
        let miner = self.clone();
        tokio::spawn(async move { miner.mine(candidate, ticket).await })
    }
}
