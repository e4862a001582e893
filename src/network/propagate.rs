//! Transaction and block propagation
//!
//! Both flood to every peer except the one a unit arrived from. Units are
//! validated before admission; an invalid unit stops at the first node that
//! notices.

use crate::core::{BlockTransfer, ChainError, Transaction};
use crate::network::node::NodeContext;
use crate::network::peer::NetworkError;
use crate::network::protocol::{read_loop, LineStream, Protocol};
use tokio::io::{AsyncRead, AsyncWrite};

/// What happened to an inbound unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// New and valid: admitted and forwarded to this many peers
    Accepted(usize),
    /// Already known; nothing forwarded
    Duplicate,
}

/// Validate and pool a transaction, then forward it
pub async fn accept_transaction(
    ctx: &NodeContext,
    remote: &str,
    txn: Transaction,
) -> Result<Propagation, NetworkError> {
    let line = serde_json::to_string(&txn)?;
    let id = txn.id.clone();

    if !ctx.ledger.admit_transaction(txn).await? {
        return Ok(Propagation::Duplicate);
    }
    log::info!("Transaction {} admitted from {}", id, remote);

    let reached = ctx
        .peers
        .broadcast(Protocol::BroadcastTransaction, &line, &[remote])
        .await;
    Ok(Propagation::Accepted(reached))
}

/// Rebuild, validate and append a propagated block, then forward it
///
/// A block accepted here preempts any local mining attempt at or below its
/// height. A block that fails to commit preempts nothing.
pub async fn accept_block(
    ctx: &NodeContext,
    remote: &str,
    transfer: BlockTransfer,
) -> Result<Propagation, NetworkError> {
    if ctx.ledger.contains_block(&transfer.hash).await {
        return Ok(Propagation::Duplicate);
    }
    let line = serde_json::to_string(&transfer)?;

    let block = ctx.ledger.materialize(transfer).await?;
    ctx.ledger.validate_block(&block).await?;

    let (hash, height) = (block.hash.clone(), block.height);
    match ctx.ledger.commit_block(block).await {
        Ok(()) => {}
        // Lost a race with another delivery of the same block
        Err(ChainError::Duplicate(_)) => return Ok(Propagation::Duplicate),
        Err(e) => return Err(e.into()),
    }
    ctx.ledger.cancel_mining_at(height).await;
    log::info!("Block {} at height {} received from {}", hash, height, remote);

    let reached = ctx
        .peers
        .broadcast(Protocol::BroadcastBlock, &line, &[remote])
        .await;
    Ok(Propagation::Accepted(reached))
}

/// Serve a `/broadcast/transaction` stream until it closes
pub async fn handle_transactions<S>(ctx: NodeContext, stream: LineStream<S>, remote: String)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    read_loop(stream, "transaction", &remote, |line| {
        let ctx = ctx.clone();
        let remote = remote.clone();
        async move {
            let txn: Transaction = serde_json::from_str(&line)?;
            accept_transaction(&ctx, &remote, txn).await?;
            Ok(())
        }
    })
    .await;
}

/// Serve a `/broadcast/block` stream until it closes
pub async fn handle_blocks<S>(ctx: NodeContext, stream: LineStream<S>, remote: String)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    read_loop(stream, "block", &remote, |line| {
        let ctx = ctx.clone();
        let remote = remote.clone();
        async move {
            let transfer: BlockTransfer = serde_json::from_str(&line)?;
            accept_block(&ctx, &remote, transfer).await?;
            Ok(())
        }
    })
    .await;
}
