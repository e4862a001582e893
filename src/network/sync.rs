//! Chain and mempool synchronization with peers
//!
//! The requester sends its tip; a longer responder answers with a block
//! count and then that many blocks, newest first, down to but excluding the
//! requester's height. A responder that is not longer answers with the
//! [`SHORTER_CHAIN`] sentinel instead.

use crate::core::{Block, Transaction};
use crate::network::node::NodeContext;
use crate::network::peer::{NetworkError, PeerInfo, PeerManager};
use crate::network::protocol::{
    read_json, read_line, write_json, write_line, LineStream, Protocol, SyncRequest,
    SHORTER_CHAIN,
};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

async fn read_count<S>(
    stream: &mut LineStream<S>,
    timeout: Option<Duration>,
    peer: &str,
) -> Result<usize, NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = read_line(stream, timeout)
        .await?
        .ok_or(NetworkError::Disconnected)?;
    let line = line.trim();
    if line == SHORTER_CHAIN {
        return Err(NetworkError::PeerShorter(peer.to_string()));
    }
    line.parse()
        .map_err(|_| NetworkError::Protocol(format!("expected a count, got {:?}", line)))
}

async fn read_items<S, T>(
    stream: &mut LineStream<S>,
    count: usize,
    timeout: Option<Duration>,
) -> Result<Vec<T>, NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(read_json(stream, timeout).await?);
    }
    Ok(items)
}

// =============================================================================
// Blockchain
// =============================================================================

/// Send a sync request over an open stream and read the reply
///
/// Blocks come back newest first.
pub async fn request_blocks<S>(
    stream: &mut LineStream<S>,
    request: &SyncRequest,
    timeout: Option<Duration>,
    peer: &str,
) -> Result<Vec<Block>, NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_json(stream, request).await?;
    let count = read_count(stream, timeout, peer).await?;
    read_items(stream, count, timeout).await
}

/// Download the blocks `peer` has above `request.block_height`
pub async fn download_blockchain(
    peers: &PeerManager,
    peer: &PeerInfo,
    request: &SyncRequest,
    timeout: Option<Duration>,
) -> Result<Vec<Block>, NetworkError> {
    let mut stream = peers.open_stream(peer, Protocol::DownloadBlockchain).await?;
    request_blocks(&mut stream, request, timeout, &peer.id).await
}

/// Catch up with `peer`; returns the number of blocks merged
pub async fn sync_blockchain(ctx: &NodeContext, peer: &PeerInfo) -> Result<usize, NetworkError> {
    let request = {
        let chain = ctx.ledger.chain().read().await;
        SyncRequest {
            block_height: chain.height(),
            block_hash: chain.tip_hash().unwrap_or_default().to_string(),
        }
    };
    log::info!(
        "Syncing blockchain from {} (local height {})",
        peer,
        request.block_height
    );

    let mut blocks = download_blockchain(&ctx.peers, peer, &request, ctx.read_timeout).await?;
    blocks.reverse();
    let merged = ctx.ledger.merge_blocks(blocks).await?;

    log::info!(
        "Synced {} blocks from {}, height now {}",
        merged,
        peer.id,
        ctx.ledger.height().await
    );
    Ok(merged)
}

/// Answer one `/download/blockchain` request
pub async fn serve_blockchain<S>(
    ctx: &NodeContext,
    stream: &mut LineStream<S>,
    remote: &str,
) -> Result<usize, NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request: SyncRequest = read_json(stream, ctx.read_timeout).await?;

    let blocks = {
        let chain = ctx.ledger.chain().read().await;
        if chain.height() <= request.block_height {
            None
        } else {
            Some(chain.blocks_above(request.block_height))
        }
    };

    let Some(blocks) = blocks else {
        log::debug!(
            "{} asked for blocks above {}, we are not longer",
            remote,
            request.block_height
        );
        write_line(stream, SHORTER_CHAIN).await?;
        return Ok(0);
    };

    write_line(stream, &blocks.len().to_string()).await?;
    for block in &blocks {
        write_json(stream, block).await?;
    }
    log::info!(
        "Sent {} blocks above height {} to {}",
        blocks.len(),
        request.block_height,
        remote
    );
    Ok(blocks.len())
}

// =============================================================================
// Mempool
// =============================================================================

/// Read a mempool snapshot from an open stream
pub async fn request_mempool<S>(
    stream: &mut LineStream<S>,
    timeout: Option<Duration>,
    peer: &str,
) -> Result<Vec<Transaction>, NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let count = read_count(stream, timeout, peer).await?;
    read_items(stream, count, timeout).await
}

/// Download the pending transactions of `peer`
pub async fn download_mempool(
    peers: &PeerManager,
    peer: &PeerInfo,
    timeout: Option<Duration>,
) -> Result<Vec<Transaction>, NetworkError> {
    let mut stream = peers.open_stream(peer, Protocol::DownloadMempool).await?;
    request_mempool(&mut stream, timeout, &peer.id).await
}

/// Admit every valid transaction from `peer`'s mempool; returns how many
/// were new
pub async fn sync_mempool(ctx: &NodeContext, peer: &PeerInfo) -> Result<usize, NetworkError> {
    let txns = download_mempool(&ctx.peers, peer, ctx.read_timeout).await?;
    let total = txns.len();

    let mut admitted = 0;
    for txn in txns {
        let id = txn.id.clone();
        match ctx.ledger.admit_transaction(txn).await {
            Ok(true) => admitted += 1,
            Ok(false) => {}
            Err(e) => log::warn!("Skipping transaction {} from {}: {}", id, peer.id, e),
        }
    }
    log::info!(
        "Mempool sync from {}: {} of {} transactions admitted",
        peer.id,
        admitted,
        total
    );
    Ok(admitted)
}

/// Answer one `/download/mempool` request
pub async fn serve_mempool<S>(
    ctx: &NodeContext,
    stream: &mut LineStream<S>,
    remote: &str,
) -> Result<usize, NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let txns = ctx.ledger.mempool_snapshot().await;
    write_line(stream, &txns.len().to_string()).await?;
    for txn in &txns {
        write_json(stream, txn).await?;
    }
    log::debug!("Sent {} pending transactions to {}", txns.len(), remote);
    Ok(txns.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::validation::tests::{coins, mine_on};
    use crate::core::{TransactionInput, TransactionOutput};
    use crate::network::protocol::lines;

    async fn grow(ctx: &NodeContext, blocks: usize) {
        for _ in 0..blocks {
            let block = {
                let chain = ctx.ledger.chain().read().await;
                mine_on(&chain, "miner", Vec::new(), 1)
            };
            ctx.ledger.commit_block(block).await.unwrap();
        }
    }

    async fn tip_request(ctx: &NodeContext) -> SyncRequest {
        let tip = ctx.ledger.tip().await.unwrap();
        SyncRequest {
            block_height: tip.height,
            block_hash: tip.hash,
        }
    }

    #[tokio::test]
    async fn test_serve_blocks_newest_first_excluding_requester_height() {
        let responder = NodeContext::for_tests("a");
        grow(&responder, 5).await;

        let (client, server) = tokio::io::duplex(64 * 1024);
        let serving = {
            let ctx = responder.clone();
            tokio::spawn(async move {
                let mut stream = lines(server);
                serve_blockchain(&ctx, &mut stream, "b").await
            })
        };

        let request = SyncRequest {
            block_height: 2,
            block_hash: "ignored".into(),
        };
        let mut stream = lines(client);
        let blocks = request_blocks(&mut stream, &request, None, "a").await.unwrap();
        assert_eq!(serving.await.unwrap().unwrap(), 3);

        let heights: Vec<u64> = blocks.iter().map(|b| b.height).collect();
        assert_eq!(heights, vec![5, 4, 3]);
        assert_eq!(blocks[0].hash, responder.ledger.tip().await.unwrap().hash);
    }

    #[tokio::test]
    async fn test_shorter_responder_sends_sentinel() {
        let responder = NodeContext::for_tests("a");
        grow(&responder, 1).await;
        let requester = NodeContext::for_tests("b");
        grow(&requester, 1).await;
        let request = tip_request(&requester).await;

        let (client, server) = tokio::io::duplex(4096);
        let serving = tokio::spawn(async move {
            let mut stream = lines(server);
            serve_blockchain(&responder, &mut stream, "b").await
        });

        let mut stream = lines(client);
        let result = request_blocks(&mut stream, &request, None, "a").await;
        assert!(matches!(result, Err(NetworkError::PeerShorter(ref id)) if id == "a"));
        assert_eq!(serving.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_serve_blockchain_times_out_on_silent_requester() {
        let mut responder = NodeContext::for_tests("a");
        responder.read_timeout = Some(Duration::from_millis(20));

        let (_client, server) = tokio::io::duplex(4096);
        let mut stream = lines(server);
        let result = serve_blockchain(&responder, &mut stream, "b").await;
        assert!(matches!(result, Err(NetworkError::Timeout)));
    }

    #[tokio::test]
    async fn test_mempool_transfer() {
        let responder = NodeContext::for_tests("a");
        let funding = Transaction::coinbase("alice", coins("4"));
        responder.ledger.apply_transaction(&funding).await;
        let txn = Transaction::new(
            vec![TransactionInput::new(funding.id.clone(), 0)],
            vec![TransactionOutput::new("bob", coins("3"))],
            coins("1"),
        );
        responder.ledger.admit_transaction(txn.clone()).await.unwrap();

        let (client, server) = tokio::io::duplex(16 * 1024);
        let serving = tokio::spawn(async move {
            let mut stream = lines(server);
            serve_mempool(&responder, &mut stream, "b").await
        });

        let mut stream = lines(client);
        let txns = request_mempool(&mut stream, None, "a").await.unwrap();
        assert_eq!(serving.await.unwrap().unwrap(), 1);
        assert_eq!(txns, vec![txn]);
    }

    #[tokio::test]
    async fn test_garbage_count_is_a_protocol_error() {
        let (client, server) = tokio::io::duplex(1024);
        let writer = tokio::spawn(async move {
            let mut stream = lines(server);
            write_line(&mut stream, "lots").await.unwrap();
        });

        let mut stream = lines(client);
        let result = request_mempool(&mut stream, None, "a").await;
        assert!(matches!(result, Err(NetworkError::Protocol(_))));
        writer.await.unwrap();
    }
}
