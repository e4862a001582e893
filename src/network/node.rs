//! P2P Node implementation
//!
//! The node owns the ledger, the peer table and the gossip state, serves
//! inbound streams, and exposes the local actions: sending funds, mining,
//! chatting and syncing.

use crate::core::{
    Amount, Block, ChainError, LedgerParams, Transaction, TransactionInput, TransactionOutput,
    Utxo, ValidationError, DEFAULT_DIFFICULTY,
};
use crate::crypto::{KeyError, KeyPair};
use crate::mining::{MempoolStats, Miner, MiningError};
use crate::network::gossip::{GossipLedger, InboxMessage};
use crate::network::peer::{NetworkError, PeerInfo, PeerManager};
use crate::network::protocol::{Protocol, DEFAULT_PROTOCOL_PREFIX};
use crate::network::server::Server;
use crate::network::sync::{sync_blockchain, sync_mempool};
use crate::storage::{InclusionProof, Ledger};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Node errors raised while starting up
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Identity error: {0}")]
    Key(#[from] KeyError),
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Input errors of the send-funds action
#[derive(Error, Debug)]
pub enum SendError {
    #[error("Unknown UTXO: {0}")]
    UnknownUtxo(String),
    #[error("UTXO {0} listed twice")]
    DuplicateUtxo(String),
    #[error("Insufficient funds: have {available}, need {required}")]
    InsufficientFunds { available: Amount, required: Amount },
    #[error("No peers to send the transaction to")]
    NoPeers,
    #[error("No peer accepted the transaction")]
    Unreachable,
    #[error("Invalid transaction: {0}")]
    Invalid(#[from] ValidationError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// P2P Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address to accept streams on
    pub listen_addr: String,
    /// Address announced to peers; defaults to the bound address
    pub advertise_addr: Option<String>,
    /// Protocol ID prefix
    pub protocol_prefix: String,
    /// Minimum block difficulty (leading zero hex characters)
    pub difficulty: u32,
    /// Value a coinbase may mint on top of fees
    pub block_reward: Amount,
    /// Initial peers as `id@host:port`
    pub bootstrap_peers: Vec<String>,
    /// Hex secp256k1 private key; generated when absent
    pub private_key: Option<String>,
    /// Deadline for request reads on inbound streams
    pub read_timeout: Option<Duration>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:4001".to_string(),
            advertise_addr: None,
            protocol_prefix: DEFAULT_PROTOCOL_PREFIX.to_string(),
            difficulty: DEFAULT_DIFFICULTY,
            block_reward: Amount::ZERO,
            bootstrap_peers: Vec::new(),
            private_key: None,
            read_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Shared state handed to every stream handler
#[derive(Clone)]
pub struct NodeContext {
    pub ledger: Arc<Ledger>,
    pub peers: Arc<PeerManager>,
    pub gossip: Arc<RwLock<GossipLedger>>,
    pub inbox: Arc<RwLock<Vec<InboxMessage>>>,
    pub read_timeout: Option<Duration>,
}

impl NodeContext {
    pub fn new(ledger: Arc<Ledger>, peers: Arc<PeerManager>, read_timeout: Option<Duration>) -> Self {
        Self {
            ledger,
            peers,
            gossip: Arc::new(RwLock::new(GossipLedger::new())),
            inbox: Arc::new(RwLock::new(Vec::new())),
            read_timeout,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(local_id: &str) -> Self {
        Self::new(
            Arc::new(Ledger::new(LedgerParams::with_difficulty(1))),
            Arc::new(PeerManager::new(local_id, DEFAULT_PROTOCOL_PREFIX)),
            Some(Duration::from_secs(5)),
        )
    }
}

/// Node status information
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub id: String,
    pub listen_addr: String,
    pub height: u64,
    pub tip: String,
    pub peers: usize,
    pub mempool: MempoolStats,
    pub mining_height: Option<u64>,
}

/// The main P2P node
pub struct Node {
    config: NodeConfig,
    keys: KeyPair,
    ctx: NodeContext,
    miner: Miner,
    shutdown: CancellationToken,
}

impl Node {
    /// Create a new node holding only the genesis block
    pub async fn new(config: NodeConfig) -> Result<Self, NodeError> {
        let keys = match &config.private_key {
            Some(hex_key) => KeyPair::from_private_key_hex(hex_key)?,
            None => KeyPair::generate(),
        };
        let id = keys.address();

        let params = LedgerParams {
            difficulty: config.difficulty,
            block_reward: config.block_reward,
        };
        let ledger = Arc::new(Ledger::new(params));
        let peers = Arc::new(PeerManager::new(id.clone(), config.protocol_prefix.clone()));
        for entry in &config.bootstrap_peers {
            let peer: PeerInfo = entry.parse()?;
            peers.add_peer(peer).await;
        }

        let ctx = NodeContext::new(ledger.clone(), peers, config.read_timeout);
        let miner = Miner::new(ledger, &id);
        log::info!("Node identity: {}", id);

        Ok(Self {
            config,
            keys,
            ctx,
            miner,
            shutdown: CancellationToken::new(),
        })
    }

    /// Bind the listener and start serving streams
    pub async fn start(&self) -> Result<SocketAddr, NodeError> {
        let server = Server::bind(&self.config.listen_addr).await?;
        let local = server.local_addr()?;

        let advertised = match &self.config.advertise_addr {
            Some(addr) => addr.clone(),
            None if local.ip().is_unspecified() => format!("127.0.0.1:{}", local.port()),
            None => local.to_string(),
        };
        self.ctx.peers.set_listen_addr(advertised.clone()).await;

        server.spawn(self.ctx.clone(), self.shutdown.child_token());
        log::info!("Node started, advertising {}", advertised);
        Ok(local)
    }

    /// Start-up sync: genesis, then chain and mempool from a random peer
    ///
    /// Returns the number of blocks merged. A peer whose chain is not longer
    /// than ours is not an error.
    pub async fn bootstrap(&self) -> Result<usize, NetworkError> {
        if self.ctx.ledger.ensure_genesis().await {
            log::info!("Created genesis block");
        }
        let peer = self
            .ctx
            .peers
            .random_peer()
            .await
            .ok_or(NetworkError::NoPeers)?;

        let merged = match sync_blockchain(&self.ctx, &peer).await {
            Ok(merged) => merged,
            Err(NetworkError::PeerShorter(_)) => {
                log::info!("Chain is already as long as {}'s", peer.id);
                0
            }
            Err(e) => return Err(e),
        };
        sync_mempool(&self.ctx, &peer).await?;
        Ok(merged)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> &str {
        self.ctx.peers.local_id()
    }

    pub fn keys(&self) -> &KeyPair {
        &self.keys
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ctx.ledger
    }

    pub fn peers(&self) -> &Arc<PeerManager> {
        &self.ctx.peers
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Spend `utxo_keys` to `recipients`, returning change to ourselves
    ///
    /// The transaction is broadcast first and only pooled locally once at
    /// least one peer accepted the stream.
    pub async fn send_funds(
        &self,
        utxo_keys: &[String],
        recipients: &[(String, Amount)],
        fee: Amount,
    ) -> Result<String, SendError> {
        let mut seen = HashSet::new();
        let mut inputs = Vec::with_capacity(utxo_keys.len());
        let mut available = Amount::ZERO;
        for key in utxo_keys {
            if !seen.insert(key.as_str()) {
                return Err(SendError::DuplicateUtxo(key.clone()));
            }
            let utxo = self
                .ctx
                .ledger
                .utxo(key)
                .await
                .ok_or_else(|| SendError::UnknownUtxo(key.clone()))?;
            available = available + utxo.value;
            inputs.push(TransactionInput::new(utxo.txn_id, utxo.index));
        }

        let paid: Amount = recipients.iter().map(|(_, value)| *value).sum();
        let required = paid + fee;
        if required > available {
            return Err(SendError::InsufficientFunds {
                available,
                required,
            });
        }

        let mut outputs: Vec<TransactionOutput> = recipients
            .iter()
            .map(|(recipient, value)| TransactionOutput::new(recipient.clone(), *value))
            .collect();
        let change = available - required;
        if change > Amount::ZERO {
            outputs.push(TransactionOutput::new(self.id(), change));
        }

        let txn = Transaction::new(inputs, outputs, fee);
        self.ctx.ledger.validate_transaction(&txn).await?;

        if self.ctx.peers.peer_count().await == 0 {
            return Err(SendError::NoPeers);
        }
        let line = serde_json::to_string(&txn)?;
        let reached = self
            .ctx
            .peers
            .broadcast(Protocol::BroadcastTransaction, &line, &[])
            .await;
        if reached == 0 {
            return Err(SendError::Unreachable);
        }

        let id = txn.id.clone();
        self.ctx.ledger.admit_transaction(txn).await?;
        log::info!("Transaction {} sent to {} peers", id, reached);
        Ok(id)
    }

    // =========================================================================
    // Mining
    // =========================================================================

    /// Assemble a candidate block from pooled transactions
    pub async fn create_block(&self, txn_ids: &[String]) -> Result<Block, MiningError> {
        self.miner.create_block(txn_ids).await
    }

    /// Mine `candidate` in the background, cancelling any running attempt
    ///
    /// A confirmed block is fanned out to every peer before the handle
    /// resolves.
    pub async fn start_mining(&self, candidate: Block) -> JoinHandle<Result<Block, MiningError>> {
        let attempt = self.miner.start(candidate).await;
        let peers = self.ctx.peers.clone();

        tokio::spawn(async move {
            let (block, _stats) = attempt
                .await
                .map_err(|e| MiningError::Task(e.to_string()))??;

            let line = serde_json::to_string(&block.to_transfer())
                .map_err(|e| MiningError::Task(e.to_string()))?;
            let reached = peers.broadcast(Protocol::BroadcastBlock, &line, &[]).await;
            log::info!("Block {} announced to {} peers", block.hash, reached);
            Ok(block)
        })
    }

    /// Mine the given pooled transactions and wait for the outcome
    pub async fn mine(&self, txn_ids: &[String]) -> Result<Block, MiningError> {
        let candidate = self.create_block(txn_ids).await?;
        self.start_mining(candidate)
            .await
            .await
            .map_err(|e| MiningError::Task(e.to_string()))?
    }

    /// IDs of every pooled transaction, highest fee first
    pub async fn pending_ids(&self) -> Vec<String> {
        self.ctx.ledger.mempool().read().await.transaction_ids()
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    /// Flood a chat message; returns the number of peers reached
    pub async fn broadcast_chat(&self, text: &str) -> Result<usize, NetworkError> {
        if self.ctx.peers.peer_count().await == 0 {
            return Err(NetworkError::NoPeers);
        }
        let msg = self.ctx.gossip.write().await.next_local(self.id(), text);
        let line = serde_json::to_string(&msg)?;
        Ok(self.ctx.peers.broadcast(Protocol::Gossip, &line, &[]).await)
    }

    /// Send one raw line to a single peer
    pub async fn send_direct_message(&self, peer_id: &str, text: &str) -> Result<(), NetworkError> {
        let peer = self
            .ctx
            .peers
            .get(peer_id)
            .await
            .ok_or_else(|| NetworkError::UnknownPeer(peer_id.to_string()))?;
        self.ctx.peers.send_line(&peer, Protocol::Message, text).await
    }

    pub async fn inbox(&self) -> Vec<InboxMessage> {
        self.ctx.inbox.read().await.clone()
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Download and merge the blocks `peer_id` has above our tip
    pub async fn sync_with(&self, peer_id: &str) -> Result<usize, NetworkError> {
        let peer = self
            .ctx
            .peers
            .get(peer_id)
            .await
            .ok_or_else(|| NetworkError::UnknownPeer(peer_id.to_string()))?;
        sync_blockchain(&self.ctx, &peer).await
    }

    pub async fn sync_random_peer(&self) -> Result<usize, NetworkError> {
        let peer = self
            .ctx
            .peers
            .random_peer()
            .await
            .ok_or(NetworkError::NoPeers)?;
        sync_blockchain(&self.ctx, &peer).await
    }

    /// Admit the valid pending transactions of `peer_id`
    pub async fn sync_mempool_with(&self, peer_id: &str) -> Result<usize, NetworkError> {
        let peer = self
            .ctx
            .peers
            .get(peer_id)
            .await
            .ok_or_else(|| NetworkError::UnknownPeer(peer_id.to_string()))?;
        sync_mempool(&self.ctx, &peer).await
    }

    // =========================================================================
    // Validation and views
    // =========================================================================

    pub async fn validate_chain(&self) -> Result<(), ChainError> {
        self.ctx.ledger.validate_chain().await
    }

    pub async fn validate_block(&self, hash: &str) -> Result<(), ChainError> {
        self.ctx.ledger.validate_stored_block(hash).await
    }

    /// Merkle proof that a confirmed transaction belongs to its block
    pub async fn transaction_proof(&self, txn_id: &str) -> Option<InclusionProof> {
        self.ctx.ledger.inclusion_proof(txn_id).await
    }

    pub async fn mempool_snapshot(&self) -> Vec<Transaction> {
        self.ctx.ledger.mempool_snapshot().await
    }

    pub async fn recent_blocks(&self, count: usize) -> Vec<Block> {
        self.ctx.ledger.recent_blocks(count).await
    }

    pub async fn balance(&self, recipient: &str) -> Amount {
        self.ctx.ledger.balance(recipient).await
    }

    pub async fn utxos_of(&self, recipient: &str) -> Vec<Utxo> {
        self.ctx.ledger.utxos_of(recipient).await
    }

    pub async fn add_peer(&self, peer: PeerInfo) -> bool {
        self.ctx.peers.add_peer(peer).await
    }

    pub async fn list_peers(&self) -> Vec<PeerInfo> {
        self.ctx.peers.get_peers().await
    }

    /// Get node status
    pub async fn status(&self) -> NodeStatus {
        let stats = self.ctx.ledger.chain_stats().await;
        NodeStatus {
            id: self.id().to_string(),
            listen_addr: self.ctx.peers.listen_addr().await,
            height: stats.height,
            tip: stats.latest_hash,
            peers: self.ctx.peers.peer_count().await,
            mempool: self.ctx.ledger.mempool().read().await.stats(),
            mining_height: self.ctx.ledger.mining_height().await,
        }
    }

    /// Stop serving streams and cancel any mining attempt
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.ctx.ledger.cancel_mining_at(u64::MAX).await;
    }
}
