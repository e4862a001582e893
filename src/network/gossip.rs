//! Chat gossip and direct messages
//!
//! Chat envelopes flood through the network. Each node remembers the highest
//! sequence number seen per sender and forwards only envelopes above it, so
//! a replay never triggers a second round of forwarding.

use crate::network::node::NodeContext;
use crate::network::peer::NetworkError;
use crate::network::protocol::{read_loop, ChatMessage, LineStream, Protocol};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::io::{AsyncRead, AsyncWrite};

/// Per-sender dedup state and message archive
#[derive(Debug, Default)]
pub struct GossipLedger {
    highest: HashMap<String, u32>,
    archive: HashMap<String, BTreeMap<u32, String>>,
    local_sequence: u32,
}

impl GossipLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an envelope if it is news
    ///
    /// The first envelope from an unseen sender is always accepted; after
    /// that only strictly higher sequence numbers are.
    pub fn observe(&mut self, msg: &ChatMessage) -> bool {
        if let Some(&highest) = self.highest.get(&msg.sender) {
            if msg.sequence <= highest {
                return false;
            }
        }
        self.highest.insert(msg.sender.clone(), msg.sequence);
        self.archive
            .entry(msg.sender.clone())
            .or_default()
            .insert(msg.sequence, msg.content.clone());
        true
    }

    /// Stamp our next outgoing envelope and record it as seen
    pub fn next_local(&mut self, local_id: &str, content: &str) -> ChatMessage {
        self.local_sequence += 1;
        let msg = ChatMessage {
            sender: local_id.to_string(),
            sequence: self.local_sequence,
            content: content.to_string(),
        };
        self.observe(&msg);
        msg
    }

    pub fn highest_seen(&self, sender: &str) -> Option<u32> {
        self.highest.get(sender).copied()
    }

    /// Archived messages of one sender, by sequence number
    pub fn archive_of(&self, sender: &str) -> Option<&BTreeMap<u32, String>> {
        self.archive.get(sender)
    }
}

/// A direct message received on `/message`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxMessage {
    pub from: String,
    pub content: String,
    pub received_at: DateTime<Utc>,
}

/// Handle one chat envelope from `remote`
///
/// Returns the number of peers it was forwarded to.
pub async fn accept_chat(
    ctx: &NodeContext,
    remote: &str,
    msg: ChatMessage,
) -> Result<usize, NetworkError> {
    if !ctx.gossip.write().await.observe(&msg) {
        log::debug!("Gossip {}#{} already seen", msg.sender, msg.sequence);
        return Ok(0);
    }
    log::info!("[gossip] {}: {}", msg.sender, msg.content);

    let line = serde_json::to_string(&msg)?;
    let reached = ctx
        .peers
        .broadcast(Protocol::Gossip, &line, &[remote, msg.sender.as_str()])
        .await;
    Ok(reached)
}

/// Serve a `/gossip` stream until it closes
pub async fn handle_gossip<S>(ctx: NodeContext, stream: LineStream<S>, remote: String)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    read_loop(stream, "gossip", &remote, |line| {
        let ctx = ctx.clone();
        let remote = remote.clone();
        async move {
            let msg: ChatMessage = serde_json::from_str(&line)?;
            accept_chat(&ctx, &remote, msg).await?;
            Ok(())
        }
    })
    .await;
}

/// Serve a `/message` stream until it closes
pub async fn handle_message<S>(ctx: NodeContext, stream: LineStream<S>, remote: String)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    read_loop(stream, "message", &remote, |line| {
        let ctx = ctx.clone();
        let remote = remote.clone();
        async move {
            log::info!("[message] {}: {}", remote, line);
            ctx.inbox.write().await.push(InboxMessage {
                from: remote,
                content: line,
                received_at: Utc::now(),
            });
            Ok(())
        }
    })
    .await;
}
