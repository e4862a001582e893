//! Wire protocol definitions
//!
//! Every stream carries one protocol, named `<prefix><suffix>` (for example
//! `/heatcoin/1.0.0/gossip`). The opener writes a [`StreamHeader`] line
//! first; everything after it is newline-delimited, mostly JSON.

use crate::network::peer::NetworkError;
use futures::{FutureExt, SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

/// Default protocol ID prefix
pub const DEFAULT_PROTOCOL_PREFIX: &str = "/heatcoin/1.0.0";

/// Maximum accepted line length (bytes)
pub const MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

/// Reply of a sync responder whose chain is not longer than the requester's
pub const SHORTER_CHAIN: &str = "Shorter. Try from others";

/// A newline-framed stream
pub type LineStream<S> = Framed<S, LinesCodec>;

/// Stream protocols a node serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Raw text to one peer
    Message,
    /// Chat gossip envelopes
    Gossip,
    /// Transaction propagation
    BroadcastTransaction,
    /// Block propagation (header plus transaction IDs)
    BroadcastBlock,
    /// Blockchain download
    DownloadBlockchain,
    /// Mempool download
    DownloadMempool,
}

impl Protocol {
    pub const ALL: [Protocol; 6] = [
        Protocol::Message,
        Protocol::Gossip,
        Protocol::BroadcastTransaction,
        Protocol::BroadcastBlock,
        Protocol::DownloadBlockchain,
        Protocol::DownloadMempool,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            Protocol::Message => "/message",
            Protocol::Gossip => "/gossip",
            Protocol::BroadcastTransaction => "/broadcast/transaction",
            Protocol::BroadcastBlock => "/broadcast/block",
            Protocol::DownloadBlockchain => "/download/blockchain",
            Protocol::DownloadMempool => "/download/mempool",
        }
    }

    /// Full protocol ID under a prefix
    pub fn full_name(self, prefix: &str) -> String {
        format!("{}{}", prefix, self.suffix())
    }

    /// Resolve a protocol ID by its suffix
    ///
    /// `/propagate` is accepted as an alias of block propagation.
    pub fn from_name(name: &str) -> Option<Protocol> {
        if name.ends_with("/propagate") {
            return Some(Protocol::BroadcastBlock);
        }
        Self::ALL
            .into_iter()
            .find(|protocol| name.ends_with(protocol.suffix()))
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// First line written by the opener of every stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamHeader {
    pub protocol: String,
    pub peer_id: String,
    /// Address the opener accepts streams on; empty if it does not listen
    #[serde(default)]
    pub listen_addr: String,
}

/// Chat gossip envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: String,
    #[serde(rename = "m_id")]
    pub sequence: u32,
    pub content: String,
}

/// Sync request: the requester's tip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub block_height: u64,
    pub block_hash: String,
}

/// Wrap a byte stream in newline framing
pub fn lines<S>(io: S) -> LineStream<S>
where
    S: AsyncRead + AsyncWrite,
{
    Framed::new(io, LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
}

/// Read the next line, optionally bounded by a timeout
///
/// Returns `Ok(None)` when the remote closed the stream.
pub async fn read_line<S>(
    stream: &mut LineStream<S>,
    timeout: Option<Duration>,
) -> Result<Option<String>, NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let next = match timeout {
        Some(limit) => tokio::time::timeout(limit, stream.next())
            .await
            .map_err(|_| NetworkError::Timeout)?,
        None => stream.next().await,
    };
    next.transpose().map_err(NetworkError::from)
}

/// Read the next line and decode it as JSON
pub async fn read_json<S, T>(
    stream: &mut LineStream<S>,
    timeout: Option<Duration>,
) -> Result<T, NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: DeserializeOwned,
{
    let line = read_line(stream, timeout)
        .await?
        .ok_or(NetworkError::Disconnected)?;
    Ok(serde_json::from_str(&line)?)
}

/// Write one line and flush it
pub async fn write_line<S>(stream: &mut LineStream<S>, line: &str) -> Result<(), NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.send(line).await?;
    Ok(())
}

/// Write a value as one JSON line and flush it
pub async fn write_json<S, T>(stream: &mut LineStream<S>, value: &T) -> Result<(), NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    let line = serde_json::to_string(value)?;
    write_line(stream, &line).await
}

/// Run `handler` on every line until the remote closes the stream
///
/// A failing or panicking handler is logged and the loop moves on to the
/// next line. Over-long lines are skipped; only an I/O error ends the loop
/// early.
pub async fn read_loop<S, F, Fut>(
    mut stream: LineStream<S>,
    label: &str,
    remote: &str,
    mut handler: F,
) where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<(), NetworkError>>,
{
    loop {
        let line = match stream.next().await {
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                log::warn!("{}: over-long line from {} skipped", label, remote);
                continue;
            }
            Some(Err(LinesCodecError::Io(e))) => {
                log::warn!("{}: stream from {} failed: {}", label, remote, e);
                break;
            }
            None => {
                log::debug!("{}: stream from {} closed", label, remote);
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match AssertUnwindSafe(handler(line.to_string())).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("{}: line from {} dropped: {}", label, remote, e),
            Err(_) => log::error!("{}: handler panicked on a line from {}", label, remote),
        }
    }
}
