//! Peer management for P2P networking
//!
//! Tracks known peers by node ID, opens one TCP stream per protocol
//! exchange, and fans lines out to every peer.

use crate::core::{BlockError, ChainError, ValidationError};
use crate::network::protocol::{lines, write_json, write_line, LineStream, Protocol, StreamHeader};
use futures::future::join_all;
use futures::SinkExt;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio_util::codec::LinesCodecError;

/// Time allowed for a TCP connect to a peer
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Framing error: {0}")]
    Codec(#[from] LinesCodecError),
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),
    #[error("Invalid peer address: {0}")]
    InvalidPeer(String),
    #[error("No known peers")]
    NoPeers,
    #[error("No peer could be reached")]
    Unreachable,
    #[error("Peer {0} does not have a longer chain")]
    PeerShorter(String),
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("Timed out waiting for peer")]
    Timeout,
    #[error("Rejected: {0}")]
    Rejected(#[from] ValidationError),
    #[error("Block could not be rebuilt: {0}")]
    Block(#[from] BlockError),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// A known peer: node ID and the address it accepts streams on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerInfo {
    pub id: String,
    pub addr: String,
}

impl PeerInfo {
    pub fn new(id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
        }
    }
}

/// Parses `id@host:port`
impl FromStr for PeerInfo {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once('@') {
            Some((id, addr)) if !id.is_empty() && !addr.is_empty() => Ok(PeerInfo::new(id, addr)),
            _ => Err(NetworkError::InvalidPeer(s.to_string())),
        }
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

/// Manages the peer table and outbound streams
pub struct PeerManager {
    /// Our node ID, sent in every stream header
    local_id: String,
    /// Protocol ID prefix
    protocol_prefix: String,
    /// Address we advertise to peers
    listen_addr: RwLock<String>,
    /// Known peers by ID
    peers: RwLock<HashMap<String, PeerInfo>>,
}

impl PeerManager {
    pub fn new(local_id: impl Into<String>, protocol_prefix: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            protocol_prefix: protocol_prefix.into(),
            listen_addr: RwLock::new(String::new()),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn protocol_prefix(&self) -> &str {
        &self.protocol_prefix
    }

    pub async fn set_listen_addr(&self, addr: impl Into<String>) {
        *self.listen_addr.write().await = addr.into();
    }

    pub async fn listen_addr(&self) -> String {
        self.listen_addr.read().await.clone()
    }

    /// Add or refresh a peer
    ///
    /// Returns true if the table changed. Our own ID is never added.
    pub async fn add_peer(&self, peer: PeerInfo) -> bool {
        if peer.id == self.local_id {
            return false;
        }
        let mut peers = self.peers.write().await;
        if peers.get(&peer.id) == Some(&peer) {
            return false;
        }
        log::info!("Added peer: {}", peer);
        peers.insert(peer.id.clone(), peer);
        true
    }

    /// Remove a peer
    pub async fn remove_peer(&self, id: &str) -> Option<PeerInfo> {
        let removed = self.peers.write().await.remove(id);
        if removed.is_some() {
            log::info!("Removed peer: {}", id);
        }
        removed
    }

    pub async fn get(&self, id: &str) -> Option<PeerInfo> {
        self.peers.read().await.get(id).cloned()
    }

    /// All known peers, sorted by ID
    pub async fn get_peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.read().await.values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    /// Get peer count
    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Pick a peer uniformly at random
    pub async fn random_peer(&self) -> Option<PeerInfo> {
        let peers = self.get_peers().await;
        peers.choose(&mut rand::thread_rng()).cloned()
    }

    /// Connect to a peer and open a stream for `protocol`
    pub async fn open_stream(
        &self,
        peer: &PeerInfo,
        protocol: Protocol,
    ) -> Result<LineStream<TcpStream>, NetworkError> {
        let socket = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&peer.addr))
            .await
            .map_err(|_| NetworkError::Timeout)?
            .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", peer, e)))?;

        let mut stream = lines(socket);
        let header = StreamHeader {
            protocol: protocol.full_name(&self.protocol_prefix),
            peer_id: self.local_id.clone(),
            listen_addr: self.listen_addr().await,
        };
        write_json(&mut stream, &header).await?;
        Ok(stream)
    }

    /// Open a stream, write one line, and close it
    pub async fn send_line(
        &self,
        peer: &PeerInfo,
        protocol: Protocol,
        line: &str,
    ) -> Result<(), NetworkError> {
        let mut stream = self.open_stream(peer, protocol).await?;
        write_line(&mut stream, line).await?;
        SinkExt::<&str>::close(&mut stream).await?;
        Ok(())
    }

    /// Send a line to every known peer except the listed IDs
    ///
    /// Per-peer failures are logged and skipped. Returns how many peers the
    /// line reached.
    pub async fn broadcast(&self, protocol: Protocol, line: &str, except: &[&str]) -> usize {
        let targets: Vec<PeerInfo> = self
            .get_peers()
            .await
            .into_iter()
            .filter(|peer| !except.contains(&peer.id.as_str()))
            .collect();

        let results = join_all(targets.iter().map(|peer| async move {
            let result = self.send_line(peer, protocol, line).await;
            (peer, result)
        }))
        .await;

        results
            .into_iter()
            .filter(|(peer, result)| match result {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("Failed to send {} to {}: {}", protocol, peer, e);
                    false
                }
            })
            .count()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::network::protocol::{read_json, read_line, DEFAULT_PROTOCOL_PREFIX};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// A listening peer that records `(protocol, line)` for every line it
    /// receives after the stream header
    pub(crate) async fn recording_peer(
        id: &str,
    ) -> (PeerInfo, mpsc::UnboundedReceiver<(String, String)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut stream = lines(socket);
                    let header: StreamHeader = match read_json(&mut stream, None).await {
                        Ok(header) => header,
                        Err(_) => return,
                    };
                    while let Ok(Some(line)) = read_line(&mut stream, None).await {
                        let _ = tx.send((header.protocol.clone(), line));
                    }
                });
            }
        });
        (PeerInfo::new(id, addr), rx)
    }

    /// Everything a recording peer has received once traffic settles
    pub(crate) async fn received(
        rx: &mut mpsc::UnboundedReceiver<(String, String)>,
    ) -> Vec<(String, String)> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut entries = Vec::new();
        while let Ok(entry) = rx.try_recv() {
            entries.push(entry);
        }
        entries
    }

    #[test]
    fn test_parse_peer() {
        let peer: PeerInfo = "node-b@127.0.0.1:4001".parse().unwrap();
        assert_eq!(peer.id, "node-b");
        assert_eq!(peer.addr, "127.0.0.1:4001");
        assert_eq!(peer.to_string(), "node-b@127.0.0.1:4001");

        assert!("no-separator".parse::<PeerInfo>().is_err());
        assert!("@127.0.0.1:1".parse::<PeerInfo>().is_err());
    }

    #[tokio::test]
    async fn test_peer_table() {
        let manager = PeerManager::new("self", DEFAULT_PROTOCOL_PREFIX);
        assert!(!manager.add_peer(PeerInfo::new("self", "127.0.0.1:1")).await);
        assert!(manager.add_peer(PeerInfo::new("b", "127.0.0.1:2")).await);
        assert!(!manager.add_peer(PeerInfo::new("b", "127.0.0.1:2")).await);
        assert!(manager.add_peer(PeerInfo::new("b", "127.0.0.1:3")).await);
        assert!(manager.add_peer(PeerInfo::new("a", "127.0.0.1:4")).await);

        let ids: Vec<String> = manager.get_peers().await.into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(manager.get("b").await.unwrap().addr, "127.0.0.1:3");
        assert!(manager.random_peer().await.is_some());

        manager.remove_peer("a").await;
        assert_eq!(manager.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_send_line_writes_header_first() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let manager = PeerManager::new("node-a", DEFAULT_PROTOCOL_PREFIX);
        manager.set_listen_addr("127.0.0.1:9999").await;
        let peer = PeerInfo::new("node-b", addr);

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut stream = lines(socket);
            let header: StreamHeader = read_json(&mut stream, None).await.unwrap();
            let line = read_line(&mut stream, None).await.unwrap();
            (header, line)
        });

        manager.send_line(&peer, Protocol::Gossip, "payload").await.unwrap();
        let (header, line) = server.await.unwrap();

        assert_eq!(header.protocol, "/heatcoin/1.0.0/gossip");
        assert_eq!(header.peer_id, "node-a");
        assert_eq!(header.listen_addr, "127.0.0.1:9999");
        assert_eq!(line.as_deref(), Some("payload"));
    }

    #[tokio::test]
    async fn test_broadcast_skips_excluded_and_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let mut stream = lines(socket);
                while let Ok(Some(_)) = read_line(&mut stream, None).await {}
            }
        });

        // A port nothing listens on
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = closed.local_addr().unwrap().to_string();
        drop(closed);

        let manager = PeerManager::new("node-a", DEFAULT_PROTOCOL_PREFIX);
        manager.add_peer(PeerInfo::new("live", addr.clone())).await;
        manager.add_peer(PeerInfo::new("excluded", addr)).await;
        manager.add_peer(PeerInfo::new("dead", dead_addr)).await;

        let reached = manager.broadcast(Protocol::Gossip, "hi", &["excluded"]).await;
        assert_eq!(reached, 1);
    }
}
