//! P2P Networking module
//!
//! Newline-delimited JSON over one TCP connection per protocol stream.
//!
//! # Features
//! - Stream header handshake and protocol dispatch
//! - Chat gossip with per-sender sequence dedup
//! - Transaction and block flood propagation
//! - Blockchain and mempool download

pub mod gossip;
pub mod node;
pub mod peer;
pub mod propagate;
pub mod protocol;
pub mod server;
pub mod sync;

pub use gossip::{GossipLedger, InboxMessage};
pub use node::{Node, NodeConfig, NodeContext, NodeError, NodeStatus, SendError};
pub use peer::{NetworkError, PeerInfo, PeerManager};
pub use propagate::Propagation;
pub use protocol::{
    ChatMessage, Protocol, StreamHeader, SyncRequest, DEFAULT_PROTOCOL_PREFIX, SHORTER_CHAIN,
};
pub use server::Server;
