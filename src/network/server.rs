//! TCP server and connection handling
//!
//! Accepts incoming streams, reads the opener's header and hands the stream
//! to the handler registered for its protocol.

use crate::network::gossip::{handle_gossip, handle_message};
use crate::network::node::NodeContext;
use crate::network::peer::{NetworkError, PeerInfo};
use crate::network::propagate::{handle_blocks, handle_transactions};
use crate::network::protocol::{lines, read_json, Protocol, StreamHeader};
use crate::network::sync::{serve_blockchain, serve_mempool};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// TCP server for accepting peer streams
pub struct Server {
    listener: TcpListener,
}

impl Server {
    /// Bind to an address and create the server
    pub async fn bind(addr: &str) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("Server listening on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    /// Get the bound address
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Accept incoming connections
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), std::io::Error> {
        self.listener.accept().await
    }

    /// Accept streams until `shutdown` fires, one task per stream
    pub fn spawn(self, ctx: NodeContext, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        log::info!("Server shutting down");
                        break;
                    }
                    accepted = self.accept() => match accepted {
                        Ok((stream, addr)) => {
                            log::debug!("Incoming stream from {}", addr);
                            let ctx = ctx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, ctx).await {
                                    log::warn!("Stream from {} failed: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            log::error!("Accept error: {}", e);
                        }
                    }
                }
            }
        })
    }
}

/// Serve one inbound stream from header to close
///
/// The opener's advertised listen address is added to the peer table.
pub async fn handle_connection<S>(io: S, ctx: NodeContext) -> Result<(), NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = lines(io);
    let header: StreamHeader = read_json(&mut stream, ctx.read_timeout).await?;

    if !header.protocol.starts_with(ctx.peers.protocol_prefix()) {
        return Err(NetworkError::Protocol(format!(
            "foreign protocol {}",
            header.protocol
        )));
    }
    let protocol = Protocol::from_name(&header.protocol)
        .ok_or_else(|| NetworkError::Protocol(format!("unknown protocol {}", header.protocol)))?;

    if !header.listen_addr.is_empty() {
        ctx.peers
            .add_peer(PeerInfo::new(header.peer_id.clone(), header.listen_addr.clone()))
            .await;
    }
    let remote = header.peer_id;
    log::debug!("{} stream opened by {}", protocol, remote);

    match protocol {
        Protocol::Message => handle_message(ctx, stream, remote).await,
        Protocol::Gossip => handle_gossip(ctx, stream, remote).await,
        Protocol::BroadcastTransaction => handle_transactions(ctx, stream, remote).await,
        Protocol::BroadcastBlock => handle_blocks(ctx, stream, remote).await,
        Protocol::DownloadBlockchain => {
            serve_blockchain(&ctx, &mut stream, &remote).await?;
        }
        Protocol::DownloadMempool => {
            serve_mempool(&ctx, &mut stream, &remote).await?;
        }
    }
    Ok(())
}
