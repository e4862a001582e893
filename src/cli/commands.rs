//! Console commands for a running node
//!
//! One line of console input parses into a [`Command`]; executing it against
//! a [`Node`] yields the text to print.

use crate::core::Amount;
use crate::network::{Node, PeerInfo};
use std::fmt::Write;
use std::str::FromStr;
use thiserror::Error;

/// Result type for console operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const USAGE: &str = "\
Commands:
  send <utxo,...> <id:amount,...> <fee>   spend UTXOs, change returns to this node
  mempool                                 list pending transactions
  chain [n]                               show the last n blocks (default 5)
  sync                                    download missing blocks from a random peer
  gossip <text>                           flood a chat message
  msg <peer> <text>                       send a direct message
  inbox                                   show received direct messages
  validate                                validate the whole chain
  validate-block <hash>                   validate one stored block
  proof <txid>                            Merkle inclusion proof of a confirmed transaction
  mine [txid ...]                         mine pending transactions (all if none given)
  peers                                   list known peers
  add-peer <id@host:port>                 add a peer
  balance [id]                            balance of an identity (default: this node)
  utxos [id]                              unspent outputs of an identity
  status                                  node summary
  help                                    show this help
  exit                                    stop the node";

/// Console parse errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("Empty command")]
    Empty,
    #[error("Unknown command '{0}', try 'help'")]
    Unknown(String),
    #[error("Usage: {0}")]
    Usage(&'static str),
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("Invalid number: {0}")]
    InvalidNumber(String),
    #[error("Invalid peer '{0}', expected id@host:port")]
    InvalidPeer(String),
}

/// A parsed console command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Send {
        utxos: Vec<String>,
        recipients: Vec<(String, Amount)>,
        fee: Amount,
    },
    Mempool,
    Chain(usize),
    Sync,
    Gossip(String),
    Msg { peer: String, text: String },
    Inbox,
    Validate,
    ValidateBlock(String),
    Proof(String),
    Mine(Vec<String>),
    Peers,
    AddPeer(PeerInfo),
    Balance(Option<String>),
    Utxos(Option<String>),
    Status,
    Help,
    Exit,
}

fn parse_amount(text: &str) -> Result<Amount, CommandError> {
    text.parse()
        .map_err(|_| CommandError::InvalidAmount(text.to_string()))
}

fn parse_recipients(text: &str) -> Result<Vec<(String, Amount)>, CommandError> {
    text.split(',')
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, value) = entry
                .rsplit_once(':')
                .ok_or(CommandError::Usage("send <utxo,...> <id:amount,...> <fee>"))?;
            Ok((id.to_string(), parse_amount(value)?))
        })
        .collect()
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (name, rest) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };
        let args: Vec<&str> = rest.split_whitespace().collect();
        let first = args.first().map(|arg| arg.to_string());

        match name {
            "" => Err(CommandError::Empty),
            "send" => match args.as_slice() {
                [utxos, recipients, fee] => {
                    let utxos: Vec<String> = utxos
                        .split(',')
                        .filter(|key| !key.is_empty())
                        .map(str::to_string)
                        .collect();
                    let recipients = parse_recipients(recipients)?;
                    if utxos.is_empty() || recipients.is_empty() {
                        return Err(CommandError::Usage("send <utxo,...> <id:amount,...> <fee>"));
                    }
                    Ok(Command::Send {
                        utxos,
                        recipients,
                        fee: parse_amount(fee)?,
                    })
                }
                _ => Err(CommandError::Usage("send <utxo,...> <id:amount,...> <fee>")),
            },
            "mempool" => Ok(Command::Mempool),
            "chain" => match args.first() {
                Some(count) => count
                    .parse()
                    .map(Command::Chain)
                    .map_err(|_| CommandError::InvalidNumber(count.to_string())),
                None => Ok(Command::Chain(5)),
            },
            "sync" => Ok(Command::Sync),
            "gossip" if !rest.is_empty() => Ok(Command::Gossip(rest.to_string())),
            "gossip" => Err(CommandError::Usage("gossip <text>")),
            "msg" => match rest.split_once(char::is_whitespace) {
                Some((peer, text)) if !text.trim().is_empty() => Ok(Command::Msg {
                    peer: peer.to_string(),
                    text: text.trim().to_string(),
                }),
                _ => Err(CommandError::Usage("msg <peer> <text>")),
            },
            "inbox" => Ok(Command::Inbox),
            "validate" => Ok(Command::Validate),
            "validate-block" => match args.as_slice() {
                [hash] => Ok(Command::ValidateBlock(hash.to_string())),
                _ => Err(CommandError::Usage("validate-block <hash>")),
            },
            "proof" => match args.as_slice() {
                [txid] => Ok(Command::Proof(txid.to_string())),
                _ => Err(CommandError::Usage("proof <txid>")),
            },
            "mine" => Ok(Command::Mine(args.iter().map(|id| id.to_string()).collect())),
            "peers" => Ok(Command::Peers),
            "add-peer" => match args.as_slice() {
                [peer] => peer
                    .parse()
                    .map(Command::AddPeer)
                    .map_err(|_| CommandError::InvalidPeer(peer.to_string())),
                _ => Err(CommandError::Usage("add-peer <id@host:port>")),
            },
            "balance" => Ok(Command::Balance(first)),
            "utxos" => Ok(Command::Utxos(first)),
            "status" => Ok(Command::Status),
            "help" => Ok(Command::Help),
            "exit" | "quit" => Ok(Command::Exit),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

/// Run a command against the node and render its outcome
pub async fn execute(node: &Node, command: Command) -> CliResult<String> {
    let mut out = String::new();

    match command {
        Command::Send {
            utxos,
            recipients,
            fee,
        } => {
            let id = node.send_funds(&utxos, &recipients, fee).await?;
            writeln!(out, "📤 Transaction {} broadcast", id)?;
        }

        Command::Mempool => {
            let pending = node.mempool_snapshot().await;
            writeln!(out, "📬 Pending transactions: {}", pending.len())?;
            for txn in &pending {
                writeln!(
                    out,
                    "   └─ {} | {} in / {} out | fee {}",
                    txn.id,
                    txn.inputs.len(),
                    txn.outputs.len(),
                    txn.fee
                )?;
            }
        }

        Command::Chain(count) => {
            writeln!(out, "🧱 Recent blocks:")?;
            for block in node.recent_blocks(count).await {
                writeln!(
                    out,
                    "   #{} | {} | {} tx | {}",
                    block.height,
                    block.hash,
                    block.transactions.len(),
                    block.timestamp.format("%Y-%m-%d %H:%M:%S")
                )?;
            }
        }

        Command::Sync => {
            let merged = node.sync_random_peer().await?;
            writeln!(out, "🔄 Merged {} blocks", merged)?;
        }

        Command::Gossip(text) => {
            let reached = node.broadcast_chat(&text).await?;
            writeln!(out, "📣 Gossip sent to {} peers", reached)?;
        }

        Command::Msg { peer, text } => {
            node.send_direct_message(&peer, &text).await?;
            writeln!(out, "✉️  Message sent to {}", peer)?;
        }

        Command::Inbox => {
            let inbox = node.inbox().await;
            writeln!(out, "📥 {} messages", inbox.len())?;
            for msg in &inbox {
                writeln!(
                    out,
                    "   [{}] {}: {}",
                    msg.received_at.format("%H:%M:%S"),
                    msg.from,
                    msg.content
                )?;
            }
        }

        Command::Validate => {
            node.validate_chain().await?;
            let height = node.ledger().height().await;
            writeln!(out, "✅ Blockchain is valid ({} blocks verified)", height + 1)?;
        }

        Command::ValidateBlock(hash) => {
            node.validate_block(&hash).await?;
            writeln!(out, "✅ Block {} is valid", hash)?;
        }

        Command::Proof(txid) => {
            let inclusion = node
                .transaction_proof(&txid)
                .await
                .ok_or_else(|| format!("Transaction {} is not confirmed", txid))?;
            writeln!(out, "🌳 Transaction {} in block {}", txid, inclusion.block_hash)?;
            writeln!(out, "   ├─ Merkle root: {}", inclusion.merkle_root)?;
            writeln!(out, "   ├─ Path length: {}", inclusion.proof.siblings.len())?;
            if inclusion.verify() {
                writeln!(out, "   └─ Verified: ✅")?;
            } else {
                writeln!(out, "   └─ Verified: ❌")?;
            }
        }

        Command::Mine(ids) => {
            let ids = if ids.is_empty() {
                node.pending_ids().await
            } else {
                ids
            };
            let candidate = node.create_block(&ids).await?;
            writeln!(
                out,
                "⛏️  Mining block {} with {} transactions",
                candidate.height,
                ids.len()
            )?;
            // Outcome is logged by the mining task
            drop(node.start_mining(candidate).await);
        }

        Command::Peers => {
            let peers = node.list_peers().await;
            writeln!(out, "🌐 Known peers: {}", peers.len())?;
            for peer in &peers {
                writeln!(out, "   └─ {}", peer)?;
            }
        }

        Command::AddPeer(peer) => {
            let label = peer.to_string();
            if node.add_peer(peer).await {
                writeln!(out, "Added peer {}", label)?;
            } else {
                writeln!(out, "Peer {} already known", label)?;
            }
        }

        Command::Balance(id) => {
            let id = id.unwrap_or_else(|| node.id().to_string());
            writeln!(out, "💰 Balance for {}: {}", id, node.balance(&id).await)?;
        }

        Command::Utxos(id) => {
            let id = id.unwrap_or_else(|| node.id().to_string());
            let utxos = node.utxos_of(&id).await;
            writeln!(out, "💰 {} unspent outputs for {}", utxos.len(), id)?;
            for utxo in &utxos {
                writeln!(out, "   └─ {} = {}", utxo.key(), utxo.value)?;
            }
        }

        Command::Status => {
            let status = node.status().await;
            writeln!(out, "ℹ️  Node {}", status.id)?;
            writeln!(out, "   ├─ Listening: {}", status.listen_addr)?;
            writeln!(out, "   ├─ Height: {}", status.height)?;
            writeln!(out, "   ├─ Tip: {}", status.tip)?;
            writeln!(out, "   ├─ Peers: {}", status.peers)?;
            let pool = &status.mempool;
            if pool.tx_count == 0 {
                writeln!(out, "   ├─ Pending: none")?;
            } else {
                writeln!(
                    out,
                    "   ├─ Pending: {} ({} in fees, {} to {} each)",
                    pool.tx_count, pool.total_fees, pool.min_fee, pool.max_fee
                )?;
            }
            match status.mining_height {
                Some(height) => writeln!(out, "   └─ Mining: height {}", height)?,
                None => writeln!(out, "   └─ Mining: idle")?,
            }
        }

        Command::Help => writeln!(out, "{}", USAGE)?,

        Command::Exit => writeln!(out, "📴 Shutting down node...")?,
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::validation::tests::coins;
    use crate::network::NodeConfig;

    fn parse(line: &str) -> Result<Command, CommandError> {
        line.parse()
    }

    async fn test_node() -> Node {
        Node::new(NodeConfig {
            listen_addr: "127.0.0.1:0".into(),
            difficulty: 1,
            ..NodeConfig::default()
        })
        .await
        .unwrap()
    }

    #[test]
    fn test_parse_send() {
        let command = parse("send k1,k2 bob:9.5,carol:0.25 0.01").unwrap();
        assert_eq!(
            command,
            Command::Send {
                utxos: vec!["k1".into(), "k2".into()],
                recipients: vec![("bob".into(), coins("9.5")), ("carol".into(), coins("0.25"))],
                fee: coins("0.01"),
            }
        );

        assert_eq!(
            parse("send k1 bob 0.01"),
            Err(CommandError::Usage("send <utxo,...> <id:amount,...> <fee>"))
        );
        assert_eq!(
            parse("send k1 bob:lots 0.01"),
            Err(CommandError::InvalidAmount("lots".into()))
        );
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(parse("chain"), Ok(Command::Chain(5)));
        assert_eq!(parse("chain 12"), Ok(Command::Chain(12)));
        assert_eq!(parse("chain x"), Err(CommandError::InvalidNumber("x".into())));
        assert_eq!(parse("  gossip hello  world "), Ok(Command::Gossip("hello  world".into())));
        assert_eq!(
            parse("msg node-b see you"),
            Ok(Command::Msg {
                peer: "node-b".into(),
                text: "see you".into()
            })
        );
        assert_eq!(parse("mine"), Ok(Command::Mine(Vec::new())));
        assert_eq!(parse("mine a b"), Ok(Command::Mine(vec!["a".into(), "b".into()])));
        assert_eq!(parse("balance"), Ok(Command::Balance(None)));
        assert_eq!(parse("utxos bob"), Ok(Command::Utxos(Some("bob".into()))));
        assert_eq!(
            parse("add-peer b@127.0.0.1:4002"),
            Ok(Command::AddPeer(PeerInfo::new("b", "127.0.0.1:4002")))
        );
        assert_eq!(parse("add-peer nope"), Err(CommandError::InvalidPeer("nope".into())));
        assert_eq!(parse("proof abc"), Ok(Command::Proof("abc".into())));
        assert_eq!(parse("proof"), Err(CommandError::Usage("proof <txid>")));
        assert_eq!(parse("quit"), Ok(Command::Exit));
        assert_eq!(parse(""), Err(CommandError::Empty));
        assert_eq!(parse("fly"), Err(CommandError::Unknown("fly".into())));
        assert_eq!(parse("gossip"), Err(CommandError::Usage("gossip <text>")));
    }

    #[tokio::test]
    async fn test_execute_views() {
        let node = test_node().await;

        let out = execute(&node, Command::Validate).await.unwrap();
        assert!(out.contains("valid"));

        let out = execute(&node, Command::Balance(None)).await.unwrap();
        assert!(out.contains(node.id()));
        assert!(out.contains("0.00000000"));

        let out = execute(&node, Command::Chain(3)).await.unwrap();
        assert!(out.contains("#0"));

        let out = execute(&node, Command::Help).await.unwrap();
        assert!(out.contains("validate-block"));
    }

    #[tokio::test]
    async fn test_execute_proof_of_mined_coinbase() {
        let node = test_node().await;
        let block = node.mine(&[]).await.unwrap();
        let coinbase = block.transactions[0].id.clone();

        let out = execute(&node, Command::Proof(coinbase)).await.unwrap();
        assert!(out.contains(&block.hash));
        assert!(out.contains("Verified: ✅"));

        assert!(execute(&node, Command::Proof("nope".into())).await.is_err());
    }

    #[tokio::test]
    async fn test_execute_surfaces_errors() {
        let node = test_node().await;

        assert!(execute(&node, Command::Sync).await.is_err());
        assert!(execute(&node, Command::ValidateBlock("nope".into())).await.is_err());
        assert!(execute(&node, Command::Gossip("hi".into())).await.is_err());
    }
}
