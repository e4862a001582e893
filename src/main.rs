//! Heat Ledger node
//!
//! Starts a node with an interactive console, or generates an identity.

use clap::{Parser, Subcommand};
use heat_ledger::cli::{execute, Command};
use heat_ledger::core::{Amount, DEFAULT_DIFFICULTY};
use heat_ledger::crypto::KeyPair;
use heat_ledger::network::{NetworkError, Node, NodeConfig, DEFAULT_PROTOCOL_PREFIX};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "heat-ledger")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "A peer-to-peer UTXO ledger node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node and open the console
    Start {
        /// Address to accept peer streams on
        #[arg(short, long, default_value = "0.0.0.0:4001")]
        listen: String,

        /// Address announced to peers (defaults to the bound address)
        #[arg(long)]
        advertise: Option<String>,

        /// Bootstrap peers, comma-separated id@host:port
        #[arg(short, long)]
        peers: Option<String>,

        /// Mining difficulty (leading zero hex characters)
        #[arg(short, long, default_value_t = DEFAULT_DIFFICULTY)]
        difficulty: u32,

        /// Value a coinbase may mint on top of fees
        #[arg(long, default_value = "0")]
        reward: Amount,

        /// Hex private key of the node identity
        #[arg(short, long)]
        key: Option<String>,

        /// Protocol ID prefix
        #[arg(long, default_value = DEFAULT_PROTOCOL_PREFIX)]
        prefix: String,

        /// Seconds to wait for a peer's request line
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Generate a node identity
    Keygen,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen => {
            let keys = KeyPair::generate();
            println!("🔐 New node identity");
            println!("   📍 Node ID: {}", keys.address());
            println!("   🔑 Public Key: {}", keys.public_key_hex());
            println!("   🗝️  Private Key: {}", keys.private_key_hex());
            println!("\n   Start with: heat-ledger start --key <private key>");
        }

        Commands::Start {
            listen,
            advertise,
            peers,
            difficulty,
            reward,
            key,
            prefix,
            timeout,
        } => {
            let bootstrap_peers: Vec<String> = peers
                .map(|p| {
                    p.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default();

            let config = NodeConfig {
                listen_addr: listen,
                advertise_addr: advertise,
                protocol_prefix: prefix,
                difficulty,
                block_reward: reward,
                bootstrap_peers,
                private_key: key,
                read_timeout: Some(Duration::from_secs(timeout)),
            };

            run_node(config).map_err(|e| -> Box<dyn std::error::Error> { e })?;
        }
    }

    Ok(())
}

fn run_node(config: NodeConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let node = Node::new(config).await?;
        let addr = node.start().await?;
        println!("🌐 Node {} listening on {}", node.id(), addr);

        match node.bootstrap().await {
            Ok(merged) => log::info!("Start-up sync merged {} blocks", merged),
            Err(NetworkError::NoPeers) => log::info!("No peers configured, starting alone"),
            Err(e) => log::warn!("Start-up sync failed: {}", e),
        }

        println!("Type 'help' for commands.");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                line = lines.next_line() => match line? {
                    Some(line) => line,
                    None => break,
                },
            };
            if line.trim().is_empty() {
                continue;
            }

            let command: Command = match line.parse() {
                Ok(command) => command,
                Err(e) => {
                    println!("❌ {}", e);
                    continue;
                }
            };
            let exit = command == Command::Exit;
            match execute(&node, command).await {
                Ok(out) => print!("{}", out),
                Err(e) => println!("❌ {}", e),
            }
            if exit {
                break;
            }
        }

        println!("\n📴 Shutting down node...");
        node.shutdown().await;
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    })?;

    Ok(())
}
