//! Shario CLI
//!
//! Thin interactive shell around the node core: starts a node, prints chat
//! and transfer activity, and turns stdin lines into commands. All protocol
//! logic lives in `shario-core`.

mod progress;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;
use progress::{format_bytes, TransferProgress};
use shario_core::room::GLOBAL_ROOM_ID;
use shario_core::{Node, NodeConfig};
use shario_crypto::NodeId;
use shario_transport::PeerAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Shario - decentralized peer-to-peer file sharing and chat
#[derive(Parser)]
#[command(name = "shario")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration directory (defaults to the per-user location)
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Downloads directory (defaults to ~/Downloads/Shario)
    #[arg(long)]
    downloads_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node interactively
    Run {
        /// Nickname to use on the network
        #[arg(short, long)]
        nickname: Option<String>,

        /// Disable link-local multicast discovery
        #[arg(long)]
        no_multicast: bool,

        /// Disable DHT discovery
        #[arg(long)]
        no_dht: bool,

        /// DHT bootstrap nodes (host:port)
        #[arg(long)]
        bootstrap: Vec<String>,

        /// Peers to dial immediately (ip:port/node_id)
        #[arg(long)]
        dial: Vec<String>,

        /// Reject inbound file offers instead of auto-accepting
        #[arg(long)]
        reject_offers: bool,
    },

    /// Print the local node identifier and exit
    Whoami,

    /// Export the identity (private key included) to stdout or a file
    ExportIdentity {
        /// Output file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let mut config = NodeConfig {
        config_dir: cli.config_dir,
        downloads_dir: cli.downloads_dir,
        ..NodeConfig::default()
    };

    match cli.command {
        Commands::Run {
            nickname,
            no_multicast,
            no_dht,
            bootstrap,
            dial,
            reject_offers,
        } => {
            config.discovery.enable_multicast = !no_multicast;
            config.discovery.enable_dht = !no_dht;
            for addr in bootstrap {
                let addr = addr
                    .parse()
                    .with_context(|| format!("invalid bootstrap address '{addr}'"))?;
                config.discovery.bootstrap.push(addr);
            }
            let dial: Vec<PeerAddr> = dial
                .iter()
                .map(|s| s.parse().map_err(anyhow::Error::msg))
                .collect::<anyhow::Result<_>>()?;

            run(config, nickname, dial, reject_offers).await
        }
        Commands::Whoami => {
            let node = Node::new(config).await?;
            println!("{}", node.node_id());
            Ok(())
        }
        Commands::ExportIdentity { output } => {
            let node = Node::new(config).await?;
            let bytes = node.export_identity()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, bytes)
                        .with_context(|| format!("cannot write {}", path.display()))?;
                    eprintln!("identity written to {}", path.display());
                }
                None => println!("{}", String::from_utf8_lossy(&bytes)),
            }
            Ok(())
        }
    }
}

async fn run(
    config: NodeConfig,
    nickname: Option<String>,
    dial: Vec<PeerAddr>,
    reject_offers: bool,
) -> anyhow::Result<()> {
    let node = Node::new(config).await?;

    if let Some(nickname) = nickname {
        node.set_nickname(&nickname).await?;
    }

    if reject_offers {
        node.set_offer_handler(Arc::new(|_| false));
    } else {
        node.set_offer_handler(Arc::new(|transfer| {
            eprintln!(
                "{} {} ({}) from {}",
                style("accepting").green(),
                transfer.filename,
                format_bytes(transfer.size),
                transfer.peer.short()
            );
            true
        }));
    }

    let addrs = node.start().await?;
    println!("{} {}", style("node").bold(), node.node_id());
    for addr in &addrs {
        println!("{} {}", style("listening").dim(), addr);
    }

    for target in dial {
        if let Err(e) = node.dial(&target).await {
            eprintln!("{} {target}: {e}", style("dial failed").red());
        }
    }

    spawn_message_printer(&node);
    spawn_transfer_printer(&node);

    println!(
        "{}",
        style("commands: /nick <name>, /peers, /send <peer> <file>, /transfers, /cancel <id>, /quit")
            .dim()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" {
                    break;
                }
                if let Err(e) = handle_command(&node, line).await {
                    eprintln!("{} {e:#}", style("error:").red());
                }
            }
        }
    }

    node.stop().await;
    Ok(())
}

fn spawn_message_printer(node: &Node) {
    use tokio::sync::broadcast::error::RecvError;

    let mut messages = node.subscribe_messages();
    let local = node.node_id();
    tokio::spawn(async move {
        loop {
            match messages.recv().await {
                Ok(message) => {
                    if message.sender_id == local && message.room_id == GLOBAL_ROOM_ID {
                        continue; // our own lines are already on screen
                    }
                    println!(
                        "[{}] {}: {}",
                        style(&message.room_id).dim(),
                        style(&message.sender).cyan(),
                        message.content
                    );
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn spawn_transfer_printer(node: &Node) {
    use tokio::sync::broadcast::error::RecvError;

    let mut updates = node.subscribe_transfers();
    tokio::spawn(async move {
        let mut progress = TransferProgress::new();
        loop {
            match updates.recv().await {
                Ok(transfer) => progress.update(&transfer),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn handle_command(node: &Node, line: &str) -> anyhow::Result<()> {
    if let Some(rest) = line.strip_prefix("/nick ") {
        node.set_nickname(rest).await?;
        println!("nickname is now {}", style(node.nickname()).cyan());
        return Ok(());
    }

    if line == "/peers" {
        let peers = node.peers().await;
        if peers.is_empty() {
            println!("no peers connected");
        }
        for peer in peers {
            println!(
                "{}  {}  via {:?}",
                peer.node_id,
                style(&peer.nickname).cyan(),
                peer.addrs
            );
        }
        return Ok(());
    }

    if let Some(rest) = line.strip_prefix("/send ") {
        let (peer, path) = rest
            .split_once(' ')
            .context("usage: /send <peer-id-prefix> <file>")?;
        let peer = resolve_peer(node, peer).await?;
        let id = node.send_file(peer, PathBuf::from(path)).await?;
        println!("transfer {} started", style(id.short()).cyan());
        return Ok(());
    }

    if line == "/transfers" {
        for transfer in node.transfers().await {
            println!(
                "{}  {}  {:?}  {}%",
                transfer.id.short(),
                transfer.filename,
                transfer.status,
                transfer.progress()
            );
        }
        return Ok(());
    }

    if let Some(rest) = line.strip_prefix("/cancel ") {
        let prefix = rest.trim();
        let transfer = node
            .transfers()
            .await
            .into_iter()
            .find(|t| t.id.to_string().starts_with(prefix))
            .context("no transfer with that id")?;
        node.cancel_transfer(transfer.id).await?;
        println!("transfer {} cancelled", transfer.id.short());
        return Ok(());
    }

    // Anything else is chat for the global room.
    node.send_text(GLOBAL_ROOM_ID, line).await?;
    println!(
        "[{}] {}: {}",
        style(GLOBAL_ROOM_ID).dim(),
        style(node.nickname()).cyan(),
        line
    );
    Ok(())
}

/// Match a peer by identifier prefix or nickname.
async fn resolve_peer(node: &Node, needle: &str) -> anyhow::Result<NodeId> {
    let peers = node.peers().await;
    peers
        .iter()
        .find(|p| p.node_id.to_hex().starts_with(needle) || p.nickname == needle)
        .map(|p| p.node_id)
        .with_context(|| format!("no connected peer matches '{needle}'"))
}
