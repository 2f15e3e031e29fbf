//! arbor — the full-node binary.
//!
//! Startup sequence:
//!   1. Load (or default) the JSON node config
//!   2. Load or create the wallet (account + consensus keys)
//!   3. Open storage and run pending migrations
//!   4. Wire the engines and spawn their threads
//!   5. Start the gossip transport and dispatch inbound packets

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use arbor_core::config::{ChainId, NodeConfig};
use arbor_core::error::ArborError;
use arbor_crypto::KeyPair;
use arbor_net::{GossipHandlers, GossipOutbound, NetConfig, NetMessage, Network, PeerTable, PriorityThreadPool};

use arbor_node::Node;

/// Workers dedicated to inbound packet dispatch.
const NET_DISPATCH_WORKERS: usize = 6;

#[derive(Parser, Debug)]
#[command(name = "arbor", version, about = "Arbor node — DAG-ordered, PBFT-finalized chain")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a full node.
    Node {
        /// Path to the JSON config file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Path to the wallet file (created when missing).
        #[arg(long)]
        wallet: Option<PathBuf>,

        /// Directory for persistent state.
        #[arg(long, default_value = "~/.arbor/data")]
        data_dir: PathBuf,

        /// Serve peers without proposing blocks.
        #[arg(long)]
        boot_node: bool,

        /// Which chain to join.
        #[arg(long, default_value = "devnet")]
        chain: ChainId,
    },

    /// Manage the account (transaction) key.
    Account {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// Manage the consensus lottery key.
    Vrf {
        #[command(subcommand)]
        action: KeyAction,
    },
}

#[derive(Subcommand, Debug)]
enum KeyAction {
    /// Generate a fresh key and print it.
    New,
    /// Derive the address of an existing secret key.
    Show {
        #[arg(long)]
        key: String,
    },
}

/// On-disk wallet: the account key signs transactions, the consensus key
/// signs votes, DAG blocks and lottery proofs.
#[derive(Serialize, Deserialize)]
struct Wallet {
    account_secret: String,
    consensus_secret: String,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            if matches!(e.downcast_ref::<ArborError>(), Some(ArborError::Config(_))) {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Node {
            config,
            wallet,
            data_dir,
            boot_node,
            chain,
        } => run_node(config, wallet, data_dir, boot_node, chain),
        Command::Account { action } | Command::Vrf { action } => run_key_action(action),
    }
}

fn run_key_action(action: KeyAction) -> anyhow::Result<()> {
    match action {
        KeyAction::New => {
            let kp = KeyPair::generate();
            println!("address: {}", kp.address);
            println!("secret:  {}", kp.secret_hex());
        }
        KeyAction::Show { key } => {
            let kp = KeyPair::from_secret_hex(&key)?;
            println!("address: {}", kp.address);
        }
    }
    Ok(())
}

fn run_node(
    config_path: Option<PathBuf>,
    wallet_path: Option<PathBuf>,
    data_dir: PathBuf,
    boot_node: bool,
    chain: ChainId,
) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,arbor=debug".parse().unwrap()),
        )
        .init();

    // ── Configuration ─────────────────────────────────────────────────────────
    let config = match &config_path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .map_err(|e| ArborError::Config(format!("reading {}: {e}", path.display())))?;
            NodeConfig::parse_json(&json)?
        }
        None => NodeConfig::for_chain(chain),
    };

    let data_dir = expand_tilde(&data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;

    // ── Wallet ────────────────────────────────────────────────────────────────
    let wallet_path = wallet_path.unwrap_or_else(|| data_dir.join("wallet.json"));
    let wallet = load_or_create_wallet(&wallet_path)?;
    let consensus_key = KeyPair::from_secret_hex(&wallet.consensus_secret)?;
    info!(address = %consensus_key.address, "consensus identity");

    // ── Transport ─────────────────────────────────────────────────────────────
    let net_config = NetConfig::from_node_config(&config.network, config.chain);
    let sync_level_size = net_config.sync_level_size;

    let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
    let _guard = runtime.enter();

    let (network, mut handle) =
        Network::new(&net_config).map_err(|e| anyhow::anyhow!("building network: {e}"))?;
    info!(peer_id = %handle.local_peer_id, "network identity");
    // One peer table shared by the inbound handlers and the outbound filter.
    let peers = Arc::new(PeerTable::new());
    let outbound = GossipOutbound::new(handle.outbound_tx.clone(), Arc::clone(&peers));

    // ── Node wiring ───────────────────────────────────────────────────────────
    let mut node = Node::build(config, &data_dir, consensus_key, outbound)?;
    node.start(!boot_node);

    let handlers = Arc::new(GossipHandlers::new(
        node.dag.genesis_hash(),
        Arc::clone(&node.dag),
        Arc::clone(&node.pool),
        Arc::clone(&node.recently_finalized),
        Arc::clone(&node.pbft),
        Arc::clone(&node.storage),
        peers,
        Arc::clone(&node.syncing),
        sync_level_size,
    ));

    // ── Packet dispatch ───────────────────────────────────────────────────────
    let pool = PriorityThreadPool::new(NET_DISPATCH_WORKERS);
    let outbound_tx = handle.outbound_tx.clone();

    runtime.spawn(network.run());

    // Periodic peer status.
    let status_tx = handle.outbound_tx.clone();
    let status_pbft = Arc::clone(&node.pbft);
    let status_syncing = Arc::clone(&node.syncing);
    let status_genesis = node.dag.genesis_hash();
    runtime.spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            let msg = NetMessage::Status {
                genesis: status_genesis,
                period: status_pbft.period(),
                round: status_pbft.round(),
                syncing: status_syncing.load(Ordering::Acquire),
            };
            if status_tx.send(msg).await.is_err() {
                return;
            }
        }
    });

    info!("node ready");
    runtime.block_on(async {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    break;
                }
                inbound = handle.inbound_rx.recv() => {
                    let Some((peer, msg)) = inbound else { break };
                    let handlers = Arc::clone(&handlers);
                    let outbound_tx = outbound_tx.clone();
                    let priority = msg.priority();
                    let accepted = pool.post(priority, move || {
                        match handlers.handle(&peer, msg) {
                            Ok(replies) => {
                                for reply in replies {
                                    let _ = outbound_tx.try_send(reply);
                                }
                            }
                            Err(e) => {
                                warn!(peer = %peer, error = %e, "malformed peer input");
                                handlers.disconnect(&peer);
                            }
                        }
                    });
                    if !accepted {
                        warn!("packet dispatch queue saturated, dropping packet");
                    }
                }
            }
        }
    });

    node.stop();
    pool.shutdown();
    Ok(())
}

fn load_or_create_wallet(path: &Path) -> anyhow::Result<Wallet> {
    if path.exists() {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading wallet {}", path.display()))?;
        return serde_json::from_str(&json).context("parsing wallet file");
    }
    warn!(path = %path.display(), "no wallet found, generating one");
    let wallet = Wallet {
        account_secret: KeyPair::generate().secret_hex(),
        consensus_secret: KeyPair::generate().secret_hex(),
    };
    let json = serde_json::to_string_pretty(&wallet).context("encoding wallet")?;
    std::fs::write(path, json).with_context(|| format!("writing wallet {}", path.display()))?;
    Ok(wallet)
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}
