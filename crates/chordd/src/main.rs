//! `chordd`: the chordstore daemon.
//!
//! Runs one member of a Chord ring, and doubles as a small client for
//! poking at running members.
//!
//! # Usage
//!
//! ```text
//! chordd start                                   # start a new ring
//! chordd start -c chordd.toml                    # start with a config file
//! chordd start -l 127.0.0.1:4871 -b 127.0.0.1:4870  # join through a member
//! chordd status 127.0.0.1:4870                   # show a node's view
//! chordd put 127.0.0.1:4870 greeting hello       # store a value
//! chordd get 127.0.0.1:4870 greeting             # read it back
//! ```

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chord_engine::{ChordNode, NodeStatus, default_max_lookup_hops};
use chord_net::{ChordMessage, TcpTransport};
use chord_store::{BlockDevice, FileDevice, MemoryDevice};
use chord_types::NodeId;
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use config::CliConfig;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "chordd", version, about = "chordstore Chord ring daemon")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a ring member.
    Start {
        /// Override the listen address (e.g. "127.0.0.1:4871").
        #[arg(short, long)]
        listen_addr: Option<String>,

        /// Member to join through. Starts a new ring when absent.
        #[arg(short, long, env = "CHORDD_BOOTSTRAP")]
        bootstrap: Option<String>,

        /// Override the ring id (0-255) instead of hashing the address.
        #[arg(long)]
        id: Option<u32>,

        /// Override data directory (useful for running multiple instances).
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Keep the block device in memory.
        #[arg(short, long)]
        memory: bool,
    },

    /// Show a node's neighbours and subtree stats.
    Status {
        /// Node to ask.
        addr: SocketAddr,
    },

    /// Store a value, starting at the given node.
    Put {
        /// Node to start at.
        addr: SocketAddr,
        key: String,
        value: String,
    },

    /// Read a value, starting at the given node.
    Get {
        /// Node to start at.
        addr: SocketAddr,
        key: String,
    },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    setup_tracing(&config.log.level);

    match cli.command {
        Commands::Start {
            listen_addr,
            bootstrap,
            id,
            data_dir,
            memory,
        } => {
            // CLI args override config file values.
            if let Some(addr) = listen_addr {
                config.node.listen_addr = addr;
            }
            if bootstrap.is_some() {
                config.ring.bootstrap = bootstrap;
            }
            if id.is_some() {
                config.node.id = id;
            }
            if let Some(dir) = data_dir {
                config.node.data_dir = dir;
            }
            if memory {
                config.storage.backend = "memory".to_string();
            }
            cmd_start(config).await
        }
        Commands::Status { addr } => cmd_status(&config, addr).await,
        Commands::Put { addr, key, value } => cmd_put(&config, addr, &key, &value).await,
        Commands::Get { addr, key } => cmd_get(&config, addr, &key).await,
    }
}

/// Initialize the `tracing` subscriber with the given level filter.
///
/// Respects `RUST_LOG` env var if set, otherwise uses the config value.
fn setup_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// -----------------------------------------------------------------------
// chordd start
// -----------------------------------------------------------------------

async fn cmd_start(config: CliConfig) -> Result<()> {
    let node = start_node(&config).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!(local = %node.local(), "shutting down");

    if let Err(e) = node.leave().await {
        warn!("graceful leave failed: {e}");
    }
    Ok(())
}

/// Open the device, bind the listener, join the ring and start maintenance.
async fn start_node(config: &CliConfig) -> Result<Arc<ChordNode>> {
    let listen: SocketAddr = config
        .node
        .listen_addr
        .parse()
        .context("invalid listen address (expected host:port)")?;
    let bootstrap: Option<SocketAddr> = config
        .ring
        .bootstrap
        .as_deref()
        .map(str::parse::<SocketAddr>)
        .transpose()
        .context("invalid bootstrap address (expected host:port)")?;

    let blocks = config.storage.block_count;
    let device: Arc<dyn BlockDevice> = match config.storage.backend.as_str() {
        "memory" => {
            info!(blocks, "using in-memory block device");
            Arc::new(MemoryDevice::new(blocks))
        }
        _ => {
            std::fs::create_dir_all(&config.node.data_dir)
                .context("failed to create data directory")?;
            let path = config.device_path();
            info!(path = %path.display(), blocks, "using file block device");
            Arc::new(
                FileDevice::open(&path, blocks)
                    .await
                    .context("failed to open block device")?,
            )
        }
    };

    let engine_config = config.engine_config();
    info!(
        %listen,
        stabilize = ?engine_config.stabilize_interval,
        sync = ?engine_config.sync_interval,
        timeout = ?engine_config.request_timeout,
        "node configuration"
    );

    let node = ChordNode::bind(listen, config.node.id.map(NodeId::new), engine_config, device)
        .await
        .context("failed to bind listener")?;
    info!(local = %node.local(), "listening");

    node.join(bootstrap).await.context("failed to join ring")?;
    node.start();

    info!(
        "to join this ring: chordd start --bootstrap {}",
        node.local().addr
    );
    Ok(node)
}

// -----------------------------------------------------------------------
// Client commands
// -----------------------------------------------------------------------

async fn cmd_status(config: &CliConfig, addr: SocketAddr) -> Result<()> {
    let transport = TcpTransport::new(config.engine_config().request_timeout);
    let status = fetch_status(&transport, addr).await?;

    println!("node:        {}", status.node);
    match status.predecessor {
        Some(pred) => println!("predecessor: {pred}"),
        None => println!("predecessor: (none)"),
    }
    println!("successor:   {}", status.successor);
    println!("subtree:     {} nodes", status.stats.node_count);
    println!(
        "storage:     {} bytes used, {} bytes available",
        status.stats.bytes_used, status.stats.bytes_available
    );
    Ok(())
}

async fn cmd_put(config: &CliConfig, addr: SocketAddr, key: &str, value: &str) -> Result<()> {
    let transport = TcpTransport::new(config.engine_config().request_timeout);
    let owner = put_value(&transport, addr, key.as_bytes(), value.as_bytes()).await?;
    println!(
        "stored {key} (id {}) on {owner}",
        NodeId::from_data(key.as_bytes())
    );
    Ok(())
}

async fn cmd_get(config: &CliConfig, addr: SocketAddr, key: &str) -> Result<()> {
    let transport = TcpTransport::new(config.engine_config().request_timeout);
    match get_value(&transport, addr, key.as_bytes()).await? {
        Some(value) => println!("{}", String::from_utf8_lossy(&value)),
        None => bail!("key {key} not found"),
    }
    Ok(())
}

async fn fetch_status(transport: &TcpTransport, addr: SocketAddr) -> Result<NodeStatus> {
    let reply = transport
        .request(addr, &ChordMessage::GetStats)
        .await
        .with_context(|| format!("no answer from {addr}"))?;
    match reply {
        ChordMessage::GetStatsResp {
            node,
            predecessor,
            successor,
            stats,
        } => Ok(NodeStatus {
            node,
            predecessor,
            successor,
            stats,
        }),
        other => bail!("unexpected {} in response to GET_STATS", other.kind()),
    }
}

/// Send `request` to `start` and keep following `REDIRECT` answers.
/// Returns the node that answered and its reply.
async fn follow_redirects(
    transport: &TcpTransport,
    start: SocketAddr,
    request: &ChordMessage,
) -> Result<(SocketAddr, ChordMessage)> {
    let mut target = start;
    for _ in 0..default_max_lookup_hops() {
        let reply = transport
            .request(target, request)
            .await
            .with_context(|| format!("no answer from {target}"))?;
        match reply {
            ChordMessage::Redirect { next, .. } => {
                debug!(from = %target, to = %next, "redirected");
                target = next.addr;
            }
            other => return Ok((target, other)),
        }
    }
    bail!("gave up after {} redirects", default_max_lookup_hops())
}

async fn put_value(
    transport: &TcpTransport,
    start: SocketAddr,
    key: &[u8],
    value: &[u8],
) -> Result<SocketAddr> {
    let key_id = NodeId::from_data(key);
    let request = ChordMessage::Put {
        key_id,
        data: value.to_vec(),
    };
    match follow_redirects(transport, start, &request).await? {
        (owner, ChordMessage::PutAck { ok: true, .. }) => Ok(owner),
        (owner, ChordMessage::PutAck { ok: false, .. }) => {
            bail!("{owner} has no space left for key {key_id}")
        }
        (_, other) => bail!("unexpected {} in response to PUT", other.kind()),
    }
}

async fn get_value(
    transport: &TcpTransport,
    start: SocketAddr,
    key: &[u8],
) -> Result<Option<Vec<u8>>> {
    let request = ChordMessage::Get {
        key_id: NodeId::from_data(key),
    };
    match follow_redirects(transport, start, &request).await? {
        (_, ChordMessage::GetResp { data, .. }) => Ok(Some(data)),
        (_, ChordMessage::GetEfail { .. }) => Ok(None),
        (_, other) => bail!("unexpected {} in response to GET", other.kind()),
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
