use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crisscross_dht::{ClusterKeys, ClusterKeysFile, Dht, MemoryStore, NodeId, Timers};

#[derive(Clone, Debug)]
struct BootstrapPeer {
    id: NodeId,
    addr: SocketAddr,
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (id_part, addr_part) = s
            .split_once('@')
            .context("bootstrap peer must be NODE_ID@IP:PORT (Base58 node id)")?;
        let id: NodeId = id_part.parse().context("invalid Base58 node id")?;
        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;
        Ok(BootstrapPeer { id, addr })
    }
}

#[derive(Parser, Debug)]
#[command(name = "crisscross-dht")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:4471")]
    bind: SocketAddr,

    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<BootstrapPeer>,

    /// Base58 cluster id. Omit together with --secret to generate a fresh
    /// cluster and print its credentials.
    #[arg(long, requires = "secret")]
    cluster: Option<String>,

    /// Base58 32-byte cluster secret.
    #[arg(long, requires = "cluster")]
    secret: Option<String>,

    /// Base58 cluster write public key (write-gated clusters).
    #[arg(long)]
    public_key: Option<String>,

    /// Base58 cluster write private key.
    #[arg(long)]
    private_key: Option<String>,

    #[arg(short, long, default_value = "300")]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let keys = match (&args.cluster, &args.secret) {
        (Some(cluster), Some(secret)) => {
            let file = ClusterKeysFile {
                secret: secret.clone(),
                public_key: args.public_key.clone(),
                private_key: args.private_key.clone(),
            };
            ClusterKeys::from_file(cluster, &file).context("cluster credentials")?
        }
        _ => {
            let keys = ClusterKeys::generate();
            info!(
                cluster = %keys.id,
                secret = %bs58::encode(keys.secret).into_string(),
                "generated a fresh cluster; pass these to other nodes"
            );
            keys
        }
    };

    let dht = Dht::bind(
        args.bind,
        None,
        keys,
        Arc::new(MemoryStore::new()),
        Timers::default(),
    )
    .await?;
    info!(id = %dht.id(), addr = %dht.local_addr()?, "node identity");

    if !args.bootstrap.is_empty() {
        let peers: Vec<(NodeId, SocketAddr)> =
            args.bootstrap.iter().map(|p| (p.id, p.addr)).collect();
        let known = dht.bootstrap(&peers).await;
        if known == 0 {
            warn!("bootstrap reached no peers");
        } else {
            info!(peers = known, "bootstrap complete");
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.stats_interval));
    interval.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            _ = interval.tick() => {
                let stats = dht.stats().await;
                info!(peers = stats.peers, buckets = stats.buckets, "routing table");
            }
        }
    }

    dht.shutdown().await;
    Ok(())
}
