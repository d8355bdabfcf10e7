use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rand::RngCore;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use mycel::{Dht, DhtConfig, Multiaddr, Peer, PeerId};

#[derive(Parser, Debug)]
#[command(name = "mycel")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Multiaddr to listen on.
    #[arg(short, long, default_value = "/ip4/0.0.0.0/tcp/4001")]
    bind: String,

    /// Bootstrap peer multiaddrs to connect to at startup.
    #[arg(short = 'B', long = "bootstrap", value_name = "MULTIADDR")]
    bootstrap: Vec<String>,

    /// Seconds between status log lines.
    #[arg(short, long, default_value = "300")]
    status_interval: u64,
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

    let bind: Multiaddr = args.bind.parse().context("invalid bind multiaddr")?;

    // Stand-in identity: the ambient system derives peer ids from public
    // keys; the engine only needs opaque unique bytes.
    let mut id_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut id_bytes);
    let peer = Arc::new(Peer::new(PeerId::from_bytes(id_bytes.to_vec()), vec![bind]));

    let dht = Dht::new(peer, DhtConfig::default()).await?;
    dht.start();
    info!("node identity: {}", hex::encode(&id_bytes));

    for addr_str in &args.bootstrap {
        let addr: Multiaddr = match addr_str.parse() {
            Ok(a) => a,
            Err(e) => {
                warn!(addr = %addr_str, error = %e, "skipping invalid bootstrap address");
                continue;
            }
        };
        info!(addr = %addr, "bootstrapping");
        match dht.connect(&addr).await {
            Ok(peer) => info!(peer = %peer.id(), "bootstrap complete"),
            Err(e) => warn!(addr = %addr, error = %e, "bootstrap failed"),
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.status_interval));
    interval.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                info!(
                    peers = dht.table_size(),
                    "status"
                );
            }
        }
    }

    dht.halt();
    Ok(())
}
