//! Duet Relay Server
//!
//! Line-protocol relay that authenticates usernames, tracks presence,
//! and routes broadcast and private messages between connected clients.

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use duet_core::config::load_config;
use duet_core::tracing_init::init_tracing;
use duet_relay::RelayServer;

#[derive(Parser, Debug)]
#[command(name = "duet-relay")]
#[command(version, about = "Duet relay server - presence and message routing")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "DUET_RELAY_BIND")]
    addr: Option<String>,

    /// Path to a JSON settings file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seconds of silence before a connection is dropped.
    #[arg(long)]
    heartbeat_timeout: Option<u64>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("duet_relay=info", args.log_json);

    let mut config = load_config(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.relay.bind_addr = addr;
    }
    if let Some(secs) = args.heartbeat_timeout {
        config.relay.heartbeat_timeout_secs = secs;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.relay.bind_addr,
        "Starting duet-relay"
    );

    let server = RelayServer::bind(config.relay).await?;
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal.cancel();
        }
    });

    server.run(shutdown).await?;
    Ok(())
}
