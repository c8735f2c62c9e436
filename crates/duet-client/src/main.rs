//! Duet CLI
//!
//! Line-oriented chat client. Incoming messages print to stdout in
//! conversation order; logs go to stderr.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use duet_core::config::{default_database_path, load_config};
use duet_core::message::{BROADCAST_RECEIVER, ChatMessage, MessageStatus};
use duet_core::store::{MessageStore, NullStore, SqliteMessageStore};
use duet_core::tracing_init::init_tracing;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use duet_client::input::Input;
use duet_client::{ChatClient, DeliveryUpdate};

#[derive(Parser, Debug)]
#[command(name = "duet")]
#[command(version, about = "Duet chat client")]
struct Args {
    /// Relay address (host:port).
    #[arg(long, env = "DUET_SERVER")]
    server: Option<String>,

    /// Username to log in as.
    #[arg(long, env = "DUET_USER")]
    user: Option<String>,

    /// Message database path.
    #[arg(long, env = "DUET_DB")]
    db: Option<PathBuf>,

    /// Node component of generated message IDs (1-1023).
    #[arg(long, env = "DUET_NODE_ID")]
    node_id: Option<u16>,

    /// Path to a JSON settings file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output logs as JSON.
    #[arg(long)]
    log_json: bool,
}

fn show(message: &ChatMessage) {
    let time = message.timestamp.with_timezone(&chrono::Local).format("%H:%M:%S");
    let mut out = std::io::stdout().lock();
    let _ = if message.is_broadcast() {
        writeln!(out, "[{time}] {} (all): {}", message.sender, message.content)
    } else {
        writeln!(out, "[{time}] {}: {}", message.sender, message.content)
    };
}

#[allow(clippy::print_stdout)]
fn show_line(line: &str) {
    println!("{line}");
}

async fn open_store(config: &duet_core::Config) -> Arc<dyn MessageStore> {
    let Some(path) = config
        .client
        .database_path
        .clone()
        .or_else(default_database_path)
    else {
        warn!("No data directory, history disabled");
        return Arc::new(NullStore);
    };
    match SqliteMessageStore::open(&path, &config.pool).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Message store unavailable, history disabled");
            Arc::new(NullStore)
        }
    }
}

fn report_delivery(mut updates: tokio::sync::broadcast::Receiver<DeliveryUpdate>) {
    tokio::spawn(async move {
        while let Ok(update) = updates.recv().await {
            if update.status == MessageStatus::Failed {
                show_line(&format!(
                    "! message {} could not be delivered after {} retries",
                    update.message_id, update.retries
                ));
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("duet=warn,duet_client=warn", args.log_json);

    let mut config = load_config(args.config.as_deref())?;
    if let Some(server) = args.server {
        config.client.server_addr = server;
    }
    if let Some(user) = args.user {
        config.client.username = Some(user);
    }
    if let Some(db) = args.db {
        config.client.database_path = Some(db);
    }
    if let Some(node_id) = args.node_id {
        config.client.node_id = Some(node_id);
    }
    config.validate()?;

    let store = open_store(&config).await;
    let client = ChatClient::start(config, store, Arc::new(|m: ChatMessage| show(&m)))?;
    info!(version = env!("CARGO_PKG_VERSION"), user = client.username(), "Starting duet");

    if let Err(e) = client.wait_connected(Duration::from_secs(60)).await {
        client.shutdown().await;
        return Err(e.into());
    }
    show_line(&format!(
        "connected as {}. @peer text, /peer name, /users, /history, /quit",
        client.username()
    ));
    report_delivery(client.subscribe_delivery());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        match Input::parse(&line) {
            Ok(Input::Empty) => {}
            Ok(Input::Quit) => break,
            Ok(Input::Users) => show_line(&format!("online: {}", client.online_users().join(", "))),
            Ok(Input::SwitchPeer(peer)) => {
                client.set_current_peer(&peer);
                let history = client.load_conversation(&peer).await;
                for message in history.iter().take(20).rev() {
                    show(message);
                }
                show_line(&format!("now talking to {peer}"));
            }
            Ok(Input::History) => match client.current_peer() {
                Some(peer) => {
                    let history = client.load_conversation(&peer).await;
                    for message in history.iter().rev() {
                        show(message);
                    }
                }
                None => show_line("no current peer, use /peer name"),
            },
            Ok(Input::Send { to, text }) => {
                if let Err(e) = client.submit(&to, &text).await {
                    show_line(&format!("! {e}"));
                }
            }
            Ok(Input::Text(text)) => {
                let to = client
                    .current_peer()
                    .unwrap_or_else(|| BROADCAST_RECEIVER.to_owned());
                if let Err(e) = client.submit(&to, &text).await {
                    show_line(&format!("! {e}"));
                }
            }
            Err(usage) => show_line(usage),
        }
    }

    client.shutdown().await;
    Ok(())
}
