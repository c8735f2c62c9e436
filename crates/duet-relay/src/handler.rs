//! Per-connection protocol handler.
//!
//! Each accepted socket runs `CONNECTED → AUTHENTICATING → AUTHENTICATED →
//! DISCONNECTED`. Reads happen here; writes go through a per-connection
//! writer task fed by a bounded channel, so the dispatcher never touches
//! the socket directly.

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use duet_core::config::RelayConfig;
use duet_core::protocol::{Command, ServerMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::registry::{ClientConnection, ConnectionRegistry};

/// How long a closing connection gets to flush queued lines.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Services shared by every connection handler.
pub struct RelayContext {
    pub registry: ConnectionRegistry,
    pub dispatcher: Dispatcher,
    pub config: RelayConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Authenticating,
    Authenticated,
    Disconnected,
}

type LineReader = Lines<BufReader<OwnedReadHalf>>;

enum Event {
    Shutdown,
    Evicted,
    Read(std::io::Result<Option<String>>),
}

struct Session<'a> {
    addr: SocketAddr,
    state: ConnectionState,
    lines: LineReader,
    out_tx: mpsc::Sender<String>,
    ctx: &'a RelayContext,
}

impl Session<'_> {
    fn transition(&mut self, next: ConnectionState) {
        debug!(addr = %self.addr, from = ?self.state, to = ?next, "Connection state");
        self.state = next;
    }

    async fn reply(&self, message: ServerMessage) -> bool {
        self.out_tx
            .send_timeout(message.encode(), self.ctx.config.fanout_timeout())
            .await
            .is_ok()
    }

    /// Wait for `LOGIN:<name>` and register it.
    async fn authenticate(
        &mut self,
        conn_cancel: CancellationToken,
        shutdown: &CancellationToken,
    ) -> Option<Arc<ClientConnection>> {
        self.transition(ConnectionState::Authenticating);

        let first = tokio::select! {
            () = shutdown.cancelled() => return None,
            read = tokio::time::timeout(self.ctx.config.login_timeout(), self.lines.next_line()) => read,
        };
        let line = match first {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => return None,
            Ok(Err(e)) => {
                debug!(addr = %self.addr, error = %e, "Read failed before login");
                return None;
            }
            Err(_) => {
                info!(addr = %self.addr, "Login timed out");
                self.reply(ServerMessage::error("login timeout")).await;
                return None;
            }
        };

        let Ok(Command::Login(username)) = Command::parse(&line) else {
            self.reply(ServerMessage::error("login required")).await;
            return None;
        };

        match self
            .ctx
            .registry
            .register(&username, self.addr, self.out_tx.clone(), conn_cancel)
        {
            Ok(conn) => {
                conn.touch();
                self.reply(ServerMessage::LoginSuccess).await;
                Some(conn)
            }
            Err(e) => {
                self.reply(ServerMessage::error(e.to_string())).await;
                None
            }
        }
    }

    /// Read commands until EOF, logout, eviction, or shutdown.
    async fn route(&mut self, conn: &ClientConnection, shutdown: &CancellationToken) {
        self.transition(ConnectionState::Authenticated);
        loop {
            let event = tokio::select! {
                () = shutdown.cancelled() => Event::Shutdown,
                () = conn.closed() => Event::Evicted,
                line = self.lines.next_line() => Event::Read(line),
            };
            match event {
                Event::Shutdown => {
                    self.reply(ServerMessage::error("server shutting down")).await;
                    break;
                }
                Event::Evicted => {
                    debug!(username = %conn.username, "Connection closed by relay");
                    break;
                }
                Event::Read(Ok(Some(line))) => {
                    if self.handle_line(conn, &line).await.is_break() {
                        break;
                    }
                }
                Event::Read(Ok(None)) => {
                    debug!(username = %conn.username, "Client disconnected");
                    break;
                }
                Event::Read(Err(e)) => {
                    debug!(username = %conn.username, error = %e, "Read failed");
                    break;
                }
            }
        }
    }

    async fn handle_line(&self, conn: &ClientConnection, line: &str) -> ControlFlow<()> {
        if line.trim().is_empty() {
            return ControlFlow::Continue(());
        }
        // Any traffic proves the peer is alive.
        conn.touch();

        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(duet_core::Error::UnknownCommand(word)) => {
                debug!(username = %conn.username, %word, "Unknown command");
                self.reply(ServerMessage::error("unknown command")).await;
                return ControlFlow::Continue(());
            }
            Err(e) => {
                debug!(username = %conn.username, error = %e, "Malformed command");
                self.reply(ServerMessage::error("malformed command")).await;
                return ControlFlow::Continue(());
            }
        };

        let dispatcher = &self.ctx.dispatcher;
        match command {
            Command::Heartbeat => {
                self.reply(ServerMessage::HeartbeatAck).await;
            }
            Command::Broadcast(content) => {
                if !dispatcher.broadcast(&conn.username, &content) {
                    self.reply(ServerMessage::error("server busy")).await;
                }
            }
            Command::Private { receiver, content } => {
                if !self.ctx.registry.is_online(&receiver) {
                    debug!(sender = %conn.username, %receiver, "Private message to offline user");
                    self.reply(ServerMessage::error(format!("user {receiver} is offline")))
                        .await;
                } else if !dispatcher.private(&conn.username, &receiver, &content) {
                    self.reply(ServerMessage::error("server busy")).await;
                }
            }
            Command::GetUsers => {
                let users = self.ctx.registry.usernames_except(&conn.username);
                self.reply(ServerMessage::Users(users)).await;
            }
            Command::Logout(name) if name == conn.username => {
                info!(username = %conn.username, "Client logged out");
                return ControlFlow::Break(());
            }
            Command::Logout(_) => {
                self.reply(ServerMessage::error("cannot log out another user"))
                    .await;
            }
            Command::Login(_) => {
                self.reply(ServerMessage::error("already logged in")).await;
            }
        }
        ControlFlow::Continue(())
    }
}

/// Drive one accepted connection to completion.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<RelayContext>,
    shutdown: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel(ctx.config.outbound_buffer.max(1));
    let conn_cancel = CancellationToken::new();
    let mut writer = tokio::spawn(write_loop(write_half, out_rx, conn_cancel.clone()));

    let mut session = Session {
        addr,
        state: ConnectionState::Connected,
        lines: BufReader::new(read_half).lines(),
        out_tx,
        ctx: &ctx,
    };
    debug!(%addr, "Connection accepted");

    if let Some(conn) = session.authenticate(conn_cancel.clone(), &shutdown).await {
        ctx.dispatcher.presence();
        session.route(&conn, &shutdown).await;
        if ctx.registry.unregister(&conn.username, conn.id).is_some() {
            ctx.dispatcher.presence();
        }
    }
    session.transition(ConnectionState::Disconnected);
    drop(session);

    // The writer exits once every sender is gone and the queue is flushed.
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        conn_cancel.cancel();
        writer.abort();
    }
    debug!(%addr, "Connection finished");
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            biased;
            line = rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
            () = cancel.cancelled() => break,
        };
        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        };
        let result = tokio::select! {
            result = write => result,
            () = cancel.cancelled() => break,
        };
        if let Err(e) = result {
            warn!(error = %e, "Socket write failed");
            cancel.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
}
