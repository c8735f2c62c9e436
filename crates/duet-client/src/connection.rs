//! Relay connection with heartbeat, liveness and reconnect.
//!
//! One task owns the socket. It logs in, then selects over inbound lines,
//! queued outbound commands, and the heartbeat tick. When the connection
//! drops it reconnects with capped exponential backoff. A login rejection
//! is terminal.

use std::time::Duration;

use duet_core::config::ClientConfig;
use duet_core::protocol::{Command, ServerMessage};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to connect: {0}")]
    Connect(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out {0}")]
    Timeout(&'static str),

    #[error("login rejected: {0}")]
    LoginRejected(String),

    #[error("relay closed the connection")]
    Closed,

    #[error("nothing heard from relay for {0:?}")]
    LivenessLost(Duration),

    #[error(transparent)]
    Protocol(#[from] duet_core::Error),

    #[error("connection failed: {0}")]
    Failed(String),

    #[error("not connected")]
    NotConnected,

    #[error("outbound queue full")]
    Busy,
}

/// Exponential backoff reconnection policy.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: Some(3),
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.reconnect_initial_delay_ms),
            max_delay: Duration::from_secs(config.reconnect_max_delay_secs),
            multiplier: config.reconnect_multiplier,
            max_attempts: Some(config.reconnect_max_attempts),
        }
    }

    /// Delay before the given attempt (0-indexed).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt.min(64) as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }
}

/// Observable connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Gave up. Carries the last error.
    Failed(String),
}

/// What the connection task reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Logged in, on the first connect or after a reconnect.
    Connected,
    Disconnected,
    Message(ServerMessage),
}

/// Cheap handle for queueing commands and watching state.
#[derive(Clone)]
pub struct ConnectionHandle {
    outbound: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    /// Queue a command. Fails unless a logged-in connection is up.
    pub fn send(&self, command: Command) -> Result<(), ConnectionError> {
        if *self.state.borrow() != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected);
        }
        self.outbound.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::Busy,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::NotConnected,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until connected. Errors if the connection gives up first.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), ConnectionError> {
        let mut state = self.state.clone();
        let settled = tokio::time::timeout(
            timeout,
            state.wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Failed(_))),
        )
        .await
        .map_err(|_| ConnectionError::Timeout("waiting for connection"))?
        .map_err(|_| ConnectionError::Closed)?;

        match &*settled {
            ConnectionState::Failed(reason) => Err(ConnectionError::Failed(reason.clone())),
            _ => Ok(()),
        }
    }
}

/// Owns the socket and the reconnect loop.
pub struct RelayConnection {
    server_addr: String,
    username: String,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    heartbeat_interval: Duration,
    events: mpsc::Sender<ConnectionEvent>,
    state: watch::Sender<ConnectionState>,
}

impl RelayConnection {
    /// Start the connection task. Events arrive on `events` until `cancel`
    /// fires or the task gives up.
    pub fn spawn(
        config: &ClientConfig,
        username: String,
        events: mpsc::Sender<ConnectionEvent>,
        cancel: CancellationToken,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let connection = Self {
            server_addr: config.server_addr.clone(),
            username,
            policy: ReconnectPolicy::from_config(config),
            connect_timeout: config.connect_timeout(),
            heartbeat_interval: config.heartbeat_interval().max(Duration::from_millis(100)),
            events,
            state: state_tx,
        };
        let handle = tokio::spawn(connection.run(outbound_rx, cancel));
        (
            ConnectionHandle {
                outbound: outbound_tx,
                state: state_rx,
            },
            handle,
        )
    }

    fn set_state(&self, state: ConnectionState) {
        debug!(?state, "Connection state");
        self.state.send_replace(state);
    }

    async fn run(self, mut outbound: mpsc::Receiver<Command>, cancel: CancellationToken) {
        let mut attempt: u32 = 0;
        self.set_state(ConnectionState::Connecting);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let mut logged_in = false;
            let result = self
                .connect_and_run(&mut outbound, &cancel, &mut logged_in)
                .await;
            if logged_in {
                attempt = 0;
                let _ = self.events.send(ConnectionEvent::Disconnected).await;
            }

            match result {
                Ok(()) => {
                    info!("Relay connection closed");
                    break;
                }
                Err(ConnectionError::LoginRejected(reason)) => {
                    error!(%reason, "Login rejected, not retrying");
                    self.set_state(ConnectionState::Failed(reason));
                    return;
                }
                Err(e) => {
                    if !self.policy.should_retry(attempt) {
                        error!(error = %e, attempt, "Max reconnect attempts reached");
                        self.set_state(ConnectionState::Failed(e.to_string()));
                        return;
                    }

                    let delay = self.policy.delay_for_attempt(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(error = %e, attempt, delay_ms = delay.as_millis(), "Reconnecting");
                    self.set_state(ConnectionState::Reconnecting { attempt });

                    tokio::select! {
                        () = sleep(delay) => {}
                        () = cancel.cancelled() => break,
                    }
                }
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn connect_and_run(
        &self,
        outbound: &mut mpsc::Receiver<Command>,
        cancel: &CancellationToken,
        logged_in: &mut bool,
    ) -> Result<(), ConnectionError> {
        let deadline = Instant::now() + self.connect_timeout;
        let stream = tokio::time::timeout_at(deadline, TcpStream::connect(&self.server_addr))
            .await
            .map_err(|_| ConnectionError::Timeout("connecting"))?
            .map_err(ConnectionError::Connect)?;
        stream.set_nodelay(true)?;
        let (read_half, mut writer) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        write_command(&mut writer, &Command::Login(self.username.clone())).await?;
        loop {
            let line = tokio::time::timeout_at(deadline, lines.next_line())
                .await
                .map_err(|_| ConnectionError::Timeout("waiting for login reply"))??
                .ok_or(ConnectionError::Closed)?;
            match ServerMessage::parse(&line)? {
                ServerMessage::LoginSuccess => break,
                ServerMessage::Error(reason) => return Err(ConnectionError::LoginRejected(reason)),
                // Presence can race ahead of the login reply.
                users @ ServerMessage::Users(_) => {
                    let _ = self.events.send(ConnectionEvent::Message(users)).await;
                }
                other => debug!(?other, "Ignoring line before login reply"),
            }
        }

        *logged_in = true;
        info!(server = %self.server_addr, user = %self.username, "Logged in to relay");
        self.set_state(ConnectionState::Connected);
        if self.events.send(ConnectionEvent::Connected).await.is_err() {
            return Ok(());
        }

        let liveness = self.heartbeat_interval * 2;
        let mut last_heard = Instant::now();
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = write_command(&mut writer, &Command::Logout(self.username.clone())).await;
                    let _ = writer.shutdown().await;
                    return Ok(());
                }
                command = outbound.recv() => {
                    let Some(command) = command else {
                        return Ok(());
                    };
                    trace!(command = command.name(), "Sending");
                    write_command(&mut writer, &command).await?;
                }
                _ = heartbeat.tick() => {
                    if last_heard.elapsed() > liveness {
                        return Err(ConnectionError::LivenessLost(liveness));
                    }
                    write_command(&mut writer, &Command::Heartbeat).await?;
                }
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        return Err(ConnectionError::Closed);
                    };
                    last_heard = Instant::now();
                    match ServerMessage::parse(&line) {
                        Ok(ServerMessage::HeartbeatAck) => trace!("Heartbeat acknowledged"),
                        Ok(message) => {
                            if self.events.send(ConnectionEvent::Message(message)).await.is_err() {
                                return Ok(());
                            }
                        }
                        Err(e) => warn!(error = %e, "Ignoring malformed line from relay"),
                    }
                }
            }
        }
    }
}

async fn write_command(
    writer: &mut OwnedWriteHalf,
    command: &Command,
) -> Result<(), ConnectionError> {
    let mut line = command.encode();
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
