//! Outbound fan-out, decoupled from connection read loops.
//!
//! Handlers enqueue [`Delivery`] tasks; one dispatcher task drains the queue
//! in order and writes each line to its recipients concurrently, bounded by
//! `fanout_workers` and an aggregate `fanout_timeout`. Each recipient gets
//! half of that budget to accept its line; one that doesn't is closed and
//! left for its handler to clean up.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use duet_core::config::RelayConfig;
use duet_core::protocol::ServerMessage;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::registry::{ClientConnection, ConnectionRegistry};

/// One unit of fan-out work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Reflow `content` to every connected user except `sender`.
    Broadcast { sender: String, content: String },
    /// Forward `content` to `receiver` only.
    Private {
        sender: String,
        receiver: String,
        content: String,
    },
    /// Push the full presence list to every connected user.
    Presence,
}

/// Outcome of a single fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub failed: usize,
    pub timed_out: bool,
}

/// Handle for enqueueing deliveries.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Delivery>,
}

impl Dispatcher {
    /// Start the dispatcher task on `tracker`. It stops on `cancel`.
    pub fn spawn(
        registry: ConnectionRegistry,
        config: &RelayConfig,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.dispatch_queue_capacity.max(1));
        let fanout = Fanout {
            registry,
            workers: Arc::new(Semaphore::new(config.fanout_workers.max(1))),
            timeout: config.fanout_timeout(),
        };
        tracker.spawn(fanout.run(rx, cancel));
        Self { tx }
    }

    /// Enqueue a delivery. Returns `false` when the queue is full or closed.
    pub fn enqueue(&self, delivery: Delivery) -> bool {
        match self.tx.try_send(delivery) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(delivery)) => {
                warn!(?delivery, "Dispatch queue full, dropping delivery");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Dispatcher stopped, dropping delivery");
                false
            }
        }
    }

    pub fn broadcast(&self, sender: &str, content: &str) -> bool {
        self.enqueue(Delivery::Broadcast {
            sender: sender.to_owned(),
            content: content.to_owned(),
        })
    }

    pub fn private(&self, sender: &str, receiver: &str, content: &str) -> bool {
        self.enqueue(Delivery::Private {
            sender: sender.to_owned(),
            receiver: receiver.to_owned(),
            content: content.to_owned(),
        })
    }

    pub fn presence(&self) -> bool {
        self.enqueue(Delivery::Presence)
    }
}

struct Fanout {
    registry: ConnectionRegistry,
    workers: Arc<Semaphore>,
    timeout: Duration,
}

impl Fanout {
    async fn run(self, mut rx: mpsc::Receiver<Delivery>, cancel: CancellationToken) {
        loop {
            let delivery = tokio::select! {
                () = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(delivery) => delivery,
                    None => break,
                },
            };
            let report = self.deliver(delivery).await;
            if report.failed > 0 || report.timed_out {
                warn!(
                    delivered = report.delivered,
                    failed = report.failed,
                    timed_out = report.timed_out,
                    "Fan-out incomplete"
                );
            }
        }
        debug!("Dispatcher stopped");
    }

    async fn deliver(&self, delivery: Delivery) -> FanoutReport {
        let stamp = Local::now().naive_local();
        let (recipients, line) = match delivery {
            Delivery::Broadcast { sender, content } => {
                let recipients = self
                    .registry
                    .connections()
                    .into_iter()
                    .filter(|c| c.username != sender)
                    .collect();
                let line = ServerMessage::Broadcast {
                    sender,
                    content,
                    timestamp: stamp,
                };
                (recipients, line)
            }
            Delivery::Private {
                sender,
                receiver,
                content,
            } => {
                let Some(conn) = self.registry.get(&receiver) else {
                    debug!(%sender, %receiver, "Receiver went offline before delivery");
                    return FanoutReport::default();
                };
                let line = ServerMessage::Private {
                    sender,
                    receiver,
                    content,
                    timestamp: stamp,
                };
                (vec![conn], line)
            }
            Delivery::Presence => (
                self.registry.connections(),
                ServerMessage::Users(self.registry.usernames()),
            ),
        };
        self.fan_out(recipients, line.encode()).await
    }

    async fn fan_out(&self, recipients: Vec<Arc<ClientConnection>>, line: String) -> FanoutReport {
        let mut report = FanoutReport::default();
        if recipients.is_empty() {
            return report;
        }

        let mut set = JoinSet::new();
        for conn in recipients {
            let workers = Arc::clone(&self.workers);
            let line = line.clone();
            let timeout = self.timeout / 2;
            set.spawn(async move {
                let Ok(_permit) = workers.acquire_owned().await else {
                    return (conn, false);
                };
                let ok = conn.send_line(line, timeout).await.is_ok();
                (conn, ok)
            });
        }

        let collect = async {
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((_, true)) => report.delivered += 1,
                    Ok((conn, false)) => {
                        report.failed += 1;
                        warn!(username = %conn.username, "Write failed, closing connection");
                        conn.close();
                    }
                    Err(e) => {
                        report.failed += 1;
                        warn!(error = %e, "Fan-out task failed");
                    }
                }
            }
        };
        if tokio::time::timeout(self.timeout, collect).await.is_err() {
            report.timed_out = true;
            // Sends already in flight finish on their own.
            set.detach_all();
        }
        report
    }
}
