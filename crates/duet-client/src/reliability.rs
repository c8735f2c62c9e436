//! At-least-once delivery for sequenced private messages.
//!
//! Every sent message stays pending until the peer acks it. Each timeout
//! resends, up to `max_retries` times; after that the message is marked
//! failed and dropped from tracking. Messages for users known to be
//! offline wait in a bounded per-user queue instead.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use duet_core::config::ReliabilityConfig;
use duet_core::message::{ChatMessage, MessageStatus};
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::ConnectionError;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Hands a message to the network. Called for the first send and every retry.
pub trait MessageTransport: Send + Sync {
    fn send(&self, message: &ChatMessage) -> Result<(), ConnectionError>;
}

/// A delivery status transition, published to [`ReliabilityService::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryUpdate {
    pub message_id: i64,
    pub conversation_id: String,
    pub status: MessageStatus,
    pub retries: u32,
}

struct PendingMessage {
    message: ChatMessage,
    retry_count: u32,
    created: Instant,
    timeout: AbortHandle,
}

struct OfflineEntry {
    message: ChatMessage,
    queued_at: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReliabilityStats {
    pub pending: usize,
    pub offline_users: usize,
    pub offline_messages: usize,
}

/// What one cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub abandoned: usize,
    pub expired_offline: usize,
}

struct Inner {
    transport: Arc<dyn MessageTransport>,
    pending: DashMap<i64, PendingMessage>,
    offline: DashMap<String, VecDeque<OfflineEntry>>,
    updates: broadcast::Sender<DeliveryUpdate>,
    config: ReliabilityConfig,
}

impl Inner {
    fn publish(&self, message: &ChatMessage, status: MessageStatus, retries: u32) {
        // No subscribers is fine.
        let _ = self.updates.send(DeliveryUpdate {
            message_id: message.id,
            conversation_id: message.conversation_id.clone(),
            status,
            retries,
        });
    }

    fn transmit(&self, message: &ChatMessage, attempt: u32) {
        if let Err(e) = self.transport.send(message) {
            warn!(
                id = message.id,
                attempt,
                error = %e,
                "Send failed, waiting for retry"
            );
        }
    }

    fn on_timeout(self: &Arc<Self>, id: i64) {
        let Some(mut entry) = self.pending.get_mut(&id) else {
            return;
        };
        entry.retry_count += 1;
        let retries = entry.retry_count;

        if retries <= self.config.max_retries {
            entry.timeout = arm_timeout(self, id);
            let message = entry.message.clone();
            drop(entry);
            info!(id, retry = retries, "Ack timed out, resending");
            self.transmit(&message, retries + 1);
            return;
        }

        drop(entry);
        if let Some((_, mut pending)) = self.pending.remove(&id) {
            pending.message.status = MessageStatus::Failed;
            warn!(
                id,
                receiver = %pending.message.receiver,
                retries = pending.retry_count,
                "Delivery failed, retries exhausted"
            );
            let retried = pending.retry_count.min(self.config.max_retries);
            self.publish(&pending.message, MessageStatus::Failed, retried);
        }
    }
}

fn arm_timeout(inner: &Arc<Inner>, id: i64) -> AbortHandle {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    let timeout = inner.config.ack_timeout();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Some(inner) = weak.upgrade() {
            inner.on_timeout(id);
        }
    })
    .abort_handle()
}

/// Pending-ack tracking, retry timers and offline queues.
#[derive(Clone)]
pub struct ReliabilityService {
    inner: Arc<Inner>,
}

impl ReliabilityService {
    pub fn new(transport: Arc<dyn MessageTransport>, config: &ReliabilityConfig) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                transport,
                pending: DashMap::new(),
                offline: DashMap::new(),
                updates,
                config: config.clone(),
            }),
        }
    }

    /// Track `message` until acked and send it. Must run inside a Tokio runtime.
    pub fn send_reliable(&self, mut message: ChatMessage) {
        let id = message.id;
        message.status = MessageStatus::Sending;
        self.inner.publish(&message, MessageStatus::Sending, 0);

        let timeout = arm_timeout(&self.inner, id);
        if let Some(previous) = self.inner.pending.insert(
            id,
            PendingMessage {
                message: message.clone(),
                retry_count: 0,
                created: Instant::now(),
                timeout,
            },
        ) {
            previous.timeout.abort();
        }

        debug!(id, receiver = %message.receiver, "Sending reliably");
        self.inner.transmit(&message, 1);
    }

    /// Resolve a pending message. Unknown ids are ignored and return false.
    pub fn acknowledge(&self, message_id: i64) -> bool {
        let Some((_, mut pending)) = self.inner.pending.remove(&message_id) else {
            debug!(id = message_id, "Ack for unknown message ignored");
            return false;
        };
        pending.timeout.abort();
        pending.message.status = MessageStatus::Delivered;
        debug!(id = message_id, retries = pending.retry_count, "Message delivered");
        self.inner
            .publish(&pending.message, MessageStatus::Delivered, pending.retry_count);
        true
    }

    pub fn is_pending(&self, message_id: i64) -> bool {
        self.inner.pending.contains_key(&message_id)
    }

    /// Queue `message` for `user`, dropping the oldest entry past capacity.
    pub fn add_offline_message(&self, user: &str, message: ChatMessage) {
        let capacity = self.inner.config.offline_capacity.max(1);
        let mut queue = self.inner.offline.entry(user.to_owned()).or_default();
        queue.push_back(OfflineEntry {
            message,
            queued_at: Instant::now(),
        });
        while queue.len() > capacity {
            if let Some(dropped) = queue.pop_front() {
                debug!(user, id = dropped.message.id, "Offline queue full, dropped oldest");
            }
        }
    }

    /// Take every queued message for `user`, oldest first.
    pub fn get_and_clear_offline_messages(&self, user: &str) -> Vec<ChatMessage> {
        self.inner
            .offline
            .remove(user)
            .map(|(_, queue)| queue.into_iter().map(|e| e.message).collect())
            .unwrap_or_default()
    }

    pub fn has_offline_messages(&self, user: &str) -> bool {
        self.offline_message_count(user) > 0
    }

    pub fn offline_message_count(&self, user: &str) -> usize {
        self.inner.offline.get(user).map_or(0, |q| q.len())
    }

    /// Move pending messages addressed to `user` into the offline queue.
    pub fn park_pending_for(&self, user: &str) -> usize {
        let ids: Vec<i64> = self
            .inner
            .pending
            .iter()
            .filter(|p| p.message.receiver == user)
            .map(|p| *p.key())
            .collect();

        let mut parked = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, pending)) = self.inner.pending.remove(&id) {
                pending.timeout.abort();
                parked.push(pending.message);
            }
        }
        parked.sort_by_key(|m| m.sequence_number);
        let count = parked.len();
        for message in parked {
            self.add_offline_message(user, message);
        }
        if count > 0 {
            info!(user, count, "Parked pending messages for offline user");
        }
        count
    }

    /// Purge abandoned pending entries and expired offline messages.
    pub fn cleanup(&self) -> CleanupReport {
        let max_age = self.inner.config.pending_max_age();
        let abandoned: Vec<i64> = self
            .inner
            .pending
            .iter()
            .filter(|p| p.created.elapsed() > max_age)
            .map(|p| *p.key())
            .collect();

        let mut report = CleanupReport::default();
        for id in abandoned {
            if let Some((_, pending)) = self.inner.pending.remove(&id) {
                pending.timeout.abort();
                self.inner
                    .publish(&pending.message, MessageStatus::Failed, pending.retry_count);
                report.abandoned += 1;
            }
        }

        let ttl = self.inner.config.offline_ttl();
        self.inner.offline.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|e| e.queued_at.elapsed() <= ttl);
            report.expired_offline += before - queue.len();
            !queue.is_empty()
        });

        if report.abandoned > 0 || report.expired_offline > 0 {
            info!(
                abandoned = report.abandoned,
                expired_offline = report.expired_offline,
                "Reliability cleanup"
            );
        }
        report
    }

    /// Run [`cleanup`](Self::cleanup) on the configured interval.
    pub fn spawn_cleanup(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let service = self.clone();
        let every = self.inner.config.cleanup_interval().max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        service.cleanup();
                    }
                }
            }
            debug!("Reliability cleanup stopped");
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryUpdate> {
        self.inner.updates.subscribe()
    }

    pub fn stats(&self) -> ReliabilityStats {
        ReliabilityStats {
            pending: self.inner.pending.len(),
            offline_users: self.inner.offline.len(),
            offline_messages: self.inner.offline.iter().map(|q| q.len()).sum(),
        }
    }

    /// Cancel every timeout task and forget pending messages.
    pub fn shutdown(&self) -> usize {
        let ids: Vec<i64> = self.inner.pending.iter().map(|p| *p.key()).collect();
        let mut cancelled = 0;
        for id in ids {
            if let Some((_, pending)) = self.inner.pending.remove(&id) {
                pending.timeout.abort();
                cancelled += 1;
            }
        }
        debug!(cancelled, "Reliability service shut down");
        cancelled
    }
}
