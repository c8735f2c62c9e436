//! Outbound sequencing.
//!
//! A single worker drains a bounded queue and stamps each message with its
//! conversation's next sequence number. One consumer means assignment is
//! serialized per process without a lock per conversation. Submissions
//! never block: a full queue drops the request and reports it.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use duet_core::config::SequencingConfig;
use duet_core::ids::MessageIdGenerator;
use duet_core::message::{BROADCAST_RECEIVER, ChatMessage, MessageStatus};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequencingError {
    #[error("sequencing queue is full")]
    QueueFull,

    #[error("sequencing service stopped")]
    Stopped,

    #[error("broadcasts are not sequenced")]
    Broadcast,

    #[error("sender and receiver must be non-empty")]
    MissingParticipant,
}

/// Receives the outcome of each submission, on the sequencing worker.
pub trait SequenceListener: Send + Sync {
    fn on_sequenced(&self, message: ChatMessage);

    fn on_error(&self, message: ChatMessage, error: SequencingError);
}

#[derive(Debug)]
struct SequenceRequest {
    sender: String,
    receiver: String,
    content: String,
    timestamp: DateTime<Utc>,
}

/// Counters exposed through [`SequencingService::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequencingStats {
    pub conversations: usize,
    pub sequenced: u64,
    pub dropped: u64,
    pub queued: usize,
}

struct Counters {
    next: DashMap<String, AtomicI64>,
    sequenced: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    /// Increment and return the conversation's counter; the first value is 1.
    fn advance(&self, conversation: &str) -> i64 {
        if let Some(counter) = self.next.get(conversation) {
            return counter.fetch_add(1, Ordering::AcqRel) + 1;
        }
        self.next
            .entry(conversation.to_owned())
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(1, Ordering::AcqRel)
            + 1
    }
}

/// Assigns per-conversation sequence numbers on a dedicated worker.
pub struct SequencingService {
    tx: mpsc::Sender<SequenceRequest>,
    counters: Arc<Counters>,
    capacity: usize,
}

impl SequencingService {
    /// Spawn the worker on `tracker`. It exits when `cancel` fires.
    pub fn start(
        ids: Arc<MessageIdGenerator>,
        listener: Arc<dyn SequenceListener>,
        config: &SequencingConfig,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let counters = Arc::new(Counters {
            next: DashMap::new(),
            sequenced: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });
        tracker.spawn(run_worker(
            rx,
            ids,
            listener,
            Arc::clone(&counters),
            cancel,
        ));
        Self {
            tx,
            counters,
            capacity,
        }
    }

    /// Submit a private message for sequencing.
    ///
    /// Returns immediately. The listener hears about the result later.
    pub fn sequence(
        &self,
        sender: &str,
        receiver: &str,
        content: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), SequencingError> {
        if receiver == BROADCAST_RECEIVER {
            return Err(SequencingError::Broadcast);
        }
        let request = SequenceRequest {
            sender: sender.to_owned(),
            receiver: receiver.to_owned(),
            content: content.to_owned(),
            timestamp,
        };
        self.tx.try_send(request).map_err(|e| {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            match e {
                mpsc::error::TrySendError::Full(req) => {
                    warn!(receiver = %req.receiver, "Sequencing queue full, dropping message");
                    SequencingError::QueueFull
                }
                mpsc::error::TrySendError::Closed(_) => SequencingError::Stopped,
            }
        })
    }

    /// Last sequence number handed out for `conversation`, 0 if none.
    pub fn current_sequence(&self, conversation: &str) -> i64 {
        self.counters
            .next
            .get(conversation)
            .map_or(0, |c| c.load(Ordering::Acquire))
    }

    /// Restart numbering for `conversation` at 1.
    pub fn reset_sequence(&self, conversation: &str) {
        self.counters.next.remove(conversation);
        debug!(conversation_id = conversation, "Sequence reset");
    }

    /// Make sure the next number for `conversation` is above `last`.
    pub fn seed_sequence(&self, conversation: &str, last: i64) {
        self.counters
            .next
            .entry(conversation.to_owned())
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_max(last, Ordering::AcqRel);
    }

    pub fn stats(&self) -> SequencingStats {
        SequencingStats {
            conversations: self.counters.next.len(),
            sequenced: self.counters.sequenced.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            queued: self.capacity - self.tx.capacity(),
        }
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<SequenceRequest>,
    ids: Arc<MessageIdGenerator>,
    listener: Arc<dyn SequenceListener>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            () = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(request) => request,
                None => break,
            },
        };

        let mut message = ChatMessage::new(
            0,
            request.sender,
            request.receiver,
            request.content,
            request.timestamp,
        );
        if message.sender.is_empty() || message.receiver.is_empty() {
            listener.on_error(message, SequencingError::MissingParticipant);
            continue;
        }

        message.id = ids.generate(&message.conversation_id);
        message.sequence_number = counters.advance(&message.conversation_id);
        message.status = MessageStatus::Sent;
        counters.sequenced.fetch_add(1, Ordering::Relaxed);
        debug!(
            conversation_id = %message.conversation_id,
            seq = message.sequence_number,
            id = message.id,
            "Message sequenced"
        );
        listener.on_sequenced(message);
    }
    debug!("Sequencing worker stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    type Outcome = Result<ChatMessage, (ChatMessage, SequencingError)>;

    struct ChannelListener(mpsc::UnboundedSender<Outcome>);

    impl SequenceListener for ChannelListener {
        fn on_sequenced(&self, message: ChatMessage) {
            let _ = self.0.send(Ok(message));
        }

        fn on_error(&self, message: ChatMessage, error: SequencingError) {
            let _ = self.0.send(Err((message, error)));
        }
    }

    fn start(capacity: usize) -> (SequencingService, mpsc::UnboundedReceiver<Outcome>, CancellationToken) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let service = SequencingService::start(
            Arc::new(MessageIdGenerator::new(1).unwrap()),
            Arc::new(ChannelListener(tx)),
            &SequencingConfig {
                queue_capacity: capacity,
            },
            &TaskTracker::new(),
            cancel.clone(),
        );
        (service, rx, cancel)
    }

    #[tokio::test]
    async fn numbers_start_at_one_per_conversation() {
        let (service, mut rx, cancel) = start(16);
        let now = Utc::now();
        service.sequence("alice", "bob", "one", now).unwrap();
        service.sequence("bob", "alice", "two", now).unwrap();
        service.sequence("alice", "carol", "other", now).unwrap();

        let first = rx.recv().await.unwrap().unwrap();
        let second = rx.recv().await.unwrap().unwrap();
        let other = rx.recv().await.unwrap().unwrap();

        assert_eq!(first.conversation_id, "alice_bob");
        assert_eq!(first.sequence_number, 1);
        assert_eq!(second.sequence_number, 2);
        assert_eq!(other.sequence_number, 1);
        assert_eq!(first.status, MessageStatus::Sent);
        assert!(second.id != first.id);
        assert_eq!(service.current_sequence("alice_bob"), 2);
        assert_eq!(service.stats().sequenced, 3);
        cancel.cancel();
    }

    #[tokio::test]
    async fn seed_and_reset() {
        let (service, mut rx, cancel) = start(16);
        service.seed_sequence("alice_bob", 41);
        service.seed_sequence("alice_bob", 7);
        service.sequence("alice", "bob", "x", Utc::now()).unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap().sequence_number, 42);

        service.reset_sequence("alice_bob");
        assert_eq!(service.current_sequence("alice_bob"), 0);
        service.sequence("alice", "bob", "y", Utc::now()).unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap().sequence_number, 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn broadcast_and_empty_participants_are_rejected() {
        let (service, mut rx, cancel) = start(16);
        assert_eq!(
            service.sequence("alice", "all", "hi", Utc::now()),
            Err(SequencingError::Broadcast)
        );
        service.sequence("", "bob", "hi", Utc::now()).unwrap();
        let (_, err) = rx.recv().await.unwrap().unwrap_err();
        assert_eq!(err, SequencingError::MissingParticipant);
        cancel.cancel();
    }

    struct GatedListener(std::sync::Mutex<std::sync::mpsc::Receiver<()>>);

    impl SequenceListener for GatedListener {
        fn on_sequenced(&self, _message: ChatMessage) {
            let _ = self.0.lock().unwrap().recv();
        }

        fn on_error(&self, _message: ChatMessage, _error: SequencingError) {}
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_queue_drops_submission() {
        let (gate, gated) = std::sync::mpsc::channel();
        let cancel = CancellationToken::new();
        let service = SequencingService::start(
            Arc::new(MessageIdGenerator::new(1).unwrap()),
            Arc::new(GatedListener(std::sync::Mutex::new(gated))),
            &SequencingConfig { queue_capacity: 1 },
            &TaskTracker::new(),
            cancel.clone(),
        );

        let now = Utc::now();
        service.sequence("alice", "bob", "held", now).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        service.sequence("alice", "bob", "queued", now).unwrap();
        assert_eq!(
            service.sequence("alice", "bob", "dropped", now),
            Err(SequencingError::QueueFull)
        );
        assert_eq!(service.stats().dropped, 1);
        assert_eq!(service.stats().queued, 1);

        gate.send(()).unwrap();
        gate.send(()).unwrap();
        cancel.cancel();
    }

    #[tokio::test]
    async fn stopped_worker_rejects_submissions() {
        let (service, _rx, cancel) = start(4);
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            service.sequence("alice", "bob", "late", Utc::now()),
            Err(SequencingError::Stopped)
        );
    }

    #[tokio::test]
    async fn order_of_submission_is_order_of_numbers() {
        let (service, mut rx, cancel) = start(64);
        for i in 0..20 {
            service
                .sequence("alice", "bob", &i.to_string(), Utc::now())
                .unwrap();
        }
        for expected in 1..=20 {
            let msg = rx.recv().await.unwrap().unwrap();
            assert_eq!(msg.sequence_number, expected);
            assert_eq!(msg.content, (expected - 1).to_string());
        }
        cancel.cancel();
    }
}
