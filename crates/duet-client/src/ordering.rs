//! Per-conversation reorder buffers.
//!
//! Messages reach the display callback in sequence order. A gap that does
//! not close within the buffer timeout is force-flushed: everything buffered
//! is emitted in priority order and the expected sequence jumps past it.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use duet_core::config::OrderingConfig;
use duet_core::message::ChatMessage;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives messages once they are ready for display.
pub type DisplayCallback = Arc<dyn Fn(ChatMessage) + Send + Sync>;

struct Queued(ChatMessage);

impl Queued {
    const fn key(&self) -> (i64, i64) {
        (self.0.sequence_number, self.0.id)
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key().cmp(&other.key())
    }
}

#[derive(Default)]
struct Drained {
    ready: Vec<ChatMessage>,
    stale: u64,
    forced: bool,
}

struct ConversationBuffer {
    heap: BinaryHeap<Reverse<Queued>>,
    seen: HashSet<i64>,
    expected: i64,
    last_activity: Instant,
    // Held from drain until the callback returns, so emission for this
    // conversation never interleaves. Other conversations are unaffected.
    emit: Arc<Mutex<()>>,
}

impl ConversationBuffer {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            seen: HashSet::new(),
            expected: 1,
            last_activity: Instant::now(),
            emit: Arc::new(Mutex::new(())),
        }
    }

    /// Returns false when the id is already buffered.
    fn push(&mut self, message: ChatMessage) -> bool {
        if !self.seen.insert(message.id) {
            return false;
        }
        self.heap.push(Reverse(Queued(message)));
        self.last_activity = Instant::now();
        true
    }

    fn pop(&mut self) -> Option<ChatMessage> {
        let Reverse(Queued(message)) = self.heap.pop()?;
        self.seen.remove(&message.id);
        Some(message)
    }

    fn head_sequence(&self) -> Option<i64> {
        self.heap.peek().map(|Reverse(q)| q.0.sequence_number)
    }

    /// Pop everything that is in order. With `force`, or once `timeout` has
    /// passed since the last arrival, flush the rest regardless of gaps.
    fn drain(&mut self, timeout: Duration, force: bool) -> Drained {
        let mut out = Drained::default();
        while let Some(head) = self.head_sequence() {
            match head.cmp(&self.expected) {
                CmpOrdering::Equal => {
                    if let Some(message) = self.pop() {
                        self.expected += 1;
                        out.ready.push(message);
                    }
                }
                CmpOrdering::Less => {
                    if let Some(message) = self.pop() {
                        debug!(
                            id = message.id,
                            seq = message.sequence_number,
                            expected = self.expected,
                            "Discarding stale message"
                        );
                        out.stale += 1;
                    }
                }
                CmpOrdering::Greater => break,
            }
        }

        if !self.heap.is_empty() && (force || self.last_activity.elapsed() > timeout) {
            out.forced = true;
            while let Some(message) = self.pop() {
                self.expected = message.sequence_number + 1;
                out.ready.push(message);
            }
        }
        out
    }
}

/// Counters exposed through [`OrderingService::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrderingStats {
    pub conversations: usize,
    pub buffered: usize,
    pub delivered: u64,
    pub duplicates: u64,
    pub force_flushes: u64,
}

pub struct OrderingService {
    buffers: DashMap<String, ConversationBuffer>,
    on_display: DisplayCallback,
    buffer_timeout: Duration,
    drain_interval: Duration,
    idle_cleanup: Duration,
    running: AtomicBool,
    delivered: AtomicU64,
    duplicates: AtomicU64,
    force_flushes: AtomicU64,
}

impl OrderingService {
    pub fn new(config: &OrderingConfig, on_display: DisplayCallback) -> Self {
        Self {
            buffers: DashMap::new(),
            on_display,
            buffer_timeout: config.buffer_timeout(),
            drain_interval: config.drain_interval(),
            idle_cleanup: config.idle_cleanup(),
            running: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            force_flushes: AtomicU64::new(0),
        }
    }

    /// Accept a message from the network.
    ///
    /// Unsequenced messages, and any message while the service is stopped,
    /// go straight to the display callback. The callback may touch other
    /// conversations but must not re-enter the one it is displaying.
    pub fn add_message(&self, message: ChatMessage) {
        if !message.is_sequenced() || !self.is_running() {
            self.emit_all(vec![message]);
            return;
        }

        let conversation = message.conversation_id.clone();
        let emit = Arc::clone(
            &self
                .buffers
                .entry(conversation.clone())
                .or_insert_with(ConversationBuffer::new)
                .emit,
        );
        let _emit = emit.lock().unwrap_or_else(PoisonError::into_inner);
        let drained = {
            // Our clone of `emit` keeps `cleanup_idle` from removing the entry.
            let Some(mut buffer) = self.buffers.get_mut(&conversation) else {
                return;
            };
            if message.sequence_number < buffer.expected || !buffer.push(message) {
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(conversation_id = %conversation, "Duplicate message ignored");
                return;
            }
            buffer.drain(self.buffer_timeout, false)
        };
        self.deliver(&conversation, drained);
    }

    /// Emit everything buffered for `conversation`, gaps included.
    pub fn flush_conversation(&self, conversation: &str) -> usize {
        self.drain_one(conversation, true)
    }

    pub fn flush_all(&self) -> usize {
        self.conversation_ids()
            .iter()
            .map(|id| self.drain_one(id, true))
            .sum()
    }

    /// Next sequence number the conversation is waiting for.
    pub fn expected_sequence(&self, conversation: &str) -> i64 {
        self.buffers.get(conversation).map_or(1, |b| b.expected)
    }

    /// Buffered message count per conversation.
    pub fn buffer_stats(&self) -> HashMap<String, usize> {
        self.buffers
            .iter()
            .map(|entry| (entry.key().clone(), entry.heap.len()))
            .collect()
    }

    pub fn stats(&self) -> OrderingStats {
        OrderingStats {
            conversations: self.buffers.len(),
            buffered: self.buffers.iter().map(|b| b.heap.len()).sum(),
            delivered: self.delivered.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            force_flushes: self.force_flushes.load(Ordering::Relaxed),
        }
    }

    /// Drop empty buffers idle for longer than the cleanup threshold.
    pub fn cleanup_idle(&self) -> usize {
        let before = self.buffers.len();
        self.buffers.retain(|_, buffer| {
            !buffer.heap.is_empty()
                || Arc::strong_count(&buffer.emit) > 1
                || buffer.last_activity.elapsed() <= self.idle_cleanup
        });
        before - self.buffers.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start the periodic drain. On cancel every buffer is flushed and the
    /// service goes back to direct delivery.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        self.running.store(true, Ordering::Release);
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut drain =
                tokio::time::interval(service.drain_interval.max(Duration::from_millis(1)));
            drain.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut cleanup =
                tokio::time::interval(service.idle_cleanup.max(Duration::from_secs(1)));
            cleanup.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = drain.tick() => {
                        for id in service.conversation_ids() {
                            service.drain_one(&id, false);
                        }
                    }
                    _ = cleanup.tick() => {
                        let removed = service.cleanup_idle();
                        if removed > 0 {
                            debug!(removed, "Removed idle reorder buffers");
                        }
                    }
                }
            }
            service.running.store(false, Ordering::Release);
            let flushed = service.flush_all();
            info!(flushed, "Ordering service stopped");
        })
    }

    fn conversation_ids(&self) -> Vec<String> {
        self.buffers.iter().map(|e| e.key().clone()).collect()
    }

    fn drain_one(&self, conversation: &str, force: bool) -> usize {
        let Some(emit) = self.buffers.get(conversation).map(|b| Arc::clone(&b.emit)) else {
            return 0;
        };
        let _emit = emit.lock().unwrap_or_else(PoisonError::into_inner);
        let drained = match self.buffers.get_mut(conversation) {
            Some(mut buffer) => buffer.drain(self.buffer_timeout, force),
            None => return 0,
        };
        let count = drained.ready.len();
        self.deliver(conversation, drained);
        count
    }

    // Called with the conversation's emit lock held and no buffer guard alive.
    fn deliver(&self, conversation: &str, drained: Drained) {
        if drained.stale > 0 {
            self.duplicates.fetch_add(drained.stale, Ordering::Relaxed);
        }
        if drained.forced {
            self.force_flushes.fetch_add(1, Ordering::Relaxed);
            warn!(
                conversation_id = conversation,
                count = drained.ready.len(),
                "Force-flushed reorder buffer past a sequence gap"
            );
        }
        self.emit_all(drained.ready);
    }

    fn emit_all(&self, messages: Vec<ChatMessage>) {
        for message in messages {
            self.delivered.fetch_add(1, Ordering::Relaxed);
            (self.on_display)(message);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;
    use duet_core::ids::conversation_id;

    use super::*;

    fn msg(id: i64, seq: i64) -> ChatMessage {
        let mut m = ChatMessage::new(id, "bob", "alice", format!("m{seq}"), Utc::now());
        m.sequence_number = seq;
        m
    }

    fn service(timeout_ms: u64) -> (Arc<OrderingService>, Arc<Mutex<Vec<i64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let config = OrderingConfig {
            buffer_timeout_ms: timeout_ms,
            drain_interval_ms: 20,
            idle_cleanup_secs: 300,
        };
        let svc = OrderingService::new(
            &config,
            Arc::new(move |m: ChatMessage| sink.lock().unwrap().push(m.sequence_number)),
        );
        (Arc::new(svc), seen)
    }

    fn conv() -> String {
        conversation_id("alice", "bob")
    }

    #[tokio::test]
    async fn out_of_order_is_reordered() {
        let (svc, seen) = service(1000);
        let cancel = CancellationToken::new();
        svc.start(cancel.clone());

        svc.add_message(msg(12, 2));
        svc.add_message(msg(13, 3));
        assert!(seen.lock().unwrap().is_empty());
        svc.add_message(msg(11, 1));

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(svc.expected_sequence(&conv()), 4);
        cancel.cancel();
    }

    #[tokio::test]
    async fn duplicates_are_delivered_once() {
        let (svc, seen) = service(1000);
        let cancel = CancellationToken::new();
        svc.start(cancel.clone());

        svc.add_message(msg(12, 2));
        svc.add_message(msg(12, 2));
        svc.add_message(msg(11, 1));
        svc.add_message(msg(11, 1));

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(svc.stats().duplicates, 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn gap_is_force_flushed_after_timeout() {
        let (svc, seen) = service(200);
        let cancel = CancellationToken::new();
        svc.start(cancel.clone());

        for (id, seq) in [(1, 1), (2, 2), (4, 4), (5, 5)] {
            svc.add_message(msg(id, seq));
        }
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 4, 5]);
        assert_eq!(svc.expected_sequence(&conv()), 6);
        assert_eq!(svc.stats().force_flushes, 1);

        // The missing message arriving late is stale now.
        svc.add_message(msg(3, 3));
        assert_eq!(seen.lock().unwrap().len(), 4);
        cancel.cancel();
    }

    #[tokio::test]
    async fn manual_flush_drains_in_priority_order() {
        let (svc, seen) = service(60_000);
        let cancel = CancellationToken::new();
        svc.start(cancel.clone());

        svc.add_message(msg(7, 7));
        svc.add_message(msg(3, 3));
        assert_eq!(svc.buffer_stats().get(&conv()), Some(&2));

        assert_eq!(svc.flush_conversation(&conv()), 2);
        assert_eq!(*seen.lock().unwrap(), vec![3, 7]);
        assert_eq!(svc.expected_sequence(&conv()), 8);
        assert_eq!(svc.flush_conversation("nobody"), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn unsequenced_and_not_started_bypass_buffering() {
        let (svc, seen) = service(1000);

        // Not started yet.
        svc.add_message(msg(9, 9));
        assert_eq!(*seen.lock().unwrap(), vec![9]);

        let cancel = CancellationToken::new();
        svc.start(cancel.clone());
        let mut broadcast = ChatMessage::new(10, "bob", "all", "hey", Utc::now());
        broadcast.sequence_number = 0;
        svc.add_message(broadcast);
        assert_eq!(*seen.lock().unwrap(), vec![9, 0]);
        assert!(svc.buffer_stats().is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn stop_flushes_everything() {
        let (svc, seen) = service(60_000);
        let cancel = CancellationToken::new();
        let handle = svc.start(cancel.clone());
        svc.add_message(msg(5, 5));
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![5]);
        assert!(!svc.is_running());
    }

    #[test]
    fn slow_display_in_one_conversation_does_not_block_another() {
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let started_tx = Mutex::new(started_tx);
        let shown = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&shown);
        let svc = Arc::new(OrderingService::new(
            &OrderingConfig::default(),
            Arc::new(move |m: ChatMessage| {
                if m.sender == "bob" {
                    started_tx.lock().unwrap().send(()).unwrap();
                    std::thread::sleep(Duration::from_millis(500));
                }
                sink.lock().unwrap().push(m.sender);
            }),
        ));
        svc.running.store(true, Ordering::Release);

        let slow = Arc::clone(&svc);
        let bob = std::thread::spawn(move || slow.add_message(msg(1, 1)));
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let mut carol = ChatMessage::new(2, "carol", "alice", "hi", Utc::now());
        carol.sequence_number = 1;
        let began = Instant::now();
        svc.add_message(carol);
        assert!(began.elapsed() < Duration::from_millis(250));
        assert_eq!(*shown.lock().unwrap(), vec!["carol".to_owned()]);

        // Another conversation can be flushed while bob's callback runs.
        assert_eq!(svc.flush_conversation(&conversation_id("alice", "carol")), 0);
        bob.join().unwrap();
        assert_eq!(shown.lock().unwrap().len(), 2);
    }

    #[test]
    fn idle_empty_buffers_are_removed() {
        let (svc, _seen) = service(1000);
        svc.running.store(true, Ordering::Release);
        svc.add_message(msg(1, 1));
        assert_eq!(svc.cleanup_idle(), 0);

        let stale = OrderingService {
            idle_cleanup: Duration::ZERO,
            ..OrderingService::new(&OrderingConfig::default(), Arc::new(|_| {}))
        };
        stale.running.store(true, Ordering::Release);
        stale.add_message(msg(1, 1));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(stale.cleanup_idle(), 1);
    }
}
