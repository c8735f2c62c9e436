//! Read-aside, write-through message cache.
//!
//! Two structures:
//! - per-conversation slices of the most recent messages (newest first),
//!   each expiring `ttl` after its last write;
//! - a global by-ID index with LRU eviction, used for status updates
//!   without a store round-trip.
//!
//! The cache never replaces the store. A miss means "ask the store, then `put`".

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::message::{ChatMessage, MessageStatus};

struct CacheEntry {
    messages: VecDeque<ChatMessage>,
    last_write: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.last_write.elapsed() <= ttl
    }

    fn find_mut(&mut self, id: i64) -> Option<&mut ChatMessage> {
        self.messages.iter_mut().find(|m| m.id == id)
    }
}

/// Bounded by-ID index evicting the least recently used entry.
struct LruIndex {
    entries: HashMap<i64, (ChatMessage, u64)>,
    order: BTreeMap<u64, i64>,
    tick: u64,
    capacity: usize,
}

impl LruIndex {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            tick: 0,
            capacity,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, id: i64) -> Option<&mut ChatMessage> {
        let tick = self.next_tick();
        let (_, used) = self.entries.get_mut(&id)?;
        self.order.remove(&*used);
        *used = tick;
        self.order.insert(tick, id);
        self.entries.get_mut(&id).map(|(msg, _)| msg)
    }

    fn insert(&mut self, message: ChatMessage) {
        let id = message.id;
        let tick = self.next_tick();
        if let Some((_, old)) = self.entries.insert(id, (message, tick)) {
            self.order.remove(&old);
        }
        self.order.insert(tick, id);

        while self.entries.len() > self.capacity {
            let Some((_, evicted)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&evicted);
        }
    }

    fn remove(&mut self, id: i64) {
        if let Some((_, tick)) = self.entries.remove(&id) {
            self.order.remove(&tick);
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// Hit/miss counters and occupancy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub conversations: usize,
    pub indexed_messages: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// LRU/TTL cache of conversation history.
pub struct MessageCache {
    conversations: DashMap<String, CacheEntry>,
    index: Mutex<LruIndex>,
    max_per_conversation: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MessageCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            conversations: DashMap::new(),
            index: Mutex::new(LruIndex::new(config.max_indexed_messages.max(1))),
            max_per_conversation: config.max_per_conversation.max(1),
            ttl: config.ttl(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Override the entry time-to-live.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn index(&self) -> MutexGuard<'_, LruIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, hit: bool) {
        let counter = if hit { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Cached slice for `conversation_id`, newest first, or `None` on miss.
    pub fn get_conversation(&self, conversation_id: &str) -> Option<Vec<ChatMessage>> {
        self.read_fresh(conversation_id, |entry| {
            entry.messages.iter().cloned().collect()
        })
    }

    /// Cached messages strictly newer than `since`. An empty vector is still a hit.
    pub fn get_since(
        &self,
        conversation_id: &str,
        since: DateTime<Utc>,
    ) -> Option<Vec<ChatMessage>> {
        self.read_fresh(conversation_id, |entry| {
            entry
                .messages
                .iter()
                .filter(|m| m.timestamp > since)
                .cloned()
                .collect()
        })
    }

    fn read_fresh<T>(
        &self,
        conversation_id: &str,
        read: impl FnOnce(&CacheEntry) -> T,
    ) -> Option<T> {
        let result = self
            .conversations
            .get(conversation_id)
            .and_then(|entry| entry.is_fresh(self.ttl).then(|| read(&entry)));
        if result.is_none() {
            self.conversations
                .remove_if(conversation_id, |_, entry| !entry.is_fresh(self.ttl));
        }
        self.record(result.is_some());
        result
    }

    /// Replace a conversation's slice with the newest messages of `messages`.
    ///
    /// `messages` is expected newest first, as returned by the store.
    pub fn put(&self, conversation_id: &str, messages: Vec<ChatMessage>) {
        let slice: VecDeque<ChatMessage> = messages
            .into_iter()
            .take(self.max_per_conversation)
            .collect();
        {
            let mut index = self.index();
            for message in &slice {
                index.insert(message.clone());
            }
        }
        debug!(conversation_id, count = slice.len(), "Cached conversation");
        self.conversations.insert(
            conversation_id.to_owned(),
            CacheEntry {
                messages: slice,
                last_write: Instant::now(),
            },
        );
    }

    /// Record a new or updated message.
    ///
    /// The conversation slice is only touched when it is already cached.
    pub fn add_message(&self, message: &ChatMessage) {
        self.index().insert(message.clone());

        if let Some(mut entry) = self.conversations.get_mut(&message.conversation_id) {
            if let Some(existing) = entry.find_mut(message.id) {
                *existing = message.clone();
            } else {
                entry.messages.push_front(message.clone());
                entry.messages.truncate(self.max_per_conversation);
            }
            entry.last_write = Instant::now();
        }
    }

    pub fn get_by_id(&self, id: i64) -> Option<ChatMessage> {
        let found = self.index().touch(id).map(|m| m.clone());
        self.record(found.is_some());
        found
    }

    /// Set the read flag on the cached copies. Returns whether the ID was cached.
    pub fn update_status(&self, id: i64, is_read: bool) -> bool {
        self.mutate(id, |m| m.is_read = is_read)
    }

    /// Set the delivery status on the cached copies. Returns whether the ID was cached.
    pub fn update_delivery(&self, id: i64, status: MessageStatus) -> bool {
        self.mutate(id, |m| m.status = status)
    }

    fn mutate(&self, id: i64, apply: impl Fn(&mut ChatMessage)) -> bool {
        let conversation = {
            let mut index = self.index();
            let Some(message) = index.touch(id) else {
                return false;
            };
            apply(message);
            message.conversation_id.clone()
        };
        if let Some(mut entry) = self.conversations.get_mut(&conversation) {
            if let Some(message) = entry.find_mut(id) {
                apply(message);
            }
        }
        true
    }

    pub fn clear_conversation(&self, conversation_id: &str) {
        if let Some((_, entry)) = self.conversations.remove(conversation_id) {
            let mut index = self.index();
            for message in &entry.messages {
                index.remove(message.id);
            }
        }
    }

    pub fn clear_all(&self) {
        self.conversations.clear();
        self.index().clear();
    }

    /// Drop expired conversation slices. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let before = self.conversations.len();
        self.conversations.retain(|_, entry| entry.is_fresh(self.ttl));
        before.saturating_sub(self.conversations.len())
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };
        CacheStats {
            conversations: self.conversations.len(),
            indexed_messages: self.index().entries.len(),
            hits,
            misses,
            hit_rate,
        }
    }

    /// Periodically sweep expired entries until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = cache.sweep_expired();
                        if removed > 0 {
                            info!(removed, "Expired cached conversations");
                        }
                    }
                }
            }
            debug!("Cache sweeper stopped");
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn msg(id: i64, text: &str) -> ChatMessage {
        ChatMessage::new(id, "alice", "bob", text, Utc::now())
    }

    fn small_cache() -> MessageCache {
        MessageCache::new(&CacheConfig {
            max_per_conversation: 3,
            max_indexed_messages: 4,
            ttl_secs: 60,
            sweep_interval_secs: 60,
        })
    }

    #[test]
    fn miss_then_put_then_hit() {
        let cache = small_cache();
        assert!(cache.get_conversation("alice_bob").is_none());
        cache.put("alice_bob", vec![msg(2, "b"), msg(1, "a")]);
        let got = cache.get_conversation("alice_bob").unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].id, 2);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn put_keeps_only_newest() {
        let cache = small_cache();
        cache.put(
            "alice_bob",
            (1..=5).rev().map(|i| msg(i, "x")).collect(),
        );
        let ids: Vec<_> = cache
            .get_conversation("alice_bob")
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, [5, 4, 3]);
    }

    #[test]
    fn add_message_prepends_and_caps() {
        let cache = small_cache();
        cache.put("alice_bob", vec![msg(3, "c"), msg(2, "b"), msg(1, "a")]);
        cache.add_message(&msg(4, "d"));
        let ids: Vec<_> = cache
            .get_conversation("alice_bob")
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, [4, 3, 2]);

        // Re-adding replaces rather than duplicates.
        let mut updated = msg(4, "d");
        updated.status = MessageStatus::Delivered;
        cache.add_message(&updated);
        let got = cache.get_conversation("alice_bob").unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].status, MessageStatus::Delivered);
    }

    #[test]
    fn add_without_entry_only_indexes() {
        let cache = small_cache();
        cache.add_message(&msg(9, "solo"));
        assert!(cache.get_conversation("alice_bob").is_none());
        assert_eq!(cache.get_by_id(9).unwrap().content, "solo");
    }

    #[test]
    fn index_evicts_least_recently_used() {
        let cache = small_cache();
        for id in 1..=4 {
            cache.add_message(&msg(id, "x"));
        }
        // Touch 1 so 2 becomes the oldest.
        assert!(cache.get_by_id(1).is_some());
        cache.add_message(&msg(5, "x"));
        assert!(cache.get_by_id(2).is_none());
        assert!(cache.get_by_id(1).is_some());
        assert!(cache.get_by_id(5).is_some());
    }

    #[test]
    fn status_updates_reach_slice_and_index() {
        let cache = small_cache();
        cache.put("alice_bob", vec![msg(1, "a")]);
        assert!(cache.update_status(1, true));
        assert!(cache.update_delivery(1, MessageStatus::Failed));
        assert!(!cache.update_status(99, true));

        let cached = cache.get_conversation("alice_bob").unwrap();
        assert!(cached[0].is_read);
        assert_eq!(cached[0].status, MessageStatus::Failed);
        assert_eq!(cache.get_by_id(1).unwrap().status, MessageStatus::Failed);
    }

    #[test]
    fn get_since_filters_strictly_after() {
        let cache = small_cache();
        let base = Utc::now();
        let mut old = msg(1, "old");
        old.timestamp = base - chrono::Duration::seconds(10);
        let mut new = msg(2, "new");
        new.timestamp = base + chrono::Duration::seconds(10);
        cache.put("alice_bob", vec![new, old]);

        let since = cache.get_since("alice_bob", base).unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].content, "new");
        let none = cache
            .get_since("alice_bob", base + chrono::Duration::seconds(60))
            .unwrap();
        assert!(none.is_empty());
        assert!(cache.get_since("carol_dave", base).is_none());
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = small_cache().with_ttl(Duration::from_millis(50));
        cache.put("alice_bob", vec![msg(1, "a")]);
        assert!(cache.get_conversation("alice_bob").is_some());
        std::thread::sleep(Duration::from_millis(80));
        assert!(cache.get_conversation("alice_bob").is_none());
        assert_eq!(cache.stats().conversations, 0);
    }

    #[test]
    fn sweep_and_clear() {
        let cache = small_cache().with_ttl(Duration::from_millis(20));
        cache.put("alice_bob", vec![msg(1, "a")]);
        cache.put("carol_dave", vec![msg(2, "b")]);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.sweep_expired(), 2);

        let cache = small_cache();
        cache.put("alice_bob", vec![msg(1, "a")]);
        cache.put("carol_dave", vec![msg(2, "b")]);
        cache.clear_conversation("alice_bob");
        assert!(cache.get_by_id(1).is_none());
        assert!(cache.get_by_id(2).is_some());
        cache.clear_all();
        assert_eq!(cache.stats().conversations, 0);
        assert_eq!(cache.stats().indexed_messages, 0);
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancel() {
        let cache = Arc::new(small_cache());
        let cancel = CancellationToken::new();
        let handle = cache.spawn_sweeper(Duration::from_millis(10), cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
