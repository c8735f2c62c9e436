//! Message identifiers and conversation keys.
//!
//! IDs are 64-bit and laid out as
//! `[42-bit millisecond timestamp][10-bit node id][12-bit per-conversation counter]`.
//! Ordering across nodes is by timestamp only; per-conversation ordering is
//! the sequencing service's job, not this module's.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;

use crate::error::{Error, Result};

/// Separator used when joining the two usernames of a conversation.
pub const CONVERSATION_SEPARATOR: char = '_';

const TIMESTAMP_BITS: u32 = 42;
const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;

const TIMESTAMP_MASK: i64 = (1 << TIMESTAMP_BITS) - 1;
const NODE_MASK: i64 = (1 << NODE_BITS) - 1;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;

const NODE_SHIFT: u32 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + NODE_BITS;

/// Smallest valid node ID.
pub const MIN_NODE_ID: u16 = 1;
/// Largest valid node ID.
pub const MAX_NODE_ID: u16 = 1023;

/// Generates message IDs for a single node.
#[derive(Debug)]
pub struct MessageIdGenerator {
    node_id: u16,
    counters: DashMap<String, AtomicU64>,
}

impl MessageIdGenerator {
    /// Create a generator for `node_id`, which must lie in `[1, 1023]`.
    pub fn new(node_id: u16) -> Result<Self> {
        if !(MIN_NODE_ID..=MAX_NODE_ID).contains(&node_id) {
            return Err(Error::Config(format!(
                "node id {node_id} out of range [{MIN_NODE_ID}, {MAX_NODE_ID}]"
            )));
        }
        Ok(Self {
            node_id,
            counters: DashMap::new(),
        })
    }

    pub const fn node_id(&self) -> u16 {
        self.node_id
    }

    /// Allocate a fresh ID for a message in `conversation`.
    ///
    /// Every call returns a new value. The low 12 bits wrap per conversation.
    pub fn generate(&self, conversation: &str) -> i64 {
        let seq = self.next_counter(conversation);
        compose(Utc::now().timestamp_millis(), self.node_id, seq)
    }

    fn next_counter(&self, conversation: &str) -> u64 {
        if let Some(counter) = self.counters.get(conversation) {
            return counter.fetch_add(1, Ordering::Relaxed);
        }
        self.counters
            .entry(conversation.to_owned())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }
}

#[allow(clippy::cast_possible_wrap)]
fn compose(timestamp_ms: i64, node_id: u16, seq: u64) -> i64 {
    ((timestamp_ms & TIMESTAMP_MASK) << TIMESTAMP_SHIFT)
        | ((i64::from(node_id) & NODE_MASK) << NODE_SHIFT)
        | ((seq as i64) & SEQUENCE_MASK)
}

/// Millisecond timestamp encoded in `id` (lower 42 bits of the epoch millis).
pub const fn extract_timestamp(id: i64) -> i64 {
    (id >> TIMESTAMP_SHIFT) & TIMESTAMP_MASK
}

/// Node ID encoded in `id`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub const fn extract_node_id(id: i64) -> u16 {
    ((id >> NODE_SHIFT) & NODE_MASK) as u16
}

/// Per-conversation counter bits of `id`.
pub const fn extract_sequence(id: i64) -> i64 {
    id & SEQUENCE_MASK
}

/// Default node ID for `username`, stable across runs and platforms.
///
/// Two peers whose IDs collide could overwrite each other's rows, so an
/// explicit, unique `node_id` is still preferable when peers are known.
pub fn node_id_for(username: &str) -> u16 {
    // FNV-1a
    let hash = username
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
            (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
        });
    let span = u64::from(MAX_NODE_ID - MIN_NODE_ID + 1);
    // `hash % span` is below 1023, so the cast cannot truncate.
    #[allow(clippy::cast_possible_truncation)]
    let offset = (hash % span) as u16;
    MIN_NODE_ID + offset
}

/// Order-independent conversation key for two usernames.
pub fn conversation_id(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    format!("{first}{CONVERSATION_SEPARATOR}{second}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn derived_node_ids_are_stable_and_distinct_per_user() {
        assert_eq!(node_id_for("alice"), 432);
        assert_eq!(node_id_for("bob"), 967);
        assert_eq!(node_id_for("carol"), 710);
        assert_eq!(node_id_for(""), 297);

        // Same millisecond, same counter: peers still get different IDs.
        let alice = MessageIdGenerator::new(node_id_for("alice")).unwrap();
        let bob = MessageIdGenerator::new(node_id_for("bob")).unwrap();
        let conversation = conversation_id("alice", "bob");
        let (a, b) = (alice.generate(&conversation), bob.generate(&conversation));
        assert_ne!(a, b);
        assert_eq!(extract_node_id(a), 432);
        assert_eq!(extract_node_id(b), 967);
    }

    #[test]
    fn conversation_id_is_symmetric() {
        assert_eq!(conversation_id("alice", "bob"), conversation_id("bob", "alice"));
        assert_eq!(conversation_id("alice", "bob"), "alice_bob");
    }

    #[test]
    fn rejects_out_of_range_node() {
        assert!(MessageIdGenerator::new(0).is_err());
        assert!(MessageIdGenerator::new(1024).is_err());
        assert!(MessageIdGenerator::new(1).is_ok());
        assert!(MessageIdGenerator::new(1023).is_ok());
    }

    #[test]
    fn generated_ids_decode_to_their_parts() {
        let generator = MessageIdGenerator::new(42).unwrap();
        let before = Utc::now().timestamp_millis() & TIMESTAMP_MASK;
        let first = generator.generate("alice_bob");
        let second = generator.generate("alice_bob");
        let after = Utc::now().timestamp_millis() & TIMESTAMP_MASK;

        assert_eq!(extract_node_id(first), 42);
        assert_eq!(extract_sequence(first), 0);
        assert_eq!(extract_sequence(second), 1);
        let ts = extract_timestamp(first);
        assert!(ts >= before && ts <= after);
        assert_ne!(first, second);
    }

    #[test]
    fn counters_are_per_conversation() {
        let generator = MessageIdGenerator::new(7).unwrap();
        generator.generate("a_b");
        generator.generate("a_b");
        let other = generator.generate("c_d");
        assert_eq!(extract_sequence(other), 0);
    }

    #[test]
    fn sequence_bits_wrap() {
        let id = compose(1, 1, 4096 + 5);
        assert_eq!(extract_sequence(id), 5);
        assert_eq!(extract_timestamp(id), 1);
    }

    #[test]
    fn ids_increase_across_milliseconds() {
        let generator = MessageIdGenerator::new(3).unwrap();
        let first = generator.generate("x_y");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = generator.generate("x_y");
        assert!(second > first);
    }
}
