//! Duet Client Library
//!
//! Client-side delivery machinery:
//! - Sequencing: per-conversation sequence numbers for outbound messages
//! - Ordering: reorder buffer releasing inbound messages in sequence order
//! - Reliability: ack tracking, bounded retry, offline queues
//! - Relay connection with heartbeat and reconnect backoff
//! - `ChatClient` facade tying them to the cache and store

pub mod client;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod input;
pub mod ordering;
pub mod reliability;
pub mod sequencing;

pub use client::ChatClient;
pub use connection::{ConnectionState, ReconnectPolicy};
pub use error::ClientError;
pub use ordering::DisplayCallback;
pub use reliability::DeliveryUpdate;
