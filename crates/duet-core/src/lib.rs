//! Duet Core Library
//!
//! Shared functionality for Duet components:
//! - Chat message model and conversation identifiers
//! - Message ID generation
//! - Line-delimited wire protocol codec
//! - Bounded storage connection pool and message store
//! - Read-aside message cache
//! - Configuration resolution and common error types

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod ids;
pub mod message;
pub mod protocol;
pub mod store;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use ids::{MessageIdGenerator, conversation_id};
pub use message::{ChatMessage, MessageStatus};
