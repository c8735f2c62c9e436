//! Chat message data model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::ids::conversation_id;

/// Receiver name that marks a message as a broadcast to every online user.
pub const BROADCAST_RECEIVER: &str = "all";

/// Delivery lifecycle of an outbound message.
///
/// `Sending` → `Sent` (handed to transport) → `Delivered` (acknowledged), or
/// `Failed` once retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Failed,
}

impl MessageStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sending => "SENDING",
            Self::Sent => "SENT",
            Self::Delivered => "DELIVERED",
            Self::Failed => "FAILED",
        }
    }

    /// Whether no further transitions are expected.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SENDING" => Ok(Self::Sending),
            "SENT" => Ok(Self::Sent),
            "DELIVERED" => Ok(Self::Delivered),
            "FAILED" => Ok(Self::Failed),
            other => Err(Error::Protocol(format!("unknown message status: {other}"))),
        }
    }
}

/// The unit of communication between two users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Globally unique ID, monotonically increasing within a node.
    pub id: i64,
    pub sender: String,
    /// Receiver username, or [`BROADCAST_RECEIVER`].
    pub receiver: String,
    pub content: String,
    /// Client-local send time.
    pub timestamp: DateTime<Utc>,
    /// Order-independent key of the {sender, receiver} pair. Empty for broadcasts.
    pub conversation_id: String,
    /// Position in the conversation's total order; 0 when unsequenced.
    pub sequence_number: i64,
    pub status: MessageStatus,
    pub is_read: bool,
}

impl ChatMessage {
    /// Create an unsequenced message in the `Sending` state.
    pub fn new(
        id: i64,
        sender: impl Into<String>,
        receiver: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let sender = sender.into();
        let receiver = receiver.into();
        let conversation_id = if receiver == BROADCAST_RECEIVER {
            String::new()
        } else {
            conversation_id(&sender, &receiver)
        };
        Self {
            id,
            sender,
            receiver,
            content: content.into(),
            timestamp,
            conversation_id,
            sequence_number: 0,
            status: MessageStatus::Sending,
            is_read: false,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver == BROADCAST_RECEIVER
    }

    /// Whether the message carries a position in a conversation's order.
    pub fn is_sequenced(&self) -> bool {
        !self.conversation_id.is_empty() && self.sequence_number > 0
    }

    /// The other participant, seen from `me`.
    pub fn peer_of(&self, me: &str) -> &str {
        if self.sender == me {
            &self.receiver
        } else {
            &self.sender
        }
    }
}
