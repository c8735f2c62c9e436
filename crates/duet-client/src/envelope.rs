//! JSON payload carried in the content field of `PRIVATE` lines.
//!
//! The relay never looks inside. Content that is not an envelope is plain
//! text from a client that does not sequence.

use chrono::{DateTime, Utc};
use duet_core::message::ChatMessage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Envelope {
    Chat {
        id: i64,
        seq: i64,
        sent_at: DateTime<Utc>,
        text: String,
    },
    Ack {
        id: i64,
    },
}

impl Envelope {
    pub fn chat(message: &ChatMessage) -> Self {
        Self::Chat {
            id: message.id,
            seq: message.sequence_number,
            sent_at: message.timestamp,
            text: message.content.clone(),
        }
    }

    pub const fn ack(id: i64) -> Self {
        Self::Ack { id }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// `None` for anything that is not an envelope, including plain text.
    pub fn decode(content: &str) -> Option<Self> {
        if !content.trim_start().starts_with('{') {
            return None;
        }
        serde_json::from_str(content).ok()
    }
}
