//! Persistent message history.
//!
//! The store is the source of truth behind the message cache. Callers treat
//! every error as "no history" on reads and log-and-continue on writes.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::PoolConfig;
use crate::db::{ConnectionPool, DatabaseError, SqliteConnectionManager, SqlitePool};
use crate::message::{ChatMessage, MessageStatus};

/// Durable storage for chat messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Up to `limit` most recent messages of a conversation, newest first.
    async fn load_history(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, DatabaseError>;

    /// Insert or update a message; returns its ID.
    async fn persist(&self, message: &ChatMessage) -> Result<i64, DatabaseError>;

    async fn update_status(&self, id: i64, status: MessageStatus) -> Result<(), DatabaseError>;

    async fn mark_read(&self, id: i64) -> Result<(), DatabaseError>;

    /// Highest sequence number `sender` has used in a conversation.
    async fn last_sequence(
        &self,
        conversation_id: &str,
        sender: &str,
    ) -> Result<Option<i64>, DatabaseError>;
}

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: i64,
    conversation_id: String,
    sender: String,
    receiver: String,
    content: String,
    sent_at: i64,
    sequence_number: i64,
    status: String,
    is_read: i64,
}

impl TryFrom<MessageRow> for ChatMessage {
    type Error = DatabaseError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let timestamp = DateTime::<Utc>::from_timestamp_millis(row.sent_at).ok_or_else(|| {
            DatabaseError::Query(format!("message {} has invalid timestamp", row.id))
        })?;
        let status = row
            .status
            .parse::<MessageStatus>()
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(Self {
            id: row.id,
            sender: row.sender,
            receiver: row.receiver,
            content: row.content,
            timestamp,
            conversation_id: row.conversation_id,
            sequence_number: row.sequence_number,
            status,
            is_read: row.is_read != 0,
        })
    }
}

/// [`MessageStore`] backed by `SQLite` through the bounded connection pool.
#[derive(Clone)]
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    /// Open (or create) the database file and run migrations.
    pub async fn open(path: &Path, config: &PoolConfig) -> Result<Self, DatabaseError> {
        let manager = SqliteConnectionManager::file(path)?;
        let pool = ConnectionPool::new(manager, config).await;
        let store = Self { pool };
        store.run_migrations().await?;
        info!(path = %path.display(), "Message store opened");
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let mut conn = self.pool.checkout().await?;
        sqlx::migrate!("./migrations")
            .run(&mut *conn)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        self.pool.release(conn).await;
        debug!("Message store migrations complete");
        Ok(())
    }

    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.shutdown().await;
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn load_history(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, DatabaseError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut conn = self.pool.checkout().await?;
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE conversation_id = ?
             ORDER BY sent_at DESC, id DESC LIMIT ?",
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?;
        self.pool.release(conn).await;

        rows.into_iter().map(ChatMessage::try_from).collect()
    }

    async fn persist(&self, message: &ChatMessage) -> Result<i64, DatabaseError> {
        let mut conn = self.pool.checkout().await?;
        sqlx::query(
            "INSERT INTO messages
                (id, conversation_id, sender, receiver, content, sent_at, sequence_number, status, is_read)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                sequence_number = excluded.sequence_number,
                status = excluded.status,
                is_read = MAX(messages.is_read, excluded.is_read)",
        )
        .bind(message.id)
        .bind(&message.conversation_id)
        .bind(&message.sender)
        .bind(&message.receiver)
        .bind(&message.content)
        .bind(message.timestamp.timestamp_millis())
        .bind(message.sequence_number)
        .bind(message.status.as_str())
        .bind(i64::from(message.is_read))
        .execute(&mut *conn)
        .await?;
        self.pool.release(conn).await;
        Ok(message.id)
    }

    async fn update_status(&self, id: i64, status: MessageStatus) -> Result<(), DatabaseError> {
        let mut conn = self.pool.checkout().await?;
        let result = sqlx::query("UPDATE messages SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&mut *conn)
            .await?;
        self.pool.release(conn).await;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("message {id}")));
        }
        Ok(())
    }

    async fn mark_read(&self, id: i64) -> Result<(), DatabaseError> {
        let mut conn = self.pool.checkout().await?;
        let result = sqlx::query("UPDATE messages SET is_read = 1 WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        self.pool.release(conn).await;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("message {id}")));
        }
        Ok(())
    }

    async fn last_sequence(
        &self,
        conversation_id: &str,
        sender: &str,
    ) -> Result<Option<i64>, DatabaseError> {
        let mut conn = self.pool.checkout().await?;
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(sequence_number) FROM messages WHERE conversation_id = ? AND sender = ?",
        )
        .bind(conversation_id)
        .bind(sender)
        .fetch_one(&mut *conn)
        .await?;
        self.pool.release(conn).await;
        Ok(max)
    }
}

/// Store used when no database is configured: no history, writes vanish.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStore;

#[async_trait]
impl MessageStore for NullStore {
    async fn load_history(&self, _: &str, _: usize) -> Result<Vec<ChatMessage>, DatabaseError> {
        Ok(Vec::new())
    }

    async fn persist(&self, message: &ChatMessage) -> Result<i64, DatabaseError> {
        Ok(message.id)
    }

    async fn update_status(&self, _: i64, _: MessageStatus) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn mark_read(&self, _: i64) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn last_sequence(&self, _: &str, _: &str) -> Result<Option<i64>, DatabaseError> {
        Ok(None)
    }
}
