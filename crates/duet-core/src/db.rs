//! Bounded storage connection pool.
//!
//! [`ConnectionPool`] hands out at most `max_size` connections at a time.
//! Each checked-out connection holds a semaphore permit, so callers beyond
//! the limit wait (up to `checkout_timeout`) until one is released. Idle
//! connections are validated before reuse and discarded when stale.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{ConnectOptions, Connection, SqliteConnection};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;

/// Database errors shared by the pool and the message store.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Connection pool is shut down")]
    PoolClosed,

    #[error("Timed out after {0:?} waiting for a pooled connection")]
    PoolTimeout(Duration),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        Self::Query(e.to_string())
    }
}

/// Creates, validates and closes connections on behalf of the pool.
#[async_trait]
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> Result<Self::Connection, DatabaseError>;

    /// Lightweight round-trip; `false` means the connection must be discarded.
    async fn is_valid(&self, conn: &mut Self::Connection) -> bool;

    async fn close(&self, conn: Self::Connection);
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max: usize,
}

struct PoolInner<M: ManageConnection> {
    manager: M,
    idle: Mutex<VecDeque<M::Connection>>,
    semaphore: Arc<Semaphore>,
    live: AtomicUsize,
    closed: AtomicBool,
    max_size: usize,
    checkout_timeout: Duration,
}

impl<M: ManageConnection> PoolInner<M> {
    fn idle(&self) -> MutexGuard<'_, VecDeque<M::Connection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve room for one more live connection, if under the cap.
    fn reserve_slot(&self) -> bool {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.max_size).then_some(live + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    /// Push back into the idle queue; hands the connection back if it does not fit.
    fn push_idle(&self, conn: M::Connection) -> Option<M::Connection> {
        if self.closed.load(Ordering::Acquire) {
            return Some(conn);
        }
        let mut idle = self.idle();
        if idle.len() >= self.max_size {
            return Some(conn);
        }
        idle.push_back(conn);
        None
    }
}

/// Bounded pool of reusable connections.
pub struct ConnectionPool<M: ManageConnection> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ManageConnection> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ManageConnection> ConnectionPool<M> {
    /// Build the pool and open `initial_size` connections.
    ///
    /// Warm-up failures are logged and the pool starts with fewer connections.
    pub async fn new(manager: M, config: &PoolConfig) -> Self {
        let max_size = config.max_size.max(1);
        let initial = config.initial_size.min(max_size);
        let inner = Arc::new(PoolInner {
            manager,
            idle: Mutex::new(VecDeque::with_capacity(max_size)),
            semaphore: Arc::new(Semaphore::new(max_size)),
            live: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            max_size,
            checkout_timeout: Duration::from_secs(config.checkout_timeout_secs),
        });

        let mut opened = 0;
        for attempt in 0..initial {
            match inner.manager.connect().await {
                Ok(conn) => {
                    inner.live.fetch_add(1, Ordering::AcqRel);
                    inner.idle().push_back(conn);
                    opened += 1;
                }
                Err(e) => warn!(attempt, error = %e, "Failed to open connection during pool warm-up"),
            }
        }
        info!(opened, requested = initial, max_size, "Connection pool created");

        Self { inner }
    }

    /// Check out a connection, waiting while the pool is at capacity.
    pub async fn checkout(&self) -> Result<PooledConnection<M>, DatabaseError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(DatabaseError::PoolClosed);
        }

        let acquire = Arc::clone(&self.inner.semaphore).acquire_owned();
        let permit = match tokio::time::timeout(self.inner.checkout_timeout, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DatabaseError::PoolClosed),
            Err(_) => {
                warn!(
                    timeout = ?self.inner.checkout_timeout,
                    "Connection pool checkout timed out"
                );
                return Err(DatabaseError::PoolTimeout(self.inner.checkout_timeout));
            }
        };

        loop {
            let candidate = self.inner.idle().pop_front();
            if let Some(mut conn) = candidate {
                if self.inner.manager.is_valid(&mut conn).await {
                    return Ok(PooledConnection::new(conn, Arc::clone(&self.inner), permit));
                }
                debug!("Discarding invalid idle connection");
                self.inner.manager.close(conn).await;
                self.inner.release_slot();
                continue;
            }

            if self.inner.reserve_slot() {
                return match self.inner.manager.connect().await {
                    Ok(conn) => Ok(PooledConnection::new(conn, Arc::clone(&self.inner), permit)),
                    Err(e) => {
                        self.inner.release_slot();
                        Err(e)
                    }
                };
            }

            // At the cap with nothing idle: another holder is mid-release.
            tokio::task::yield_now().await;
        }
    }

    /// Return a connection, validating it first.
    pub async fn release(&self, mut conn: PooledConnection<M>) {
        let Some(mut raw) = conn.conn.take() else {
            return;
        };
        if !self.inner.manager.is_valid(&mut raw).await {
            debug!("Closing invalid connection on release");
            self.inner.manager.close(raw).await;
            self.inner.release_slot();
            return;
        }
        if let Some(extra) = self.inner.push_idle(raw) {
            self.inner.manager.close(extra).await;
            self.inner.release_slot();
        }
        // `conn` drops here, returning its permit after the push.
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            live: self.inner.live.load(Ordering::Acquire),
            idle: self.inner.idle().len(),
            in_use: self.inner.max_size - self.inner.semaphore.available_permits(),
            max: self.inner.max_size,
        }
    }

    /// Close idle connections and refuse further checkouts.
    ///
    /// Connections still checked out are closed as they come back.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.semaphore.close();
        let drained: Vec<_> = self.inner.idle().drain(..).collect();
        let closed = drained.len();
        for conn in drained {
            self.inner.manager.close(conn).await;
            self.inner.release_slot();
        }
        info!(closed, "Connection pool shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Dropping it without [`ConnectionPool::release`] puts it back in the idle
/// queue unvalidated; it is validated on the next checkout.
pub struct PooledConnection<M: ManageConnection> {
    conn: Option<M::Connection>,
    pool: Arc<PoolInner<M>>,
    _permit: OwnedSemaphorePermit,
}

impl<M: ManageConnection> PooledConnection<M> {
    fn new(conn: M::Connection, pool: Arc<PoolInner<M>>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            conn: Some(conn),
            pool,
            _permit: permit,
        }
    }
}

impl<M: ManageConnection> Deref for PooledConnection<M> {
    type Target = M::Connection;

    #[allow(clippy::expect_used)]
    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<M: ManageConnection> DerefMut for PooledConnection<M> {
    #[allow(clippy::expect_used)]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<M: ManageConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Some(rejected) = self.pool.push_idle(conn) {
                drop(rejected);
                self.pool.release_slot();
            }
        }
    }
}

/// [`ManageConnection`] over single `SQLite` connections.
#[derive(Debug, Clone)]
pub struct SqliteConnectionManager {
    options: SqliteConnectOptions,
}

const PING_TIMEOUT: Duration = Duration::from_secs(2);

impl SqliteConnectionManager {
    /// Manager for a database file, created on first connect.
    pub fn file(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io(e.to_string()))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        Ok(Self { options })
    }
}

#[async_trait]
impl ManageConnection for SqliteConnectionManager {
    type Connection = SqliteConnection;

    async fn connect(&self) -> Result<SqliteConnection, DatabaseError> {
        self.options
            .connect()
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))
    }

    async fn is_valid(&self, conn: &mut SqliteConnection) -> bool {
        matches!(tokio::time::timeout(PING_TIMEOUT, conn.ping()).await, Ok(Ok(())))
    }

    async fn close(&self, conn: SqliteConnection) {
        if let Err(e) = conn.close().await {
            debug!(error = %e, "Error closing sqlite connection");
        }
    }
}

/// Pool of `SQLite` connections.
pub type SqlitePool = ConnectionPool<SqliteConnectionManager>;
