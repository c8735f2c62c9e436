//! In-memory presence registry.
//!
//! Maps username → live connection. Registration is an atomic
//! insert-if-absent, so two concurrent logins for the same name cannot both
//! succeed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use duet_core::message::BROADCAST_RECEIVER;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{info, warn};

use crate::error::RelayError;

const MAX_USERNAME_LEN: usize = 32;

/// An authenticated client connection.
pub struct ClientConnection {
    /// Distinguishes successive connections that reuse a username.
    pub id: u64,
    pub username: String,
    pub addr: SocketAddr,
    outbound: mpsc::Sender<String>,
    connected_at: Instant,
    /// Milliseconds after `connected_at` of the last heartbeat.
    last_heartbeat_ms: AtomicU64,
    cancel: CancellationToken,
}

impl ClientConnection {
    /// Queue a line for the connection's writer.
    pub async fn send_line(
        &self,
        line: String,
        timeout: Duration,
    ) -> Result<(), mpsc::error::SendTimeoutError<String>> {
        self.outbound.send_timeout(line, timeout).await
    }

    /// Record a heartbeat now.
    #[allow(clippy::cast_possible_truncation)]
    pub fn touch(&self) {
        let elapsed = self.connected_at.elapsed().as_millis() as u64;
        self.last_heartbeat_ms.store(elapsed, Ordering::Release);
    }

    /// Time since the last heartbeat.
    pub fn heartbeat_age(&self) -> Duration {
        let last = Duration::from_millis(self.last_heartbeat_ms.load(Ordering::Acquire));
        self.connected_at.elapsed().saturating_sub(last)
    }

    /// Ask the connection's handler to shut it down.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

/// Thread-safe registry of authenticated connections.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<String, Arc<ClientConnection>>>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `username`, failing if it is already connected.
    pub fn register(
        &self,
        username: &str,
        addr: SocketAddr,
        outbound: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<Arc<ClientConnection>, RelayError> {
        validate_username(username)?;
        match self.connections.entry(username.to_owned()) {
            Entry::Occupied(_) => {
                warn!(username, %addr, "Rejected login for connected username");
                Err(RelayError::UsernameTaken(username.to_owned()))
            }
            Entry::Vacant(slot) => {
                let conn = Arc::new(ClientConnection {
                    id: self.next_id.fetch_add(1, Ordering::Relaxed),
                    username: username.to_owned(),
                    addr,
                    outbound,
                    connected_at: Instant::now(),
                    last_heartbeat_ms: AtomicU64::new(0),
                    cancel,
                });
                slot.insert(Arc::clone(&conn));
                info!(username, %addr, connection_id = conn.id, "Client registered");
                Ok(conn)
            }
        }
    }

    /// Remove the entry for `username` if it still belongs to connection `id`.
    pub fn unregister(&self, username: &str, id: u64) -> Option<Arc<ClientConnection>> {
        let removed = self
            .connections
            .remove_if(username, |_, conn| conn.id == id)
            .map(|(_, conn)| conn);
        if removed.is_some() {
            info!(username, connection_id = id, "Client unregistered");
        }
        removed
    }

    pub fn get(&self, username: &str) -> Option<Arc<ClientConnection>> {
        self.connections.get(username).map(|c| Arc::clone(c.value()))
    }

    pub fn is_online(&self, username: &str) -> bool {
        self.connections.contains_key(username)
    }

    /// All connected usernames, sorted.
    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Connected usernames other than `me`, sorted.
    pub fn usernames_except(&self, me: &str) -> Vec<String> {
        let mut names = self.usernames();
        names.retain(|n| n != me);
        names
    }

    /// Snapshot of every live connection.
    pub fn connections(&self) -> Vec<Arc<ClientConnection>> {
        self.connections.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Connections whose last heartbeat is older than `threshold`.
    pub fn stale(&self, threshold: Duration) -> Vec<Arc<ClientConnection>> {
        self.connections
            .iter()
            .filter(|e| e.value().heartbeat_age() > threshold)
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

/// Usernames must be non-empty, short, free of `,` and control characters,
/// and not the broadcast receiver name.
pub fn validate_username(name: &str) -> Result<(), RelayError> {
    let reason = if name.trim().is_empty() {
        "empty"
    } else if name.chars().count() > MAX_USERNAME_LEN {
        "too long"
    } else if name.contains(',') {
        "contains ','"
    } else if name.chars().any(char::is_control) {
        "contains control characters"
    } else if name == BROADCAST_RECEIVER {
        "reserved"
    } else {
        return Ok(());
    };
    Err(RelayError::InvalidUsername(format!("{name:?} {reason}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn register(registry: &ConnectionRegistry, name: &str) -> Result<Arc<ClientConnection>, RelayError> {
        let (tx, _rx) = mpsc::channel(4);
        registry.register(name, addr(), tx, CancellationToken::new())
    }

    #[test]
    fn register_and_lookup() {
        let registry = ConnectionRegistry::new();
        register(&registry, "bob").unwrap();
        register(&registry, "alice").unwrap();

        assert!(registry.is_online("alice"));
        assert!(!registry.is_online("carol"));
        assert_eq!(registry.usernames(), ["alice", "bob"]);
        assert_eq!(registry.usernames_except("alice"), ["bob"]);
        assert_eq!(registry.get("bob").unwrap().username, "bob");
    }

    #[test]
    fn duplicate_username_is_rejected() {
        let registry = ConnectionRegistry::new();
        register(&registry, "alice").unwrap();
        assert!(matches!(
            register(&registry, "alice"),
            Err(RelayError::UsernameTaken(_))
        ));
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn concurrent_logins_yield_one_winner() {
        let registry = ConnectionRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || register(&registry, "alice").is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn unregister_requires_matching_connection() {
        let registry = ConnectionRegistry::new();
        let first = register(&registry, "alice").unwrap();
        assert!(registry.unregister("alice", first.id + 100).is_none());
        assert!(registry.unregister("alice", first.id).is_some());
        assert!(registry.unregister("alice", first.id).is_none());

        let second = register(&registry, "alice").unwrap();
        assert_ne!(first.id, second.id);
        // A late cleanup for the old connection leaves the new one alone.
        assert!(registry.unregister("alice", first.id).is_none());
        assert!(registry.is_online("alice"));
    }

    #[test]
    fn stale_reports_silent_connections() {
        let registry = ConnectionRegistry::new();
        let conn = register(&registry, "alice").unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(registry.stale(Duration::from_millis(10)).len(), 1);
        conn.touch();
        assert!(registry.stale(Duration::from_millis(10)).is_empty());
    }

    #[test]
    fn username_rules() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("   ").is_err());
        assert!(validate_username("a,b").is_err());
        assert!(validate_username("a\tb").is_err());
        assert!(validate_username("all").is_err());
        assert!(validate_username(&"x".repeat(33)).is_err());
    }
}
