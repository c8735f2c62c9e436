//! Heartbeat liveness checker.
//!
//! TCP alone does not notice a peer that vanished without a FIN, so the relay
//! periodically closes connections that have been silent for too long.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::dispatcher::Dispatcher;
use crate::registry::ConnectionRegistry;

/// Close and deregister every connection silent for longer than `threshold`.
///
/// Returns the number evicted. Presence is re-broadcast when any were.
pub fn evict_stale(
    registry: &ConnectionRegistry,
    dispatcher: &Dispatcher,
    threshold: Duration,
) -> usize {
    let mut evicted = 0;
    for conn in registry.stale(threshold) {
        warn!(
            username = %conn.username,
            silent_for = ?conn.heartbeat_age(),
            "Heartbeat timeout, closing connection"
        );
        conn.close();
        if registry.unregister(&conn.username, conn.id).is_some() {
            evicted += 1;
        }
    }
    if evicted > 0 {
        dispatcher.presence();
    }
    evicted
}

/// Run [`evict_stale`] every `every` until `cancel` fires.
pub fn spawn_heartbeat_checker(
    registry: ConnectionRegistry,
    dispatcher: Dispatcher,
    every: Duration,
    threshold: Duration,
    tracker: &TaskTracker,
    cancel: CancellationToken,
) {
    tracker.spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // Skip first immediate tick
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    evict_stale(&registry, &dispatcher, threshold);
                }
            }
        }
        debug!("Heartbeat checker stopped");
    });
}
