//! TCP accept loop and relay lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use duet_core::config::RelayConfig;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::RelayError;
use crate::handler::{RelayContext, handle_connection};
use crate::heartbeat::spawn_heartbeat_checker;
use crate::registry::ConnectionRegistry;

/// Upper bound on waiting for connection tasks after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A bound relay, ready to [`run`](Self::run).
pub struct RelayServer {
    listener: TcpListener,
    config: RelayConfig,
    registry: ConnectionRegistry,
}

impl RelayServer {
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        info!(addr = %listener.local_addr()?, "Relay listening");
        Ok(Self {
            listener,
            config,
            registry: ConnectionRegistry::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> ConnectionRegistry {
        self.registry.clone()
    }

    /// Accept connections until `shutdown` fires, then join every task.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), RelayError> {
        let tracker = TaskTracker::new();
        let dispatcher = Dispatcher::spawn(
            self.registry.clone(),
            &self.config,
            &tracker,
            shutdown.clone(),
        );
        spawn_heartbeat_checker(
            self.registry.clone(),
            dispatcher.clone(),
            self.config.heartbeat_check_interval(),
            self.config.heartbeat_timeout(),
            &tracker,
            shutdown.clone(),
        );
        spawn_presence_logger(
            self.registry.clone(),
            Duration::from_secs(self.config.presence_log_interval_secs.max(1)),
            &tracker,
            shutdown.clone(),
        );

        let ctx = Arc::new(RelayContext {
            registry: self.registry.clone(),
            dispatcher,
            config: self.config,
        });

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%addr, error = %e, "Failed to set TCP_NODELAY");
                        }
                        tracker.spawn(handle_connection(
                            stream,
                            addr,
                            Arc::clone(&ctx),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        info!(
            online = self.registry.connection_count(),
            "Relay shutting down"
        );
        drop(self.listener);
        tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait()).await.is_err() {
            warn!("Timed out waiting for relay tasks to finish");
        }
        info!("Relay stopped");
        Ok(())
    }
}

fn spawn_presence_logger(
    registry: ConnectionRegistry,
    every: Duration,
    tracker: &TaskTracker,
    cancel: CancellationToken,
) {
    tracker.spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    info!(online = registry.connection_count(), "Presence");
                }
            }
        }
    });
}
