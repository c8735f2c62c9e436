//! Configuration resolution for Duet.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`$XDG_CONFIG_HOME/duet/settings.json`)
//! 3. Explicit config file (`--config`)
//! 4. `DUET_*` environment variables
//! 5. CLI arguments (applied by the binaries, highest priority)
//!
//! Files are merged key by key, so a file only needs the settings it changes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::ids::{MAX_NODE_ID, MIN_NODE_ID};

/// Complete Duet configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub relay: RelayConfig,
    pub client: ClientConfig,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub ordering: OrderingConfig,
    pub reliability: ReliabilityConfig,
    pub sequencing: SequencingConfig,
}

/// Relay server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind_addr: String,
    pub heartbeat_check_interval_secs: u64,
    /// A connection silent for longer than this is closed.
    pub heartbeat_timeout_secs: u64,
    /// Aggregate deadline for one fan-out.
    pub fanout_timeout_ms: u64,
    /// Concurrent per-recipient writes within one fan-out.
    pub fanout_workers: usize,
    pub dispatch_queue_capacity: usize,
    /// Per-connection outbound line buffer.
    pub outbound_buffer: usize,
    pub login_timeout_secs: u64,
    pub presence_log_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8888".to_string(),
            heartbeat_check_interval_secs: 5,
            heartbeat_timeout_secs: 30,
            fanout_timeout_ms: 2000,
            fanout_workers: 8,
            dispatch_queue_capacity: 1024,
            outbound_buffer: 256,
            login_timeout_secs: 10,
            presence_log_interval_secs: 60,
        }
    }
}

impl RelayConfig {
    pub const fn heartbeat_check_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_check_interval_secs)
    }

    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub const fn fanout_timeout(&self) -> Duration {
        Duration::from_millis(self.fanout_timeout_ms)
    }

    pub const fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }
}

/// Client transport and identity settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_addr: String,
    pub username: Option<String>,
    /// Node component of generated message IDs, in `[1, 1023]`. Must differ
    /// between peers; when unset it is derived from the username.
    pub node_id: Option<u16>,
    pub database_path: Option<PathBuf>,
    pub heartbeat_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_multiplier: f64,
    pub reconnect_max_delay_secs: u64,
    pub reconnect_max_attempts: u32,
    /// Cached presence older than this triggers a background refresh.
    pub presence_refresh_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:8888".to_string(),
            username: None,
            node_id: None,
            database_path: None,
            heartbeat_interval_secs: 15,
            connect_timeout_secs: 10,
            reconnect_initial_delay_ms: 2000,
            reconnect_multiplier: 2.0,
            reconnect_max_delay_secs: 30,
            reconnect_max_attempts: 3,
            presence_refresh_secs: 5,
        }
    }
}

impl ClientConfig {
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub const fn presence_refresh(&self) -> Duration {
        Duration::from_secs(self.presence_refresh_secs)
    }
}

/// Storage connection pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub initial_size: usize,
    pub max_size: usize,
    pub checkout_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 5,
            max_size: 10,
            checkout_timeout_secs: 30,
        }
    }
}

/// Message cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_per_conversation: usize,
    /// Capacity of the LRU by-ID index.
    pub max_indexed_messages: usize,
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_per_conversation: 100,
            max_indexed_messages: 1000,
            ttl_secs: 30 * 60,
            sweep_interval_secs: 10 * 60,
        }
    }
}

impl CacheConfig {
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Reorder buffer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderingConfig {
    /// Stall after which a buffer is force-flushed.
    pub buffer_timeout_ms: u64,
    pub drain_interval_ms: u64,
    /// Empty buffers idle for longer than this are dropped.
    pub idle_cleanup_secs: u64,
}

impl Default for OrderingConfig {
    fn default() -> Self {
        Self {
            buffer_timeout_ms: 1000,
            drain_interval_ms: 100,
            idle_cleanup_secs: 5 * 60,
        }
    }
}

impl OrderingConfig {
    pub const fn buffer_timeout(&self) -> Duration {
        Duration::from_millis(self.buffer_timeout_ms)
    }

    pub const fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub const fn idle_cleanup(&self) -> Duration {
        Duration::from_secs(self.idle_cleanup_secs)
    }
}

/// Ack, retry and offline queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    pub ack_timeout_ms: u64,
    pub max_retries: u32,
    pub cleanup_interval_secs: u64,
    /// Pending entries older than this are abandoned.
    pub pending_max_age_secs: u64,
    /// Per-user offline queue cap; the oldest entry is dropped on overflow.
    pub offline_capacity: usize,
    pub offline_ttl_secs: u64,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 30_000,
            max_retries: 3,
            cleanup_interval_secs: 60,
            pending_max_age_secs: 5 * 60,
            offline_capacity: 1000,
            offline_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl ReliabilityConfig {
    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub const fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub const fn pending_max_age(&self) -> Duration {
        Duration::from_secs(self.pending_max_age_secs)
    }

    pub const fn offline_ttl(&self) -> Duration {
        Duration::from_secs(self.offline_ttl_secs)
    }
}

/// Sequencing worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencingConfig {
    pub queue_capacity: usize,
}

impl Default for SequencingConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
        }
    }
}

impl Config {
    /// Reject settings the services cannot run with.
    pub fn validate(&self) -> Result<()> {
        if let Some(node) = self
            .client
            .node_id
            .filter(|n| !(MIN_NODE_ID..=MAX_NODE_ID).contains(n))
        {
            return Err(Error::Config(format!(
                "client.node_id {node} out of range [{MIN_NODE_ID}, {MAX_NODE_ID}]"
            )));
        }
        if self.pool.max_size == 0 {
            return Err(Error::Config("pool.max_size must be positive".into()));
        }
        if self.pool.initial_size > self.pool.max_size {
            return Err(Error::Config(format!(
                "pool.initial_size {} exceeds pool.max_size {}",
                self.pool.initial_size, self.pool.max_size
            )));
        }
        if self.cache.max_per_conversation == 0 {
            return Err(Error::Config(
                "cache.max_per_conversation must be positive".into(),
            ));
        }
        if self.sequencing.queue_capacity == 0 {
            return Err(Error::Config(
                "sequencing.queue_capacity must be positive".into(),
            ));
        }
        if self.relay.fanout_workers == 0 || self.relay.outbound_buffer == 0 {
            return Err(Error::Config(
                "relay.fanout_workers and relay.outbound_buffer must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution and validate it.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            merge_json(&mut merged, load_config_file(&global_path)?);
        }
    }

    if let Some(path) = explicit {
        merge_json(&mut merged, load_config_file(path)?);
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Path of the global settings file.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("duet").join("settings.json"))
}

/// Default location of the client's message database.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("duet").join("messages.db"))
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Recursively overlay `overlay` onto `base`; objects merge, everything else replaces.
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(
        lookup: &impl Fn(&str) -> Option<String>,
        key: &str,
    ) -> Option<T> {
        lookup(key).and_then(|v| v.parse().ok())
    }

    if let Some(val) = lookup("DUET_RELAY_BIND") {
        config.relay.bind_addr = val;
    }
    if let Some(val) = lookup("DUET_SERVER") {
        config.client.server_addr = val;
    }
    if let Some(val) = lookup("DUET_USER") {
        config.client.username = Some(val);
    }
    if let Some(val) = lookup("DUET_DB") {
        config.client.database_path = Some(PathBuf::from(val));
    }
    if let Some(n) = parsed(&lookup, "DUET_NODE_ID") {
        config.client.node_id = Some(n);
    }
    if let Some(n) = parsed(&lookup, "DUET_HEARTBEAT_TIMEOUT_SECS") {
        config.relay.heartbeat_timeout_secs = n;
    }
    if let Some(n) = parsed(&lookup, "DUET_POOL_MAX") {
        config.pool.max_size = n;
    }
    if let Some(n) = parsed(&lookup, "DUET_ACK_TIMEOUT_MS") {
        config.reliability.ack_timeout_ms = n;
    }
    if let Some(n) = parsed(&lookup, "DUET_MAX_RETRIES") {
        config.reliability.max_retries = n;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_carry_delivery_constants() {
        let config = Config::default();
        assert_eq!(config.reliability.ack_timeout(), Duration::from_secs(30));
        assert_eq!(config.reliability.max_retries, 3);
        assert_eq!(config.reliability.offline_capacity, 1000);
        assert_eq!(config.ordering.buffer_timeout(), Duration::from_secs(1));
        assert_eq!(config.relay.heartbeat_timeout(), Duration::from_secs(30));
        assert_eq!(config.relay.fanout_timeout(), Duration::from_secs(2));
        assert_eq!(config.cache.max_per_conversation, 100);
        assert_eq!(config.pool.initial_size, 5);
        assert_eq!(config.pool.max_size, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_node_and_pool() {
        let mut config = Config::default();
        config.client.node_id = Some(0);
        assert!(config.validate().is_err());
        config.client.node_id = Some(1024);
        assert!(config.validate().is_err());
        config.client.node_id = Some(1023);
        assert!(config.validate().is_ok());
        config.client.node_id = None;
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.pool.initial_size = 11;
        assert!(config.validate().is_err());
        config.pool.max_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_file_merges_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"relay": {"bind_addr": "127.0.0.1:9999"}, "reliability": {"max_retries": 5}}"#,
        )
        .unwrap();

        let mut merged = serde_json::to_value(Config::default()).unwrap();
        merge_json(&mut merged, load_config_file(&path).unwrap());
        let config: Config = serde_json::from_value(merged).unwrap();

        assert_eq!(config.relay.bind_addr, "127.0.0.1:9999");
        assert_eq!(config.relay.heartbeat_timeout_secs, 30);
        assert_eq!(config.reliability.max_retries, 5);
        assert_eq!(config.reliability.ack_timeout_ms, 30_000);
    }

    #[test]
    fn unreadable_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_config_file(&path), Err(Error::Config(_))));
        assert!(load_config(Some(&dir.path().join("missing.json"))).is_err());
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DUET_SERVER", "10.0.0.2:8888"),
            ("DUET_USER", "alice"),
            ("DUET_NODE_ID", "17"),
            ("DUET_MAX_RETRIES", "many"),
        ]);
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(|v| (*v).to_string()));

        assert_eq!(config.client.server_addr, "10.0.0.2:8888");
        assert_eq!(config.client.username.as_deref(), Some("alice"));
        assert_eq!(config.client.node_id, Some(17));
        assert_eq!(config.reliability.max_retries, 3);
    }
}
