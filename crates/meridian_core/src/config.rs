//! # Runtime Configuration
//!
//! Tunables consulted throughout the node: trim cadence, shard counts,
//! throttle windows, sync radius. Loaded from TOML; every field has a
//! default so a missing or empty file is valid.
//!
//! Components never read a global. They receive a [`ConfigHandle`] at
//! construction, take a [`snapshot`](ConfigHandle::snapshot) whenever they
//! need a value and [`subscribe`](ConfigHandle::subscribe) if they must react
//! to a live reload.
//!
//! ```toml
//! [world]
//! log_retention_ms = 60000
//!
//! [shards.domains.lighting]
//! shards = 64
//! strategy = "balanced"
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::error::{CoreError, CoreResult};

/// World store tunables.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Change-log entries older than this are trimmed.
    pub log_retention_ms: u64,
    /// Interval between trim passes.
    pub trim_interval_ms: u64,
    /// Transactions committed per lock acquisition in `apply`.
    pub max_transactions_per_chunk: usize,
    /// Maximum changes per streamed update.
    pub subscription_batch_size: usize,
    /// Buffered updates per subscription before backpressure.
    pub subscription_channel_capacity: usize,
    /// Write-ahead log location; in-memory only when unset.
    pub wal_path: Option<String>,
    /// Appended WAL records that trigger a checkpoint on the next trim pass.
    pub wal_checkpoint_records: u64,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            log_retention_ms: 60_000,
            trim_interval_ms: 5_000,
            max_transactions_per_chunk: 256,
            subscription_batch_size: 512,
            subscription_channel_capacity: 64,
            wal_path: None,
            wal_checkpoint_records: 10_000,
        }
    }
}

impl WorldConfig {
    /// Change-log retention window.
    #[must_use]
    pub const fn log_retention(&self) -> Duration {
        Duration::from_millis(self.log_retention_ms)
    }

    /// Trim cadence.
    #[must_use]
    pub const fn trim_interval(&self) -> Duration {
        Duration::from_millis(self.trim_interval_ms)
    }
}

/// Shard balancing strategy for one domain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceStrategy {
    /// Rendezvous hashing, equal share per worker.
    #[default]
    Balanced,
    /// Capacity-weighted assignment. Not implemented.
    Weighted,
}

/// Per-domain shard settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDomainConfig {
    /// Total logical shard count.
    pub shards: u32,
    /// Balancing strategy.
    #[serde(default)]
    pub strategy: BalanceStrategy,
}

/// Shard manager tunables.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardsConfig {
    /// Debounce window for membership/config driven rebalances.
    pub rebalance_batch_ms: u64,
    /// Periodic rebalance interval.
    pub rebalance_interval_ms: u64,
    /// How long a stopping worker waits after unpublishing.
    pub shutdown_grace_ms: u64,
    /// Shard count for domains without an explicit entry.
    pub default_total_shards: u32,
    /// Named domains.
    pub domains: BTreeMap<String, ShardDomainConfig>,
}

impl Default for ShardsConfig {
    fn default() -> Self {
        Self {
            rebalance_batch_ms: 250,
            rebalance_interval_ms: 30_000,
            shutdown_grace_ms: 2_000,
            default_total_shards: 64,
            domains: BTreeMap::new(),
        }
    }
}

impl ShardsConfig {
    /// Settings for `domain`, falling back to the defaults.
    #[must_use]
    pub fn domain(&self, domain: &str) -> ShardDomainConfig {
        self.domains.get(domain).copied().unwrap_or(ShardDomainConfig {
            shards: self.default_total_shards,
            strategy: BalanceStrategy::Balanced,
        })
    }

    /// Debounce window.
    #[must_use]
    pub const fn rebalance_batch(&self) -> Duration {
        Duration::from_millis(self.rebalance_batch_ms)
    }

    /// Periodic rebalance interval.
    #[must_use]
    pub const fn rebalance_interval(&self) -> Duration {
        Duration::from_millis(self.rebalance_interval_ms)
    }

    /// Shutdown grace period.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Simulation runner tunables.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Minimum interval between two updates of the same shard.
    pub throttle_ms: u64,
    /// Shards handed to one update batch.
    pub shards_per_batch: usize,
    /// First retry delay after a failed batch.
    pub retry_base_ms: u64,
    /// Retry delay cap.
    pub retry_max_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            throttle_ms: 100,
            shards_per_batch: 16,
            retry_base_ms: 50,
            retry_max_ms: 5_000,
        }
    }
}

impl SimulationConfig {
    /// Per-shard throttle window.
    #[must_use]
    pub const fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }
}

/// Client sync tunables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Default area-of-interest radius, in world units.
    pub radius: f64,
    /// Largest radius a client may ask for.
    pub max_radius: f64,
    /// Always-resident refresh cadence.
    pub residency_refresh_ms: u64,
    /// Heartbeat cadence when idle.
    pub heartbeat_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            radius: 128.0,
            max_radius: 2_048.0,
            residency_refresh_ms: 5_000,
            heartbeat_ms: 1_000,
        }
    }
}

/// Root configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeridianConfig {
    /// `[world]`
    pub world: WorldConfig,
    /// `[shards]`
    pub shards: ShardsConfig,
    /// `[simulation]`
    pub simulation: SimulationConfig,
    /// `[sync]`
    pub sync: SyncConfig,
}

impl MeridianConfig {
    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] on malformed input.
    pub fn from_toml(text: &str) -> CoreResult<Self> {
        toml::from_str(text).map_err(|e| CoreError::InvalidConfig(e.to_string()))
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] if the file is unreadable or malformed.
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CoreError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }
}

/// Shared, observable configuration snapshot.
///
/// Cloning the handle is cheap; all clones observe the same value.
#[derive(Clone, Debug)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Arc<MeridianConfig>>>,
}

impl ConfigHandle {
    /// Wraps an initial configuration.
    #[must_use]
    pub fn new(config: MeridianConfig) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(config));
        Self { tx: Arc::new(tx) }
    }

    /// Current configuration.
    #[must_use]
    pub fn snapshot(&self) -> Arc<MeridianConfig> {
        Arc::clone(&self.tx.borrow())
    }

    /// Receiver notified on every replacement.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<MeridianConfig>> {
        self.tx.subscribe()
    }

    /// Publishes a new configuration to every subscriber.
    pub fn replace(&self, config: MeridianConfig) {
        self.tx.send_replace(Arc::new(config));
    }

    /// Applies `edit` to a copy of the current configuration and publishes it.
    pub fn update(&self, edit: impl FnOnce(&mut MeridianConfig)) {
        let mut next = (*self.snapshot()).clone();
        edit(&mut next);
        self.replace(next);
    }

    /// Reloads from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`]; the current value is kept.
    pub fn reload_from(&self, path: impl AsRef<Path>) -> CoreResult<()> {
        let config = MeridianConfig::load(path.as_ref())?;
        info!(path = %path.as_ref().display(), "configuration reloaded");
        self.replace(config);
        Ok(())
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(MeridianConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = MeridianConfig::from_toml("").unwrap();
        assert_eq!(config, MeridianConfig::default());
    }

    #[test]
    fn test_domain_overrides() {
        let config = MeridianConfig::from_toml(
            r#"
            [shards]
            default_total_shards = 8

            [shards.domains.lighting]
            shards = 32
            strategy = "weighted"
            "#,
        )
        .unwrap();

        let lighting = config.shards.domain("lighting");
        assert_eq!(lighting.shards, 32);
        assert_eq!(lighting.strategy, BalanceStrategy::Weighted);
        assert_eq!(config.shards.domain("other").shards, 8);
    }

    #[test]
    fn test_sync_radius_cap() {
        let config = MeridianConfig::from_toml("[sync]\nmax_radius = 512.0").unwrap();
        assert!((config.sync.max_radius - 512.0).abs() < f64::EPSILON);
        assert!((config.sync.radius - SyncConfig::default().radius).abs() < f64::EPSILON);
    }

    #[test]
    fn test_malformed_document_is_rejected() {
        assert!(matches!(
            MeridianConfig::from_toml("[world]\nlog_retention_ms = \"soon\""),
            Err(CoreError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_update_notifies_subscribers() {
        let handle = ConfigHandle::default();
        let mut rx = handle.subscribe();

        handle.update(|config| config.simulation.throttle_ms = 7);

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().simulation.throttle_ms, 7);
        assert_eq!(handle.snapshot().simulation.throttle(), Duration::from_millis(7));
    }

    #[test]
    fn test_reload_keeps_value_on_error() {
        let handle = ConfigHandle::default();
        let missing = std::env::temp_dir().join("meridian_missing_config.toml");
        assert!(handle.reload_from(&missing).is_err());
        assert_eq!(*handle.snapshot(), MeridianConfig::default());
    }
}
