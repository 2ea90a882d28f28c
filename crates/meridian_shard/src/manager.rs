//! # Shard Manager
//!
//! Owns this worker's share of one shard domain.
//!
//! ```text
//! membership change ─┐
//! config change ─────┼─▶ debounce ─▶ rebalance ─▶ Released(..) then Acquired(..)
//! periodic interval ─┘
//! ```
//!
//! Stopping unpublishes first, waits `shards.shutdown_grace_ms` so peers
//! pick up the shards, then releases everything locally.

use std::collections::BTreeSet;
use std::sync::Arc;

use meridian_core::{BalanceStrategy, ConfigHandle, ShardId, Shutdown, TaskScope};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::balance::{self, logical_shard};
use crate::discovery::Discovery;
use crate::error::{ShardError, ShardResult};

/// Ownership events buffered for slow listeners.
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// A change in this worker's held shards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardEvent {
    /// The logical shard is now ours.
    Acquired(u32),
    /// The logical shard is no longer ours. Stop all work on it now.
    Released(u32),
}

/// Read side of shard ownership, as seen by shard-scoped workers.
pub trait ShardOwnership: Send + Sync {
    /// Whether the spatial shard currently belongs to this worker.
    fn owns(&self, shard: &ShardId) -> bool;

    /// Receiver for ownership changes.
    fn events(&self) -> broadcast::Receiver<ShardEvent>;
}

/// Held logical shards and the count they were assigned against.
#[derive(Debug, Default)]
struct Holdings {
    total: u32,
    held: BTreeSet<u32>,
}

#[derive(Debug)]
struct Inner<D> {
    domain: String,
    nonce: String,
    discovery: D,
    config: ConfigHandle,
    holdings: RwLock<Holdings>,
    events: broadcast::Sender<ShardEvent>,
    rebalancing: tokio::sync::Mutex<()>,
}

/// Rendezvous-hashed ownership of one shard domain.
#[derive(Debug)]
pub struct ShardManager<D> {
    inner: Arc<Inner<D>>,
    scope: Mutex<Option<TaskScope>>,
}

impl<D: Discovery> ShardManager<D> {
    /// Creates a stopped manager.
    ///
    /// # Arguments
    ///
    /// * `domain` - Shard domain name, looked up under `[shards.domains]`
    /// * `nonce` - This worker's unique nonce
    /// * `discovery` - Membership channel
    /// * `config` - Runtime configuration
    #[must_use]
    pub fn new(domain: impl Into<String>, nonce: impl Into<String>, discovery: D, config: ConfigHandle) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                domain: domain.into(),
                nonce: nonce.into(),
                discovery,
                config,
                holdings: RwLock::new(Holdings::default()),
                events,
                rebalancing: tokio::sync::Mutex::new(()),
            }),
            scope: Mutex::new(None),
        }
    }

    /// Domain name.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.inner.domain
    }

    /// This worker's nonce.
    #[must_use]
    pub fn nonce(&self) -> &str {
        &self.inner.nonce
    }

    /// Logical shards currently held.
    #[must_use]
    pub fn held(&self) -> BTreeSet<u32> {
        self.inner.holdings.read().held.clone()
    }

    /// Logical shard count of the last rebalance.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.inner.holdings.read().total
    }

    /// Publishes this worker, takes its initial share and starts the
    /// rebalance loop under `parent`.
    ///
    /// A rebalance failure at start is logged, not returned; the loop keeps
    /// retrying.
    ///
    /// # Errors
    ///
    /// - [`ShardError::AlreadyStarted`] if running
    /// - [`ShardError::DiscoveryUnavailable`] if publishing fails
    pub async fn start(&self, parent: &Shutdown) -> ShardResult<()> {
        if self.scope.lock().is_some() {
            return Err(ShardError::AlreadyStarted(self.inner.domain.clone()));
        }

        self.inner.discovery.publish(&self.inner.nonce).await?;
        info!(domain = %self.inner.domain, nonce = %self.inner.nonce, "shard manager started");
        if let Err(e) = self.inner.rebalance().await {
            warn!(domain = %self.inner.domain, error = %e, "initial rebalance failed");
        }

        let scope = TaskScope::child_of(format!("shards-{}", self.inner.domain), parent);
        let inner = Arc::clone(&self.inner);
        let shutdown = scope.token();
        scope.spawn("shard-rebalance", async move { inner.run(shutdown).await });
        *self.scope.lock() = Some(scope);
        Ok(())
    }

    /// Recomputes ownership now.
    ///
    /// # Errors
    ///
    /// - [`ShardError::UnsupportedStrategy`]; every shard is released
    /// - [`ShardError::DiscoveryUnavailable`]; holdings are unchanged
    pub async fn rebalance(&self) -> ShardResult<BTreeSet<u32>> {
        self.inner.rebalance().await
    }

    /// Leaves the domain: stops the loop, unpublishes, waits out the grace
    /// period, then releases every shard.
    pub async fn stop(&self) {
        let scope = self.scope.lock().take();
        if let Some(scope) = scope {
            scope.shutdown().await;
        }

        if let Err(e) = self.inner.discovery.unpublish().await {
            warn!(domain = %self.inner.domain, error = %e, "unpublish failed; peers will time out");
        }
        tokio::time::sleep(self.inner.config.snapshot().shards.shutdown_grace()).await;
        self.inner.release_all();
        info!(domain = %self.inner.domain, "shard manager stopped");
    }
}

impl<D: Discovery> ShardOwnership for ShardManager<D> {
    fn owns(&self, shard: &ShardId) -> bool {
        let holdings = self.inner.holdings.read();
        holdings.held.contains(&logical_shard(shard, holdings.total))
    }

    fn events(&self) -> broadcast::Receiver<ShardEvent> {
        self.inner.events.subscribe()
    }
}

enum Trigger {
    Membership,
    Config,
    Interval,
}

impl<D: Discovery> Inner<D> {
    async fn run(&self, shutdown: Shutdown) {
        let mut members = self.discovery.changes();
        let mut config = self.config.subscribe();
        members.borrow_and_update();
        config.borrow_and_update();

        loop {
            let interval = self.config.snapshot().shards.rebalance_interval();
            let trigger = tokio::select! {
                () = shutdown.cancelled() => break,
                changed = members.changed() => match changed {
                    Ok(()) => Trigger::Membership,
                    Err(_) => break,
                },
                changed = config.changed() => match changed {
                    Ok(()) => Trigger::Config,
                    Err(_) => break,
                },
                () = tokio::time::sleep(interval) => Trigger::Interval,
            };

            if !matches!(trigger, Trigger::Interval) {
                // Collapse a burst of churn into one rebalance.
                let window = self.config.snapshot().shards.rebalance_batch();
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(window) => {}
                }
                members.borrow_and_update();
                config.borrow_and_update();
                debug!(
                    domain = %self.domain,
                    membership = matches!(trigger, Trigger::Membership),
                    "rebalance triggered"
                );
            }

            if let Err(e) = self.rebalance().await {
                warn!(domain = %self.domain, error = %e, "rebalance failed");
            }
        }
        debug!(domain = %self.domain, "rebalance loop stopped");
    }

    async fn rebalance(&self) -> ShardResult<BTreeSet<u32>> {
        let _serial = self.rebalancing.lock().await;
        let domain = self.config.snapshot().shards.domain(&self.domain);

        if domain.strategy == BalanceStrategy::Weighted {
            self.release_all();
            return Err(ShardError::UnsupportedStrategy {
                domain: self.domain.clone(),
                strategy: domain.strategy,
            });
        }

        let nonces = self.discovery.discover().await?;
        let target = balance::assign(&self.domain, domain.strategy, domain.shards, &nonces, &self.nonce)?;

        let previous = self.holdings.read().total;
        if previous != 0 && previous != domain.shards {
            info!(
                domain = %self.domain,
                from = previous,
                to = domain.shards,
                "shard count changed; releasing all shards"
            );
            self.update_held(domain.shards, BTreeSet::new());
        }

        self.update_held(domain.shards, target.clone());
        Ok(target)
    }

    fn release_all(&self) {
        let total = self.holdings.read().total;
        self.update_held(total, BTreeSet::new());
    }

    /// Swaps in `target` as assigned against `total`, then announces the
    /// difference.
    fn update_held(&self, total: u32, target: BTreeSet<u32>) {
        let (released, acquired) = {
            let mut holdings = self.holdings.write();
            let released: Vec<u32> = holdings.held.difference(&target).copied().collect();
            let acquired: Vec<u32> = target.difference(&holdings.held).copied().collect();
            *holdings = Holdings { total, held: target };
            (released, acquired)
        };

        if !released.is_empty() || !acquired.is_empty() {
            info!(
                domain = %self.domain,
                released = released.len(),
                acquired = acquired.len(),
                "shard ownership changed"
            );
        }
        // No listeners is fine.
        for shard in released {
            let _ = self.events.send(ShardEvent::Released(shard));
        }
        for shard in acquired {
            let _ = self.events.send(ShardEvent::Acquired(shard));
        }
    }
}

/// Ownership that never changes unless told to.
///
/// For single-worker deployments and tests.
#[derive(Debug)]
pub struct FixedOwnership {
    owned: RwLock<bool>,
    events: broadcast::Sender<ShardEvent>,
}

impl FixedOwnership {
    /// Owns every shard.
    #[must_use]
    pub fn all() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            owned: RwLock::new(true),
            events,
        }
    }

    /// Drops every shard and announces it.
    pub fn release_all(&self) {
        *self.owned.write() = false;
        let _ = self.events.send(ShardEvent::Released(0));
    }

    /// Takes every shard back and announces it.
    pub fn acquire_all(&self) {
        *self.owned.write() = true;
        let _ = self.events.send(ShardEvent::Acquired(0));
    }
}

impl ShardOwnership for FixedOwnership {
    fn owns(&self, _shard: &ShardId) -> bool {
        *self.owned.read()
    }

    fn events(&self) -> broadcast::Receiver<ShardEvent> {
        self.events.subscribe()
    }
}
