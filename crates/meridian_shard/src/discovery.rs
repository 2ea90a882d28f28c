//! # Discovery
//!
//! The live set of worker nonces. Only the shard manager reads it.
//!
//! [`DiscoveryRegistry`] is the in-process membership set; each worker
//! joins it through its own [`LocalDiscovery`] handle.

use std::collections::BTreeSet;
use std::future::Future;
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use siphasher::sip::SipHasher13;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{ShardError, ShardResult};

/// Membership channel between workers.
pub trait Discovery: Send + Sync + 'static {
    /// Announces `nonce` as a live worker.
    fn publish(&self, nonce: &str) -> impl Future<Output = ShardResult<()>> + Send;

    /// Withdraws the nonce published by this handle, if any.
    fn unpublish(&self) -> impl Future<Output = ShardResult<()>> + Send;

    /// Current live nonces.
    fn discover(&self) -> impl Future<Output = ShardResult<BTreeSet<String>>> + Send;

    /// Receiver notified whenever the live set changes.
    fn changes(&self) -> watch::Receiver<BTreeSet<String>>;
}

/// Generates a worker nonce unique to this process and call.
#[must_use]
pub fn generate_nonce() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    let mut hasher = SipHasher13::new();
    hasher.write(&std::process::id().to_le_bytes());
    hasher.write(&nanos.to_le_bytes());
    hasher.write(&COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    format!("{:016x}", hasher.finish())
}

#[derive(Debug)]
struct RegistryInner {
    members: watch::Sender<BTreeSet<String>>,
    available: AtomicBool,
}

/// Shared in-process membership set.
#[derive(Clone, Debug)]
pub struct DiscoveryRegistry {
    inner: Arc<RegistryInner>,
}

impl DiscoveryRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        let (members, _) = watch::channel(BTreeSet::new());
        Self {
            inner: Arc::new(RegistryInner {
                members,
                available: AtomicBool::new(true),
            }),
        }
    }

    /// A handle for one worker.
    #[must_use]
    pub fn join(&self) -> LocalDiscovery {
        LocalDiscovery {
            registry: self.clone(),
            published: Mutex::new(None),
        }
    }

    /// Current members.
    #[must_use]
    pub fn members(&self) -> BTreeSet<String> {
        self.inner.members.borrow().clone()
    }

    /// Makes every call through this registry fail (or succeed again).
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> ShardResult<()> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ShardError::DiscoveryUnavailable("registry offline".into()))
        }
    }
}

impl Default for DiscoveryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One worker's view of a [`DiscoveryRegistry`].
#[derive(Debug)]
pub struct LocalDiscovery {
    registry: DiscoveryRegistry,
    published: Mutex<Option<String>>,
}

impl LocalDiscovery {
    fn publish_now(&self, nonce: &str) -> ShardResult<()> {
        self.registry.check()?;
        let previous = self.published.lock().replace(nonce.to_owned());
        self.registry.inner.members.send_modify(|members| {
            if let Some(previous) = &previous {
                members.remove(previous);
            }
            members.insert(nonce.to_owned());
        });
        debug!(nonce, "published");
        Ok(())
    }

    fn unpublish_now(&self) -> ShardResult<()> {
        self.registry.check()?;
        if let Some(nonce) = self.published.lock().take() {
            self.registry
                .inner
                .members
                .send_if_modified(|members| members.remove(&nonce));
            debug!(nonce, "unpublished");
        }
        Ok(())
    }
}

impl Discovery for LocalDiscovery {
    fn publish(&self, nonce: &str) -> impl Future<Output = ShardResult<()>> + Send {
        std::future::ready(self.publish_now(nonce))
    }

    fn unpublish(&self) -> impl Future<Output = ShardResult<()>> + Send {
        std::future::ready(self.unpublish_now())
    }

    fn discover(&self) -> impl Future<Output = ShardResult<BTreeSet<String>>> + Send {
        std::future::ready(self.registry.check().map(|()| self.registry.members()))
    }

    fn changes(&self) -> watch::Receiver<BTreeSet<String>> {
        self.registry.inner.members.subscribe()
    }
}

impl Drop for LocalDiscovery {
    fn drop(&mut self) {
        if let Some(nonce) = self.published.get_mut().take() {
            self.registry
                .inner
                .members
                .send_if_modified(|members| members.remove(&nonce));
        }
    }
}
