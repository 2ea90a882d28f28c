//! # World Seam
//!
//! [`World`] is what simulations, shard runners and sync sessions talk to.
//! [`WorldStore`] is the in-process implementation; tests wrap it to inject
//! aborts and failures.

use std::future::Future;

use meridian_core::{ChangeToApply, Entity, EntityId, Shutdown, Tick};

use crate::error::WorldResult;
use crate::store::{ApplyResult, WorldStore};
use crate::subscription::{Subscription, SubscriptionConfig};

/// Access to a versioned entity world.
pub trait World: Clone + Send + Sync + 'static {
    /// Applies transactions. See [`WorldStore::apply`].
    fn apply(
        &self,
        transactions: Vec<ChangeToApply>,
    ) -> impl Future<Output = WorldResult<ApplyResult>> + Send;

    /// Point reads. See [`WorldStore::get_with_version`].
    fn get_with_version(
        &self,
        ids: &[EntityId],
    ) -> impl Future<Output = WorldResult<Vec<(Tick, Option<Entity>)>>> + Send;

    /// Opens a change stream. See [`WorldStore::subscribe`].
    fn subscribe(&self, config: SubscriptionConfig, cancel: Shutdown) -> Subscription;
}

impl World for WorldStore {
    fn apply(
        &self,
        transactions: Vec<ChangeToApply>,
    ) -> impl Future<Output = WorldResult<ApplyResult>> + Send {
        WorldStore::apply(self, transactions)
    }

    fn get_with_version(
        &self,
        ids: &[EntityId],
    ) -> impl Future<Output = WorldResult<Vec<(Tick, Option<Entity>)>>> + Send {
        WorldStore::get_with_version(self, ids)
    }

    fn subscribe(&self, config: SubscriptionConfig, cancel: Shutdown) -> Subscription {
        WorldStore::subscribe(self, config, cancel)
    }
}
