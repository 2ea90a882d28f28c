//! # Simulation Contract
//!
//! A simulation caches one computed entity per shard. The runner calls
//! [`Simulation::invalidate`] for every committed change it observes and
//! [`Simulation::update`] for every queued shard it owns.

use std::time::Duration;

use meridian_core::{Change, ChangeToApply, Entity, EntityFilter, EntityId, ShardId, Tick};

/// When to look at a shard again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requeue {
    /// As soon as the throttle window allows.
    Immediately,
    /// After the given delay.
    After(Duration),
}

/// Output of one shard update.
#[derive(Clone, Debug, Default)]
pub struct UpdateResult {
    /// Writes to commit. Each should pin the shard entity's version.
    pub transactions: Vec<ChangeToApply>,
    /// Optional follow-up.
    pub requeue: Option<Requeue>,
}

/// Shard-scoped computation over the world.
pub trait Simulation: Send + Sync + 'static {
    /// Name, for logs.
    fn name(&self) -> &str;

    /// Which entities the runner's change stream carries.
    fn filter(&self) -> EntityFilter {
        EntityFilter::everything()
    }

    /// Called before every (re)subscription, ahead of the bootstrap.
    fn reset(&self) {}

    /// Shards whose cached result `change` may have made stale.
    fn invalidate(&self, change: &Change) -> Vec<ShardId>;

    /// The entity holding `shard`'s computed state.
    fn shard_entity(&self, shard: &ShardId) -> EntityId;

    /// Recomputes `shard` from its entity at `version`.
    ///
    /// `None` means nothing to write and nothing to schedule.
    fn update(&self, shard: &ShardId, version: Tick, state: Option<&Entity>) -> Option<UpdateResult>;
}
