//! Always-resident entities: kept in a client's view regardless of distance.

use std::collections::HashSet;
use std::future::Future;

use meridian_core::{Component, ComponentKind, EntityId};
use meridian_world::World;

use crate::error::SyncResult;

/// Source of the always-resident set for a subject.
pub trait ResidencySource: Send + Sync + 'static {
    /// Ids that must stay resident for `subject`.
    fn always_resident(
        &self,
        subject: EntityId,
    ) -> impl Future<Output = SyncResult<HashSet<EntityId>>> + Send;
}

/// Reads the subject's [`Component::Following`] set from the world.
#[derive(Clone, Debug)]
pub struct WorldResidency<W> {
    world: W,
}

impl<W: World> WorldResidency<W> {
    /// Wraps `world`.
    #[must_use]
    pub fn new(world: W) -> Self {
        Self { world }
    }
}

impl<W: World> ResidencySource for WorldResidency<W> {
    async fn always_resident(&self, subject: EntityId) -> SyncResult<HashSet<EntityId>> {
        let mut found = self.world.get_with_version(&[subject]).await?;
        let following = found
            .pop()
            .and_then(|(_, entity)| entity)
            .and_then(|mut entity| entity.remove(ComponentKind::Following));
        Ok(match following {
            Some(Component::Following(ids)) => ids.into_iter().collect(),
            _ => HashSet::new(),
        })
    }
}

/// Nothing is always resident.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoResidency;

impl ResidencySource for NoResidency {
    fn always_resident(
        &self,
        _subject: EntityId,
    ) -> impl Future<Output = SyncResult<HashSet<EntityId>>> + Send {
        std::future::ready(Ok(HashSet::new()))
    }
}
