//! # Lighting
//!
//! Reference simulation: every shard near a light source gets an entity
//! carrying the accumulated [`Component::Illumination`] of the lights that
//! reach it.
//!
//! A light reaches its own shard and the shards one cell away on every
//! axis, losing [`FALLOFF_PER_CELL`] intensity per cell of distance.

use std::collections::{BTreeSet, HashMap};

use meridian_core::{
    Change, ChangeToApply, Component, ComponentKind, Entity, EntityFilter, EntityId, EntityPatch,
    Position, ShardId, Tick, SHARD_DIM,
};
use parking_lot::RwLock;

use crate::simulation::{Simulation, UpdateResult};

/// Id namespace of lighting shard entities.
pub const LIGHTING_NAMESPACE: u16 = 1;

/// Cells a light reaches on each axis.
pub const LIGHT_REACH: i32 = 1;

/// Intensity lost per cell of distance.
pub const FALLOFF_PER_CELL: u32 = 5;

/// Light-source index plus the illumination rule.
#[derive(Debug, Default)]
pub struct LightingSimulation {
    lights: RwLock<HashMap<EntityId, Entity>>,
}

impl LightingSimulation {
    /// Creates a simulation with no known lights.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed lights.
    #[must_use]
    pub fn light_count(&self) -> usize {
        self.lights.read().len()
    }

    fn light_of(entity: &Entity) -> Option<(ShardId, u8)> {
        let position = entity.get(ComponentKind::Position)?.as_position()?;
        match entity.get(ComponentKind::LightSource)? {
            Component::LightSource { intensity } => Some((ShardId::containing(position), *intensity)),
            _ => None,
        }
    }

    fn center(shard: &ShardId) -> Position {
        Position::new(
            (f64::from(shard.x) + 0.5) * SHARD_DIM,
            (f64::from(shard.y) + 0.5) * SHARD_DIM,
            (f64::from(shard.z) + 0.5) * SHARD_DIM,
        )
    }

    /// Level a light at `at` adds to `shard`, if it reaches.
    fn contribution(at: &ShardId, intensity: u8, shard: &ShardId) -> Option<u32> {
        let distance = (at.x - shard.x)
            .abs()
            .max((at.y - shard.y).abs())
            .max((at.z - shard.z).abs());
        if distance > LIGHT_REACH {
            return None;
        }
        let lost = distance.unsigned_abs() * FALLOFF_PER_CELL;
        Some(u32::from(intensity).saturating_sub(lost)).filter(|level| *level > 0)
    }
}

impl Simulation for LightingSimulation {
    fn name(&self) -> &str {
        "lighting"
    }

    fn filter(&self) -> EntityFilter {
        EntityFilter::everything()
            .with(ComponentKind::LightSource)
            .with(ComponentKind::Position)
    }

    fn reset(&self) {
        self.lights.write().clear();
    }

    fn invalidate(&self, change: &Change) -> Vec<ShardId> {
        let (before, after) = {
            let mut lights = self.lights.write();
            match change {
                Change::Create { entity, .. } => {
                    let before = lights.insert(entity.id, entity.clone());
                    (before.as_ref().and_then(Self::light_of), Self::light_of(entity))
                }
                Change::Update { patch, .. } => match lights.get_mut(&patch.id) {
                    Some(entity) => {
                        let before = Self::light_of(entity);
                        entity.apply_patch(patch);
                        (before, Self::light_of(entity))
                    }
                    None => (None, None),
                },
                Change::Delete { id, .. } => {
                    (lights.remove(id).as_ref().and_then(Self::light_of), None)
                }
            }
        };

        if before == after && matches!(change, Change::Update { .. }) {
            return Vec::new();
        }
        let shards: BTreeSet<ShardId> = before
            .into_iter()
            .chain(after)
            .flat_map(|(at, _)| at.neighborhood(LIGHT_REACH))
            .collect();
        shards.into_iter().collect()
    }

    fn shard_entity(&self, shard: &ShardId) -> EntityId {
        EntityId::derived(LIGHTING_NAMESPACE, shard.packed())
    }

    fn update(&self, shard: &ShardId, version: Tick, state: Option<&Entity>) -> Option<UpdateResult> {
        let (level, sources) = self
            .lights
            .read()
            .values()
            .filter_map(Self::light_of)
            .filter_map(|(at, intensity)| Self::contribution(&at, intensity, shard))
            .fold((0u32, 0u32), |(level, sources), lit| (level + lit, sources + 1));

        let target = Component::Illumination { level, sources };
        let current = state.and_then(|entity| entity.get(ComponentKind::Illumination));
        if current == Some(&target) || (current.is_none() && sources == 0) {
            return None;
        }

        let id = self.shard_entity(shard);
        let write = ChangeToApply::new().iff(id, version).update(
            EntityPatch::new(id)
                .set(Component::Position(Self::center(shard)))
                .set(target),
        );
        Some(UpdateResult {
            transactions: vec![write],
            requeue: None,
        })
    }
}
