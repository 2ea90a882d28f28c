//! # Versioned Entity Table
//!
//! In-memory authoritative map of entity id to component bag and version.
//! It is a materialized view of the change log: feeding it the same
//! proposed changes at the same ticks always produces the same state.
//!
//! ## Versions
//!
//! - Entity version: tick of the last committed change to the entity
//! - Component version: tick of the last write to that component kind
//! - Deleted entities keep a tombstone carrying the delete tick, so versions
//!   never move backwards and ids are never handed out twice
//! - `0` is the version of an entity the table has never seen

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::change::{Change, Iff, ProposedChange, Tick};
use super::component::ComponentKind;
use super::entity::{Entity, EntityId};

/// Stored state of one id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableRecord {
    /// Live entity, or `None` for a tombstone.
    pub entity: Option<Entity>,
    /// Tick of the last committed change.
    pub version: Tick,
    /// Tick of the last write per component kind.
    pub component_versions: BTreeMap<ComponentKind, Tick>,
}

impl TableRecord {
    fn stamp_all(&mut self, tick: Tick) {
        if let Some(entity) = &self.entity {
            for kind in entity.kinds() {
                self.component_versions.insert(kind, tick);
            }
        }
        for version in self.component_versions.values_mut() {
            *version = tick;
        }
        self.version = tick;
    }
}

/// The versioned entity table.
#[derive(Debug, Default)]
pub struct VersionedTable {
    records: HashMap<EntityId, TableRecord>,
    live: usize,
}

impl VersionedTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live entity with the given id.
    #[inline]
    #[must_use]
    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.records.get(&id).and_then(|record| record.entity.as_ref())
    }

    /// Returns the current version of `id` (`0` if never seen).
    #[inline]
    #[must_use]
    pub fn version(&self, id: EntityId) -> Tick {
        self.records.get(&id).map_or(0, |record| record.version)
    }

    /// Returns the last-write tick of one component of `id`.
    #[must_use]
    pub fn component_version(&self, id: EntityId, kind: ComponentKind) -> Tick {
        self.records
            .get(&id)
            .and_then(|record| record.component_versions.get(&kind).copied())
            .unwrap_or(0)
    }

    /// Point-in-time `(version, entity)` for one id.
    #[must_use]
    pub fn get_with_version(&self, id: EntityId) -> (Tick, Option<Entity>) {
        self.records
            .get(&id)
            .map_or((0, None), |record| (record.version, record.entity.clone()))
    }

    /// Evaluates one precondition against current versions.
    #[inline]
    #[must_use]
    pub fn check_iff(&self, iff: &Iff) -> bool {
        match iff.component {
            Some(kind) => self.component_version(iff.id, kind) == iff.version,
            None => self.version(iff.id) == iff.version,
        }
    }

    /// Whether every precondition holds.
    #[must_use]
    pub fn check_iffs(&self, iffs: &[Iff]) -> bool {
        iffs.iter().all(|iff| self.check_iff(iff))
    }

    /// Applies one transaction's changes at `tick`.
    ///
    /// Preconditions must already have been checked. Returns the committed
    /// changes; an update of an absent entity is reported as a create and a
    /// delete of an absent entity produces nothing.
    pub fn apply(&mut self, tick: Tick, changes: &[ProposedChange]) -> Vec<Change> {
        let mut committed = Vec::with_capacity(changes.len());

        for change in changes {
            match change {
                ProposedChange::Create(entity) => {
                    self.put(tick, entity.clone());
                    committed.push(Change::Create {
                        tick,
                        entity: entity.clone(),
                    });
                }
                ProposedChange::Update(patch) => {
                    if let Some(record) = self
                        .records
                        .get_mut(&patch.id)
                        .filter(|record| record.entity.is_some())
                    {
                        debug_assert!(tick >= record.version, "ticks must not go backwards");
                        if let Some(entity) = record.entity.as_mut() {
                            entity.apply_patch(patch);
                        }
                        record.version = tick;
                        for kind in patch.touched() {
                            record.component_versions.insert(kind, tick);
                        }
                        committed.push(Change::Update {
                            tick,
                            patch: patch.clone(),
                        });
                    } else {
                        let entity = Entity::from_patch(patch);
                        self.put(tick, entity.clone());
                        if let Some(record) = self.records.get_mut(&patch.id) {
                            for kind in patch.touched() {
                                record.component_versions.insert(kind, tick);
                            }
                        }
                        committed.push(Change::Create { tick, entity });
                    }
                }
                ProposedChange::Delete(id) => {
                    let Some(record) = self.records.get_mut(id) else {
                        continue;
                    };
                    if record.entity.is_none() {
                        continue;
                    }
                    record.stamp_all(tick);
                    record.entity = None;
                    self.live -= 1;
                    committed.push(Change::Delete { tick, id: *id });
                }
            }
        }

        committed
    }

    fn put(&mut self, tick: Tick, entity: Entity) {
        let id = entity.id;
        let record = self.records.entry(id).or_insert_with(|| TableRecord {
            entity: None,
            version: 0,
            component_versions: BTreeMap::new(),
        });
        debug_assert!(tick >= record.version, "ticks must not go backwards");

        if record.entity.is_none() {
            self.live += 1;
        }
        // Kinds dropped by an overwrite count as written too.
        record.stamp_all(tick);
        record.entity = Some(entity);
        record.stamp_all(tick);
    }

    /// Iterates over live entities with their versions.
    pub fn iter_live(&self) -> impl Iterator<Item = (Tick, &Entity)> {
        self.records
            .values()
            .filter_map(|record| record.entity.as_ref().map(|entity| (record.version, entity)))
    }

    /// Iterates over every record, tombstones included.
    pub fn records(&self) -> impl Iterator<Item = (&EntityId, &TableRecord)> {
        self.records.iter()
    }

    /// Reinstates a record verbatim (snapshot recovery).
    pub fn restore(&mut self, id: EntityId, record: TableRecord) {
        let was_live = self
            .records
            .get(&id)
            .is_some_and(|existing| existing.entity.is_some());
        let is_live = record.entity.is_some();
        self.records.insert(id, record);

        match (was_live, is_live) {
            (false, true) => self.live += 1,
            (true, false) => self.live -= 1,
            _ => {}
        }
    }

    /// Highest id ever stored, tombstones included.
    #[must_use]
    pub fn max_id(&self) -> Option<EntityId> {
        self.records.keys().copied().max()
    }

    /// Number of live entities.
    #[inline]
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Whether there are no live entities.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}
