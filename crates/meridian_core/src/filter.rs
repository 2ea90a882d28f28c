//! # Filter Context
//!
//! Turns the raw change log into the lifecycle a single subscriber sees.
//!
//! The context keeps an explicit inclusion set: an id is in the set iff the
//! last evaluation of the filter against that entity's components passed.
//! When a change flips that result the context synthesizes the event the
//! subscriber needs:
//!
//! ```text
//! raw change        was included   now matches   emitted
//! ───────────────   ────────────   ───────────   ─────────────────
//! create            -              yes           create
//! create            yes            no            delete
//! update            no             yes           create (full entity)
//! update            yes            yes           update
//! update            yes            no            delete
//! delete            yes            -             delete
//! delete            no             -             (dropped)
//! ```
//!
//! Re-evaluation is skipped for updates that touch none of the filter's
//! dependencies. Dependencies are the union of every kind the filter names,
//! so the skip never hides a real transition.

use std::collections::hash_map::HashMap;
use std::collections::{BTreeSet, HashSet};
use std::hash::BuildHasher;

use serde::{Deserialize, Serialize};

use crate::ecs::{Change, ComponentKind, Entity, EntityId, EntityPatch, VersionedTable};

/// Component predicate over an entity.
///
/// An entity matches when it has every kind in `all_of`, at least one kind in
/// `any_of` (if non-empty) and none of the kinds in `none_of`. The default
/// filter matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityFilter {
    /// Required kinds.
    pub all_of: BTreeSet<ComponentKind>,
    /// At least one of these kinds, unless empty.
    pub any_of: BTreeSet<ComponentKind>,
    /// Forbidden kinds.
    pub none_of: BTreeSet<ComponentKind>,
}

impl EntityFilter {
    /// Filter matching every entity.
    #[must_use]
    pub fn everything() -> Self {
        Self::default()
    }

    /// Requires `kind`.
    #[must_use]
    pub fn with(mut self, kind: ComponentKind) -> Self {
        self.all_of.insert(kind);
        self
    }

    /// Accepts entities having `kind` (or any other `any_of` kind).
    #[must_use]
    pub fn any(mut self, kind: ComponentKind) -> Self {
        self.any_of.insert(kind);
        self
    }

    /// Rejects entities having `kind`.
    #[must_use]
    pub fn without(mut self, kind: ComponentKind) -> Self {
        self.none_of.insert(kind);
        self
    }

    /// Evaluates the predicate.
    #[must_use]
    pub fn matches(&self, entity: &Entity) -> bool {
        self.all_of.iter().all(|kind| entity.has(*kind))
            && (self.any_of.is_empty() || self.any_of.iter().any(|kind| entity.has(*kind)))
            && !self.none_of.iter().any(|kind| entity.has(*kind))
    }

    /// Every kind the predicate result depends on.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<ComponentKind> {
        self.all_of
            .iter()
            .chain(&self.any_of)
            .chain(&self.none_of)
            .copied()
            .collect()
    }

    /// Whether applying `patch` could change the predicate result.
    #[inline]
    #[must_use]
    pub fn could_affect(&self, patch: &EntityPatch) -> bool {
        patch.touched().any(|kind| {
            self.all_of.contains(&kind) || self.any_of.contains(&kind) || self.none_of.contains(&kind)
        })
    }
}

/// Current-state lookup used to re-evaluate the filter.
pub trait EntityLookup {
    /// Returns the entity's components as of the changes being processed.
    fn lookup(&self, id: EntityId) -> Option<&Entity>;
}

impl EntityLookup for VersionedTable {
    fn lookup(&self, id: EntityId) -> Option<&Entity> {
        self.get(id)
    }
}

impl<S: BuildHasher> EntityLookup for HashMap<EntityId, Option<Entity>, S> {
    fn lookup(&self, id: EntityId) -> Option<&Entity> {
        self.get(&id).and_then(Option::as_ref)
    }
}

/// Per-subscription filter state.
#[derive(Debug, Default)]
pub struct FilterContext {
    filter: EntityFilter,
    inclusion: HashSet<EntityId>,
}

impl FilterContext {
    /// Creates a context with an empty inclusion set.
    #[must_use]
    pub fn new(filter: EntityFilter) -> Self {
        Self {
            filter,
            inclusion: HashSet::new(),
        }
    }

    /// Creates a context whose subscriber already holds `included`.
    #[must_use]
    pub fn resumed(filter: EntityFilter, included: impl IntoIterator<Item = EntityId>) -> Self {
        Self {
            filter,
            inclusion: included.into_iter().collect(),
        }
    }

    /// The predicate.
    #[inline]
    #[must_use]
    pub fn predicate(&self) -> &EntityFilter {
        &self.filter
    }

    /// Whether `id` is currently visible.
    #[inline]
    #[must_use]
    pub fn is_included(&self, id: EntityId) -> bool {
        self.inclusion.contains(&id)
    }

    /// The inclusion set.
    #[must_use]
    pub fn inclusion(&self) -> &HashSet<EntityId> {
        &self.inclusion
    }

    /// Keeps only changes to currently included ids. Does not touch the set.
    #[must_use]
    pub fn filter(&self, changes: &[Change]) -> Vec<Change> {
        changes
            .iter()
            .filter(|change| self.inclusion.contains(&change.id()))
            .cloned()
            .collect()
    }

    /// Recomputes inclusion for `changes` and returns the visible stream.
    ///
    /// `lookup` must reflect entity state after `changes` were committed.
    pub fn process(&mut self, changes: &[Change], lookup: &impl EntityLookup) -> Vec<Change> {
        let mut out = Vec::with_capacity(changes.len());

        for change in changes {
            match change {
                Change::Create { tick, entity } => {
                    if self.filter.matches(entity) {
                        self.inclusion.insert(entity.id);
                        out.push(change.clone());
                    } else if self.inclusion.remove(&entity.id) {
                        out.push(Change::Delete {
                            tick: *tick,
                            id: entity.id,
                        });
                    }
                }
                Change::Update { tick, patch } => {
                    let included = self.inclusion.contains(&patch.id);
                    if !self.filter.could_affect(patch) {
                        if included {
                            out.push(change.clone());
                        }
                        continue;
                    }

                    match lookup.lookup(patch.id).filter(|entity| self.filter.matches(entity)) {
                        Some(_) if included => out.push(change.clone()),
                        Some(entity) => {
                            self.inclusion.insert(patch.id);
                            out.push(Change::Create {
                                tick: *tick,
                                entity: entity.clone(),
                            });
                        }
                        None if included => {
                            self.inclusion.remove(&patch.id);
                            out.push(Change::Delete {
                                tick: *tick,
                                id: patch.id,
                            });
                        }
                        None => {}
                    }
                }
                Change::Delete { id, .. } => {
                    if self.inclusion.remove(id) {
                        out.push(change.clone());
                    }
                }
            }
        }

        out
    }

    /// Forgets every included id.
    pub fn clear(&mut self) {
        self.inclusion.clear();
    }
}
