//! # Observer
//!
//! Per-client delta generation. The observer tracks, for every entity the
//! client holds, the version it holds it at. Every outgoing change is
//! checked against that map:
//!
//! - changes at or below the held version are dropped
//! - an update for an entity the client does not hold is sent as a full create
//! - an entity that stops being visible is deleted from the client
//!
//! Visible means resident (see [`SubscriptionScanner`]) and matching the
//! client's filter. The subject is visible regardless of the filter.

use std::collections::{HashMap, HashSet};

use meridian_core::{Change, EntityFilter, EntityId, FilterContext, Tick};

use crate::index::{IndexBatch, IndexState};
use crate::scanner::{ScanDelta, SubscriptionScanner};

/// Delta generator for one client.
#[derive(Debug)]
pub struct Observer {
    scanner: SubscriptionScanner,
    filter: FilterContext,
    client: HashMap<EntityId, Tick>,
}

impl Observer {
    /// Creates an observer for a client that already holds `known`.
    #[must_use]
    pub fn new(
        subject: EntityId,
        radius: f64,
        filter: EntityFilter,
        known: HashMap<EntityId, Tick>,
    ) -> Self {
        Self {
            scanner: SubscriptionScanner::new(subject, radius),
            filter: FilterContext::new(filter),
            client: known,
        }
    }

    /// What the client holds, by version.
    #[must_use]
    pub fn client_versions(&self) -> &HashMap<EntityId, Tick> {
        &self.client
    }

    /// The area-of-interest tracker.
    #[must_use]
    pub fn scanner(&self) -> &SubscriptionScanner {
        &self.scanner
    }

    /// Brings the client from whatever it holds to `state`.
    ///
    /// Used for the first bootstrap and whenever the observer lost track of
    /// the batch stream. Output is ordered by `(tick, id)`.
    pub fn bootstrap(&mut self, state: &IndexState) -> Vec<Change> {
        let predicate = self.filter.predicate().clone();
        let matching = state
            .iter()
            .filter(|(_, entity)| predicate.matches(entity))
            .map(|(_, entity)| entity.id);
        self.filter = FilterContext::resumed(predicate.clone(), matching);
        self.scanner.rescan(state);

        let mut out = Vec::new();

        let mut stale: Vec<EntityId> = self
            .client
            .keys()
            .filter(|id| !self.is_visible(**id) || state.get(**id).is_none())
            .copied()
            .collect();
        stale.sort_unstable();
        for id in stale {
            self.client.remove(&id);
            out.push(Change::Delete {
                tick: state.tick(),
                id,
            });
        }

        let resident: Vec<EntityId> = self.scanner.resident().iter().copied().collect();
        for id in resident {
            if !self.is_visible(id) {
                continue;
            }
            let Some(entity) = state.get(id) else {
                continue;
            };
            let version = state.version(id);
            if self.client.get(&id) != Some(&version) {
                self.client.insert(id, version);
                out.push(Change::Create {
                    tick: version,
                    entity: entity.clone(),
                });
            }
        }

        out.sort_by_key(|change| (change.tick(), change.id()));
        out
    }

    /// Turns one index batch into the client's delta.
    ///
    /// `state` is the index at or after `batch`.
    pub fn observe(&mut self, batch: &IndexBatch, state: &IndexState) -> Vec<Change> {
        let delta = self.scanner.rescan(state);
        let subject = self.scanner.subject();
        let mut out = Vec::new();

        for change in &*batch.changes {
            let filtered = self
                .filter
                .process(std::slice::from_ref(change), &*batch.post);
            let forwarded = if change.id() == subject {
                Some(change.clone())
            } else {
                filtered.into_iter().next()
            };
            if let Some(change) = forwarded {
                self.forward(change, batch, &mut out);
            }
        }

        self.apply_delta(delta, state, batch.tick, &mut out);
        out
    }

    /// Replaces the always-resident set.
    pub fn refresh_always(&mut self, always: HashSet<EntityId>, state: &IndexState) -> Vec<Change> {
        let delta = self.scanner.refresh_always_resident(always);
        let mut out = Vec::new();
        self.apply_delta(delta, state, state.tick(), &mut out);
        out
    }

    /// Changes the area-of-interest radius.
    pub fn set_radius(&mut self, radius: f64, state: &IndexState) -> Vec<Change> {
        let delta = self.scanner.set_radius(radius, state);
        let mut out = Vec::new();
        self.apply_delta(delta, state, state.tick(), &mut out);
        out
    }

    fn is_visible(&self, id: EntityId) -> bool {
        id == self.scanner.subject()
            || (self.scanner.is_resident(id) && self.filter.is_included(id))
    }

    fn forward(&mut self, change: Change, batch: &IndexBatch, out: &mut Vec<Change>) {
        let id = change.id();
        if !self.scanner.is_resident(id) {
            if self.client.remove(&id).is_some() {
                out.push(Change::Delete {
                    tick: change.tick(),
                    id,
                });
            }
            return;
        }

        match change {
            Change::Delete { .. } => {
                if self.client.remove(&id).is_some() {
                    out.push(change);
                }
            }
            Change::Create { tick, .. } => {
                if self.client.get(&id).map_or(true, |held| *held < tick) {
                    self.client.insert(id, tick);
                    out.push(change);
                }
            }
            Change::Update { tick, .. } => match self.client.get(&id) {
                Some(held) if *held >= tick => {}
                Some(_) => {
                    self.client.insert(id, tick);
                    out.push(change);
                }
                None => {
                    if let Some(Some(entity)) = batch.post.get(&id) {
                        self.client.insert(id, tick);
                        out.push(Change::Create {
                            tick,
                            entity: entity.clone(),
                        });
                    }
                }
            },
        }
    }

    fn apply_delta(
        &mut self,
        delta: ScanDelta,
        state: &IndexState,
        tick: Tick,
        out: &mut Vec<Change>,
    ) {
        for id in delta.left {
            if self.client.remove(&id).is_some() {
                out.push(Change::Delete { tick, id });
            }
        }
        for id in delta.entered {
            if !self.is_visible(id) {
                continue;
            }
            let Some(entity) = state.get(id) else {
                continue;
            };
            let version = state.version(id);
            if self.client.get(&id).map_or(true, |held| *held < version) {
                self.client.insert(id, version);
                out.push(Change::Create {
                    tick: version,
                    entity: entity.clone(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use meridian_core::{Component, ComponentKind, Entity, EntityPatch, Position};

    const ME: EntityId = EntityId::new(1);

    fn at(id: u64, x: f64) -> Entity {
        Entity::new(EntityId::new(id)).with(Component::Position(Position::new(x, 0.0, 0.0)))
    }

    fn batch(state: &mut IndexState, tick: Tick, changes: Vec<Change>) -> IndexBatch {
        let post = state.apply(tick, &changes);
        IndexBatch {
            tick,
            changes: changes.into(),
            post: Arc::new(post),
        }
    }

    fn world() -> IndexState {
        let mut state = IndexState::default();
        state.apply(
            3,
            &[
                Change::Create { tick: 1, entity: at(1, 0.0) },
                Change::Create { tick: 2, entity: at(2, 10.0) },
                Change::Create { tick: 3, entity: at(3, 1_000.0) },
            ],
        );
        state
    }

    fn ids(changes: &[Change]) -> Vec<EntityId> {
        changes.iter().map(Change::id).collect()
    }

    #[test]
    fn test_bootstrap_sends_only_nearby() {
        let state = world();
        let mut observer = Observer::new(ME, 50.0, EntityFilter::everything(), HashMap::new());

        let out = observer.bootstrap(&state);
        assert_eq!(ids(&out), vec![EntityId::new(1), EntityId::new(2)]);
        assert!(out.iter().all(|c| matches!(c, Change::Create { .. })));
        assert_eq!(observer.client_versions().len(), 2);
    }

    #[test]
    fn test_bootstrap_skips_known_and_deletes_stale() {
        let state = world();
        let known = HashMap::from([
            (EntityId::new(2), 2),
            (EntityId::new(3), 3),
            (EntityId::new(99), 1),
        ]);
        let mut observer = Observer::new(ME, 50.0, EntityFilter::everything(), known);

        let out = observer.bootstrap(&state);
        let deleted: Vec<EntityId> = out
            .iter()
            .filter(|c| matches!(c, Change::Delete { .. }))
            .map(Change::id)
            .collect();
        let created: Vec<EntityId> = out
            .iter()
            .filter(|c| matches!(c, Change::Create { .. }))
            .map(Change::id)
            .collect();
        assert_eq!(deleted, vec![EntityId::new(3), EntityId::new(99)]);
        assert_eq!(created, vec![EntityId::new(1)]);
    }

    #[test]
    fn test_stale_known_version_is_resent() {
        let state = world();
        let known = HashMap::from([(EntityId::new(2), 1)]);
        let mut observer = Observer::new(ME, 50.0, EntityFilter::everything(), known);

        let out = observer.bootstrap(&state);
        assert!(out
            .iter()
            .any(|c| matches!(c, Change::Create { tick: 2, entity } if entity.id == EntityId::new(2))));
    }

    #[test]
    fn test_moving_entities_enter_and_leave() {
        let mut state = world();
        let mut observer = Observer::new(ME, 50.0, EntityFilter::everything(), HashMap::new());
        observer.bootstrap(&state);

        let far = EntityPatch::new(EntityId::new(2))
            .set(Component::Position(Position::new(900.0, 0.0, 0.0)));
        let near = EntityPatch::new(EntityId::new(3))
            .set(Component::Position(Position::new(20.0, 0.0, 0.0)));
        let b = batch(
            &mut state,
            5,
            vec![
                Change::Update { tick: 4, patch: far },
                Change::Update { tick: 5, patch: near },
            ],
        );

        let out = observer.observe(&b, &state);
        assert_eq!(
            out,
            vec![
                Change::Delete { tick: 4, id: EntityId::new(2) },
                Change::Create { tick: 5, entity: at(3, 20.0) },
            ]
        );
        assert!(!observer.client_versions().contains_key(&EntityId::new(2)));
        assert_eq!(observer.client_versions()[&EntityId::new(3)], 5);
    }

    #[test]
    fn test_resident_updates_are_forwarded_once() {
        let mut state = world();
        let mut observer = Observer::new(ME, 50.0, EntityFilter::everything(), HashMap::new());
        observer.bootstrap(&state);

        let patch = EntityPatch::new(EntityId::new(2)).set(Component::Label("lamp".into()));
        let b = batch(&mut state, 4, vec![Change::Update { tick: 4, patch: patch.clone() }]);

        let out = observer.observe(&b, &state);
        assert_eq!(out, vec![Change::Update { tick: 4, patch }]);

        // Replaying the same batch is a no-op.
        assert!(observer.observe(&b, &state).is_empty());
    }

    #[test]
    fn test_subject_bypasses_filter() {
        let mut state = world();
        let filter = EntityFilter::everything().with(ComponentKind::LightSource);
        let mut observer = Observer::new(ME, 50.0, filter, HashMap::new());

        let out = observer.bootstrap(&state);
        assert_eq!(ids(&out), vec![ME]);

        let moved = EntityPatch::new(ME).set(Component::Position(Position::new(1.0, 0.0, 0.0)));
        let b = batch(&mut state, 4, vec![Change::Update { tick: 4, patch: moved }]);
        assert_eq!(ids(&observer.observe(&b, &state)), vec![ME]);
    }

    #[test]
    fn test_filter_exit_deletes() {
        let mut state = world();
        let filter = EntityFilter::everything().with(ComponentKind::Position);
        let mut observer = Observer::new(ME, 50.0, filter, HashMap::new());
        observer.bootstrap(&state);

        let unplaced = EntityPatch::new(EntityId::new(2)).remove(ComponentKind::Position);
        let b = batch(&mut state, 4, vec![Change::Update { tick: 4, patch: unplaced }]);
        assert_eq!(
            observer.observe(&b, &state),
            vec![Change::Delete { tick: 4, id: EntityId::new(2) }]
        );
    }

    #[test]
    fn test_always_resident_refresh() {
        let state = world();
        let mut observer = Observer::new(ME, 50.0, EntityFilter::everything(), HashMap::new());
        observer.bootstrap(&state);

        let out = observer.refresh_always(HashSet::from([EntityId::new(3)]), &state);
        assert_eq!(out, vec![Change::Create { tick: 3, entity: at(3, 1_000.0) }]);

        let out = observer.refresh_always(HashSet::new(), &state);
        assert_eq!(out, vec![Change::Delete { tick: 3, id: EntityId::new(3) }]);
    }
}
