//! # Change Streams
//!
//! A subscription delivers the world to one consumer through its own
//! [`FilterContext`]:
//!
//! ```text
//! attach ──▶ bootstrap (every live entity as a create, filtered)
//!              │  last batch carries `bootstrapped = true`
//!              ▼
//!            live tail (log entries after the bootstrap tick, filtered)
//! ```
//!
//! The bootstrap snapshot and its tick are taken under one read lock, so the
//! tail continues from exactly that tick: no gaps, no duplicates.
//!
//! A subscriber that falls behind the retained log cannot be served from the
//! log without a gap. Its stream resynchronizes in place instead: deletes for
//! held ids that are gone or no longer match, then every visible entity as a
//! create, all in one ordinary update.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use meridian_core::{Change, Entity, EntityFilter, EntityId, FilterContext, Shutdown, Tick};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::store::{LogEntry, Shared, State};

/// Where a reconnecting subscriber left off.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resume {
    /// Last tick the subscriber has fully seen.
    pub tick: Tick,
    /// Ids the subscriber currently holds.
    pub included: Vec<EntityId>,
}

/// Subscription options.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionConfig {
    /// Predicate deciding which entities are visible.
    pub filter: EntityFilter,
    /// Resume point. Ignored (full bootstrap) if outside the retained log.
    pub resume: Option<Resume>,
    /// Attach at the live tail without a bootstrap.
    pub skip_bootstrap: bool,
}

impl SubscriptionConfig {
    /// Everything, with a bootstrap.
    #[must_use]
    pub fn everything() -> Self {
        Self::default()
    }

    /// Entities matching `filter`, with a bootstrap.
    #[must_use]
    pub fn filtered(filter: EntityFilter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }
}

/// One delivered batch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorldUpdate {
    /// Visible changes, in commit order.
    pub changes: Vec<Change>,
    /// Set on exactly one update per subscription: the end of the bootstrap.
    pub bootstrapped: bool,
    /// The subscriber has now seen every commit up to this tick.
    pub tick: Tick,
}

/// A live change stream.
///
/// The stream ends when the cancel token fires. Dropping the handle stops the
/// pump.
#[derive(Debug)]
pub struct Subscription {
    updates: mpsc::Receiver<WorldUpdate>,
    pump: JoinHandle<()>,
}

impl Subscription {
    /// Next update, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<WorldUpdate> {
        self.updates.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

pub(crate) fn spawn(shared: Arc<Shared>, config: SubscriptionConfig, cancel: Shutdown) -> Subscription {
    let capacity = shared.config.snapshot().world.subscription_channel_capacity.max(1);
    let (tx, updates) = mpsc::channel(capacity);
    let pump = tokio::spawn(pump(shared, config, cancel, tx));
    Subscription { updates, pump }
}

async fn deliver(tx: &mpsc::Sender<WorldUpdate>, cancel: &Shutdown, update: WorldUpdate) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        sent = tx.send(update) => sent.is_ok(),
    }
}

async fn pump(
    shared: Arc<Shared>,
    config: SubscriptionConfig,
    cancel: Shutdown,
    tx: mpsc::Sender<WorldUpdate>,
) {
    let batch_size = shared.config.snapshot().world.subscription_batch_size.max(1);
    let mut tail = shared.tail.subscribe();

    let (mut cursor, mut filter, bootstrap) = {
        let state = shared.state.read();
        tail.borrow_and_update();

        match config.resume {
            Some(resume) if resume.tick >= state.retained_since && resume.tick <= state.tick => {
                debug!(from = resume.tick, "subscription resumed");
                (
                    resume.tick,
                    FilterContext::resumed(config.filter, resume.included),
                    None,
                )
            }
            _ if config.skip_bootstrap => (state.tick, FilterContext::new(config.filter), None),
            resume => {
                if let Some(resume) = resume {
                    debug!(
                        requested = resume.tick,
                        retained_since = state.retained_since,
                        "resume point outside retained log; bootstrapping"
                    );
                }
                (state.tick, FilterContext::new(config.filter), Some(live_creates(&state)))
            }
        }
    };

    let mut batches: Vec<Vec<Change>> = match bootstrap {
        Some(creates) => {
            let visible = filter.process(&creates, &HashMap::<EntityId, Option<Entity>>::new());
            visible.chunks(batch_size).map(<[Change]>::to_vec).collect()
        }
        None => Vec::new(),
    };
    let last = batches.pop().unwrap_or_default();
    for changes in batches {
        let update = WorldUpdate {
            changes,
            bootstrapped: false,
            tick: cursor,
        };
        if !deliver(&tx, &cancel, update).await {
            return;
        }
    }
    let update = WorldUpdate {
        changes: last,
        bootstrapped: true,
        tick: cursor,
    };
    if !deliver(&tx, &cancel, update).await {
        return;
    }

    loop {
        tail.borrow_and_update();
        let entries: Result<Vec<LogEntry>, (Tick, Vec<Change>)> = {
            let state = shared.state.read();
            if cursor >= state.retained_since {
                Ok(state
                    .log
                    .range(state.log_start_after(cursor)..)
                    .cloned()
                    .collect())
            } else {
                Err((state.tick, live_creates(&state)))
            }
        };
        let entries = match entries {
            Ok(entries) => entries,
            Err((tick, creates)) => {
                warn!(cursor, tick, "subscriber fell behind the retained log; resynchronizing");
                let changes = resynchronize(&mut filter, tick, &creates);
                cursor = tick;
                for changes in changes.chunks(batch_size) {
                    let update = WorldUpdate {
                        changes: changes.to_vec(),
                        bootstrapped: false,
                        tick,
                    };
                    if !deliver(&tx, &cancel, update).await {
                        return;
                    }
                }
                continue;
            }
        };

        let mut pending = Vec::new();
        for entry in entries {
            pending.extend(filter.process(&entry.changes, &*entry.post));
            cursor = entry.tick;
            if pending.len() >= batch_size {
                let update = WorldUpdate {
                    changes: std::mem::take(&mut pending),
                    bootstrapped: false,
                    tick: cursor,
                };
                if !deliver(&tx, &cancel, update).await {
                    return;
                }
            }
        }
        if !pending.is_empty() {
            let update = WorldUpdate {
                changes: pending,
                bootstrapped: false,
                tick: cursor,
            };
            if !deliver(&tx, &cancel, update).await {
                return;
            }
        }

        tokio::select! {
            () = cancel.cancelled() => return,
            changed = tail.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

/// Every live entity as a create, ordered by `(version, id)`.
fn live_creates(state: &State) -> Vec<Change> {
    let mut creates: Vec<Change> = state
        .table
        .iter_live()
        .map(|(version, entity)| Change::Create {
            tick: version,
            entity: entity.clone(),
        })
        .collect();
    creates.sort_by_key(|change| (change.tick(), change.id()));
    creates
}

/// Replaces the subscriber's view with `creates` as of `tick`.
fn resynchronize(filter: &mut FilterContext, tick: Tick, creates: &[Change]) -> Vec<Change> {
    let held: HashSet<EntityId> = filter.inclusion().clone();
    filter.clear();
    let visible = filter.process(creates, &HashMap::<EntityId, Option<Entity>>::new());

    let mut gone: Vec<EntityId> = held.into_iter().filter(|id| !filter.is_included(*id)).collect();
    gone.sort();
    let mut changes: Vec<Change> = gone.into_iter().map(|id| Change::Delete { tick, id }).collect();
    changes.extend(visible);
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::WorldStore;
    use meridian_core::{
        ChangeToApply, Component, ComponentKind, ConfigHandle, EntityPatch, MeridianConfig,
        TaskScope,
    };
    use std::time::Duration;

    async fn next(sub: &mut Subscription) -> WorldUpdate {
        tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("update in time")
            .expect("stream open")
    }

    #[tokio::test]
    async fn test_bootstrap_then_live_tail() {
        let store = WorldStore::in_memory(ConfigHandle::default());
        let scope = TaskScope::new("test");
        let a = store.allocate_id();
        let b = store.allocate_id();
        store
            .apply(vec![ChangeToApply::new().create(Entity::new(a))])
            .await
            .unwrap();

        let mut sub = store.subscribe(SubscriptionConfig::everything(), scope.token());
        let boot = next(&mut sub).await;
        assert!(boot.bootstrapped);
        assert_eq!(boot.tick, 1);
        assert_eq!(boot.changes.len(), 1);
        assert_eq!(boot.changes[0].id(), a);

        store
            .apply(vec![ChangeToApply::new().create(Entity::new(b))])
            .await
            .unwrap();
        let live = next(&mut sub).await;
        assert!(!live.bootstrapped);
        assert_eq!(live.tick, 2);
        assert!(matches!(&live.changes[..], [Change::Create { tick: 2, entity }] if entity.id == b));

        scope.shutdown().await;
    }

    #[tokio::test]
    async fn test_bootstrap_is_split_into_batches() {
        let mut config = MeridianConfig::default();
        config.world.subscription_batch_size = 2;
        let store = WorldStore::in_memory(ConfigHandle::new(config));
        let scope = TaskScope::new("test");
        for _ in 0..5 {
            let id = store.allocate_id();
            store
                .apply(vec![ChangeToApply::new().create(Entity::new(id))])
                .await
                .unwrap();
        }

        let mut sub = store.subscribe(SubscriptionConfig::everything(), scope.token());
        let sizes = [
            next(&mut sub).await,
            next(&mut sub).await,
            next(&mut sub).await,
        ];
        assert_eq!(sizes.iter().map(|u| u.changes.len()).collect::<Vec<_>>(), vec![2, 2, 1]);
        assert_eq!(
            sizes.iter().map(|u| u.bootstrapped).collect::<Vec<_>>(),
            vec![false, false, true]
        );
        scope.shutdown().await;
    }

    #[tokio::test]
    async fn test_skip_bootstrap_attaches_at_tail() {
        let store = WorldStore::in_memory(ConfigHandle::default());
        let scope = TaskScope::new("test");
        let a = store.allocate_id();
        store
            .apply(vec![ChangeToApply::new().create(Entity::new(a))])
            .await
            .unwrap();

        let mut sub = store.subscribe(
            SubscriptionConfig {
                skip_bootstrap: true,
                ..SubscriptionConfig::default()
            },
            scope.token(),
        );
        let first = next(&mut sub).await;
        assert!(first.bootstrapped);
        assert!(first.changes.is_empty());

        store
            .apply(vec![ChangeToApply::new().delete(a)])
            .await
            .unwrap();
        let live = next(&mut sub).await;
        assert_eq!(live.changes, vec![Change::Delete { tick: 2, id: a }]);
        scope.shutdown().await;
    }

    #[tokio::test]
    async fn test_resume_replays_only_missed_changes() {
        let store = WorldStore::in_memory(ConfigHandle::default());
        let scope = TaskScope::new("test");
        let a = store.allocate_id();
        store
            .apply(vec![ChangeToApply::new().create(Entity::new(a))])
            .await
            .unwrap();
        store
            .apply(vec![ChangeToApply::new().update(
                EntityPatch::new(a).set(Component::Label("moved".into())),
            )])
            .await
            .unwrap();

        let mut sub = store.subscribe(
            SubscriptionConfig {
                resume: Some(Resume {
                    tick: 1,
                    included: vec![a],
                }),
                ..SubscriptionConfig::default()
            },
            scope.token(),
        );
        let first = next(&mut sub).await;
        assert!(first.bootstrapped);
        assert!(first.changes.is_empty());

        let replay = next(&mut sub).await;
        assert!(matches!(&replay.changes[..], [Change::Update { tick: 2, .. }]));
        scope.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_resume_forces_bootstrap() {
        let mut config = MeridianConfig::default();
        config.world.log_retention_ms = 0;
        let store = WorldStore::in_memory(ConfigHandle::new(config));
        let scope = TaskScope::new("test");
        let a = store.allocate_id();
        store
            .apply(vec![ChangeToApply::new().create(Entity::new(a))])
            .await
            .unwrap();
        store
            .apply(vec![ChangeToApply::new().create(Entity::new(store.allocate_id()))])
            .await
            .unwrap();
        store.trim();

        let mut sub = store.subscribe(
            SubscriptionConfig {
                resume: Some(Resume {
                    tick: 1,
                    included: vec![a],
                }),
                ..SubscriptionConfig::default()
            },
            scope.token(),
        );
        let boot = next(&mut sub).await;
        assert!(boot.bootstrapped);
        assert_eq!(boot.changes.len(), 2);
        scope.shutdown().await;
    }

    #[tokio::test]
    async fn test_trim_under_slow_subscriber_resynchronizes() {
        let mut config = MeridianConfig::default();
        config.world.log_retention_ms = 0;
        let store = WorldStore::in_memory(ConfigHandle::new(config));
        let scope = TaskScope::new("test");
        let (a, b, c, d) = (
            store.allocate_id(),
            store.allocate_id(),
            store.allocate_id(),
            store.allocate_id(),
        );
        store
            .apply(vec![ChangeToApply::new().create(Entity::new(a)).create(Entity::new(b))])
            .await
            .unwrap();

        let mut sub = store.subscribe(SubscriptionConfig::everything(), scope.token());
        let boot = next(&mut sub).await;
        assert!(boot.bootstrapped);
        assert_eq!(boot.changes.len(), 2);

        // No await between commit and trim: the pump never sees ticks 2 and 3.
        store
            .apply(vec![
                ChangeToApply::new().delete(a).create(Entity::new(c)),
                ChangeToApply::new().update(EntityPatch::new(b).set(Component::Label("b".into()))),
            ])
            .await
            .unwrap();
        assert_eq!(store.trim(), 3);
        assert_eq!(store.retained_since(), 3);

        let resync = next(&mut sub).await;
        assert!(!resync.bootstrapped);
        assert_eq!(resync.tick, 3);
        assert!(matches!(
            &resync.changes[..],
            [
                Change::Delete { tick: 3, id: gone },
                Change::Create { tick: 2, entity: first },
                Change::Create { tick: 3, entity: second },
            ] if *gone == a && first.id == c && second.id == b
        ));

        store
            .apply(vec![ChangeToApply::new().create(Entity::new(d))])
            .await
            .unwrap();
        let live = next(&mut sub).await;
        assert!(matches!(&live.changes[..], [Change::Create { tick: 4, entity }] if entity.id == d));
        scope.shutdown().await;
    }

    #[tokio::test]
    async fn test_filtered_stream_synthesizes_lifecycle() {
        let store = WorldStore::in_memory(ConfigHandle::default());
        let scope = TaskScope::new("test");
        let a = store.allocate_id();
        store
            .apply(vec![ChangeToApply::new().create(Entity::new(a))])
            .await
            .unwrap();

        let mut sub = store.subscribe(
            SubscriptionConfig::filtered(EntityFilter::everything().with(ComponentKind::Label)),
            scope.token(),
        );
        assert!(next(&mut sub).await.changes.is_empty());

        store
            .apply(vec![ChangeToApply::new().update(
                EntityPatch::new(a).set(Component::Label("seen".into())),
            )])
            .await
            .unwrap();
        store
            .apply(vec![ChangeToApply::new().update(EntityPatch::new(a).remove(ComponentKind::Label))])
            .await
            .unwrap();

        let mut seen = Vec::new();
        while seen.len() < 2 {
            seen.extend(next(&mut sub).await.changes);
        }
        assert!(matches!(seen[0], Change::Create { tick: 2, .. }));
        assert_eq!(seen[1], Change::Delete { tick: 3, id: a });
        scope.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_ends_stream() {
        let store = WorldStore::in_memory(ConfigHandle::default());
        let scope = TaskScope::new("test");
        let mut sub = store.subscribe(SubscriptionConfig::everything(), scope.token());
        assert!(next(&mut sub).await.bootstrapped);

        scope.cancel();
        assert!(sub.recv().await.is_none());
    }
}
