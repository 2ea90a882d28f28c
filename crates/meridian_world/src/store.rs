//! # World Store
//!
//! The authoritative, shared entity store.
//!
//! ```text
//!            apply ──▶ iffs ──▶ WAL ──▶ table ──▶ change log ──▶ tail notify
//!                                                     │
//!  get_with_version ◀── table              subscribe ◀┘ (bootstrap + live tail)
//! ```
//!
//! Every committed transaction is stamped with one global tick. The change
//! log keeps each transaction's committed changes plus the post-commit state
//! of every entity it touched, which is what subscription filters evaluate
//! against. Entries older than the retention window are trimmed; catch-ups
//! and resumes that reach behind the window fall back to full state.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use meridian_core::{
    ApplyStatus, Catchup, Change, ChangeToApply, ConfigHandle, DomainEvent, Entity, EntityId,
    Shutdown, TaskScope, Tick, VersionedTable,
};
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::WorldResult;
use crate::subscription::{self, Subscription, SubscriptionConfig};
use crate::wal::{ChangeLogWal, Recovery};

/// Domain events buffered for slow listeners.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Result of one `apply` call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ApplyResult {
    /// Per-transaction outcome, in input order.
    pub outcomes: Vec<ApplyStatus>,
    /// Eager catch-up changes of successful transactions.
    pub changes: Vec<Change>,
}

impl ApplyResult {
    /// Whether every transaction committed.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|outcome| *outcome == ApplyStatus::Success)
    }

    /// Number of transactions that could not be persisted.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| **outcome == ApplyStatus::Failed)
            .count()
    }

    /// Number of aborted transactions.
    #[must_use]
    pub fn aborted(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| **outcome == ApplyStatus::Aborted)
            .count()
    }
}

/// A domain event with the tick of the transaction that published it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommittedEvent {
    /// Commit tick.
    pub tick: Tick,
    /// The event.
    pub event: DomainEvent,
}

/// One committed transaction in the retained change log.
#[derive(Clone, Debug)]
pub(crate) struct LogEntry {
    pub(crate) tick: Tick,
    pub(crate) committed_at: Instant,
    pub(crate) changes: Arc<[Change]>,
    /// State of every touched entity right after this commit.
    pub(crate) post: Arc<HashMap<EntityId, Option<Entity>>>,
}

#[derive(Debug, Default)]
pub(crate) struct State {
    pub(crate) table: VersionedTable,
    pub(crate) tick: Tick,
    pub(crate) log: VecDeque<LogEntry>,
    /// The log holds every committed tick strictly above this one.
    pub(crate) retained_since: Tick,
}

impl State {
    /// Index of the first log entry with a tick above `tick`.
    pub(crate) fn log_start_after(&self, tick: Tick) -> usize {
        self.log.partition_point(|entry| entry.tick <= tick)
    }

    fn catchup(&self, catchup: &Catchup, now: Tick) -> Vec<Change> {
        if catchup.since < self.retained_since {
            let current = match self.table.get(catchup.id) {
                Some(entity) => Change::Create {
                    tick: now,
                    entity: entity.clone(),
                },
                None => Change::Delete {
                    tick: now,
                    id: catchup.id,
                },
            };
            return vec![current];
        }

        self.log
            .range(self.log_start_after(catchup.since)..)
            .flat_map(|entry| entry.changes.iter())
            .filter(|change| change.id() == catchup.id)
            .cloned()
            .collect()
    }
}

#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) state: RwLock<State>,
    pub(crate) tail: watch::Sender<Tick>,
    pub(crate) config: ConfigHandle,
    events: broadcast::Sender<CommittedEvent>,
    wal: Option<ChangeLogWal>,
    wal_records: AtomicU64,
    next_id: AtomicU64,
}

/// Handle to the world store. Cheap to clone.
#[derive(Clone, Debug)]
pub struct WorldStore {
    shared: Arc<Shared>,
}

impl WorldStore {
    /// Creates an empty, purely in-memory store.
    #[must_use]
    pub fn in_memory(config: ConfigHandle) -> Self {
        Self::from_recovery(config, None, Recovery::default())
    }

    /// Opens a store backed by the WAL at `path`, replaying it.
    ///
    /// # Errors
    ///
    /// Fails if the WAL cannot be opened or is not a MERIDIAN WAL.
    pub fn with_wal(config: ConfigHandle, path: impl AsRef<Path>) -> WorldResult<Self> {
        let (wal, recovery) = ChangeLogWal::open(path)?;
        Ok(Self::from_recovery(config, Some(wal), recovery))
    }

    /// Opens the store described by `world.wal_path`, in-memory if unset.
    ///
    /// # Errors
    ///
    /// See [`WorldStore::with_wal`].
    pub fn open(config: ConfigHandle) -> WorldResult<Self> {
        match config.snapshot().world.wal_path.clone() {
            Some(path) => Self::with_wal(config, path),
            None => Ok(Self::in_memory(config)),
        }
    }

    fn from_recovery(config: ConfigHandle, wal: Option<ChangeLogWal>, recovery: Recovery) -> Self {
        let next_id = recovery
            .table
            .records()
            .map(|(id, _)| *id)
            .filter(|id| !id.is_derived())
            .max()
            .map_or(1, |id| id.raw() + 1);

        let (tail, _) = watch::channel(recovery.tick);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(State {
                    table: recovery.table,
                    tick: recovery.tick,
                    log: VecDeque::new(),
                    retained_since: recovery.tick,
                }),
                tail,
                config,
                events,
                wal,
                wal_records: AtomicU64::new(0),
                next_id: AtomicU64::new(next_id),
            }),
        }
    }

    /// Hands out a fresh, never-used entity id.
    #[must_use]
    pub fn allocate_id(&self) -> EntityId {
        EntityId::new(self.shared.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Latest committed tick.
    #[must_use]
    pub fn tick(&self) -> Tick {
        self.shared.state.read().tick
    }

    /// Oldest tick a resume or catch-up can start from without a gap.
    #[must_use]
    pub fn retained_since(&self) -> Tick {
        self.shared.state.read().retained_since
    }

    /// Number of transactions in the retained change log.
    #[must_use]
    pub fn log_len(&self) -> usize {
        self.shared.state.read().log.len()
    }

    /// Number of live entities.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.shared.state.read().table.live_count()
    }

    /// Runtime configuration this store reads.
    #[must_use]
    pub fn config(&self) -> &ConfigHandle {
        &self.shared.config
    }

    /// Receiver for domain events of committed transactions.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<CommittedEvent> {
        self.shared.events.subscribe()
    }

    /// Applies transactions, each atomically and independently.
    ///
    /// Transactions are committed in chunks of
    /// `world.max_transactions_per_chunk`; each chunk holds the write lock
    /// once. If the WAL rejects a commit, that transaction and every later
    /// one is reported as [`ApplyStatus::Failed`]; earlier ones keep their
    /// outcomes and catch-ups.
    ///
    /// # Errors
    ///
    /// [`WorldError::InvalidChange`](crate::WorldError::InvalidChange) if any
    /// transaction fails validation; nothing is applied.
    pub async fn apply(&self, transactions: Vec<ChangeToApply>) -> WorldResult<ApplyResult> {
        for transaction in &transactions {
            transaction.validate()?;
        }

        let chunk_size = self
            .shared
            .config
            .snapshot()
            .world
            .max_transactions_per_chunk
            .max(1);

        let mut result = ApplyResult {
            outcomes: Vec::with_capacity(transactions.len()),
            changes: Vec::new(),
        };
        let mut chunks = transactions.chunks(chunk_size).peekable();
        while let Some(chunk) = chunks.next() {
            if !self.apply_chunk(chunk, &mut result) {
                result.outcomes.resize(transactions.len(), ApplyStatus::Failed);
                break;
            }
            if chunks.peek().is_some() {
                tokio::task::yield_now().await;
            }
        }
        Ok(result)
    }

    /// Commits one chunk. Returns `false` if the WAL failed part way.
    fn apply_chunk(&self, chunk: &[ChangeToApply], result: &mut ApplyResult) -> bool {
        let mut published = Vec::new();
        let mut persisted = true;

        let tick = {
            let mut state = self.shared.state.write();

            for transaction in chunk {
                if !state.table.check_iffs(&transaction.iffs) {
                    result.outcomes.push(ApplyStatus::Aborted);
                    continue;
                }

                let tick = state.tick + 1;
                if let Some(wal) = &self.shared.wal {
                    if let Err(e) = wal.append_commit(tick, &transaction.changes) {
                        warn!(tick, error = %e, "commit not persisted; failing the rest of the batch");
                        persisted = false;
                        break;
                    }
                    self.shared.wal_records.fetch_add(1, Ordering::Relaxed);
                }

                let changes = state.table.apply(tick, &transaction.changes);
                state.tick = tick;

                let post: HashMap<EntityId, Option<Entity>> = changes
                    .iter()
                    .map(|change| (change.id(), state.table.get(change.id()).cloned()))
                    .collect();
                state.log.push_back(LogEntry {
                    tick,
                    committed_at: Instant::now(),
                    changes: changes.into(),
                    post: Arc::new(post),
                });

                for catchup in &transaction.catchups {
                    result.changes.extend(state.catchup(catchup, tick));
                }
                published.extend(transaction.events.iter().map(|event| CommittedEvent {
                    tick,
                    event: event.clone(),
                }));
                result.outcomes.push(ApplyStatus::Success);
            }

            state.tick
        };

        self.shared.tail.send_if_modified(|current| {
            let advanced = *current != tick;
            *current = tick;
            advanced
        });
        for event in published {
            // No listeners is fine.
            let _ = self.shared.events.send(event);
        }

        persisted
    }

    /// Point-in-time `(version, entity)` per id, in input order.
    ///
    /// # Errors
    ///
    /// Never fails for the in-process store; the signature leaves room for
    /// remote backends.
    pub async fn get_with_version(&self, ids: &[EntityId]) -> WorldResult<Vec<(Tick, Option<Entity>)>> {
        let state = self.shared.state.read();
        Ok(ids.iter().map(|id| state.table.get_with_version(*id)).collect())
    }

    /// Current entities, in input order.
    ///
    /// # Errors
    ///
    /// See [`WorldStore::get_with_version`].
    pub async fn get(&self, ids: &[EntityId]) -> WorldResult<Vec<Option<Entity>>> {
        let state = self.shared.state.read();
        Ok(ids.iter().map(|id| state.table.get(*id).cloned()).collect())
    }

    /// Opens a change stream. See [`Subscription`].
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn subscribe(&self, config: SubscriptionConfig, cancel: Shutdown) -> Subscription {
        subscription::spawn(Arc::clone(&self.shared), config, cancel)
    }

    /// Drops change-log entries older than `world.log_retention_ms`.
    ///
    /// Returns the number of entries removed.
    pub fn trim(&self) -> usize {
        let retention = self.shared.config.snapshot().world.log_retention();
        let now = Instant::now();

        let mut guard = self.shared.state.write();
        let state = &mut *guard;
        let mut trimmed = 0;
        while let Some(front) = state.log.front() {
            if now.duration_since(front.committed_at) < retention {
                break;
            }
            state.retained_since = front.tick;
            state.log.pop_front();
            trimmed += 1;
        }

        if trimmed > 0 {
            debug!(trimmed, retained_since = state.retained_since, "change log trimmed");
        }
        trimmed
    }

    /// Rewrites the WAL as a snapshot of the current table.
    ///
    /// Blocks writers for the duration. No-op without a WAL.
    ///
    /// # Errors
    ///
    /// Returns [`WorldError::Wal`](crate::WorldError::Wal); the old log stays valid.
    pub fn checkpoint(&self) -> WorldResult<()> {
        let Some(wal) = &self.shared.wal else {
            return Ok(());
        };
        let state = self.shared.state.write();
        wal.checkpoint(state.tick, &state.table)?;
        self.shared.wal_records.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Spawns the periodic trim (and WAL checkpoint) loop into `scope`.
    pub fn spawn_housekeeping(&self, scope: &TaskScope) {
        let store = self.clone();
        let shutdown = scope.token();
        scope.spawn("world-housekeeping", async move {
            info!("world housekeeping started");
            loop {
                let config = store.shared.config.snapshot();
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(config.world.trim_interval()) => {}
                }

                store.trim();

                let threshold = config.world.wal_checkpoint_records;
                if threshold > 0 && store.shared.wal_records.load(Ordering::Relaxed) >= threshold {
                    if let Err(e) = store.checkpoint() {
                        warn!(error = %e, "WAL checkpoint failed; will retry");
                    }
                }
            }
            info!("world housekeeping stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::{Component, ComponentKind, EntityPatch, MeridianConfig};
    use std::time::Duration;

    fn store() -> WorldStore {
        WorldStore::in_memory(ConfigHandle::default())
    }

    fn label(text: &str) -> Component {
        Component::Label(text.into())
    }

    #[tokio::test]
    async fn test_versions_are_stamped_per_transaction() {
        let store = store();
        let a = store.allocate_id();
        let b = store.allocate_id();

        let result = store
            .apply(vec![
                ChangeToApply::new().create(Entity::new(a)),
                ChangeToApply::new().create(Entity::new(b)),
            ])
            .await
            .unwrap();
        assert!(result.all_succeeded());

        let read = store.get_with_version(&[a, b, EntityId::new(999)]).await.unwrap();
        assert_eq!(read[0].0, 1);
        assert_eq!(read[1].0, 2);
        assert_eq!(read[2], (0, None));
        assert_eq!(store.tick(), 2);
    }

    #[tokio::test]
    async fn test_conflicting_iffs_abort_without_partial_effect() {
        let store = store();
        let a = store.allocate_id();
        let b = store.allocate_id();
        store
            .apply(vec![ChangeToApply::new().create(Entity::new(a))])
            .await
            .unwrap();

        let first = ChangeToApply::new()
            .iff(a, 1)
            .update(EntityPatch::new(a).set(label("first")));
        let second = ChangeToApply::new()
            .iff(a, 1)
            .update(EntityPatch::new(a).set(label("second")))
            .create(Entity::new(b));

        let result = store.apply(vec![first, second]).await.unwrap();
        assert_eq!(result.outcomes, vec![ApplyStatus::Success, ApplyStatus::Aborted]);

        let read = store.get(&[a, b]).await.unwrap();
        assert_eq!(read[0].as_ref().unwrap().get(ComponentKind::Label), Some(&label("first")));
        assert!(read[1].is_none());
        assert_eq!(store.tick(), 2);
    }

    #[tokio::test]
    async fn test_invalid_change_is_rejected_before_commit() {
        let store = store();
        let a = store.allocate_id();
        let err = store
            .apply(vec![
                ChangeToApply::new().create(Entity::new(a)),
                ChangeToApply::new().update(EntityPatch::new(a).set(Component::LightSource { intensity: 200 })),
            ])
            .await;

        assert!(matches!(err, Err(crate::WorldError::InvalidChange(_))));
        assert_eq!(store.tick(), 0);
    }

    #[tokio::test]
    async fn test_catchup_returns_changes_since_tick() {
        let store = store();
        let a = store.allocate_id();
        let b = store.allocate_id();

        store
            .apply(vec![ChangeToApply::new().create(Entity::new(a))])
            .await
            .unwrap();
        store
            .apply(vec![ChangeToApply::new().update(EntityPatch::new(a).set(label("x")))])
            .await
            .unwrap();
        store
            .apply(vec![ChangeToApply::new().create(Entity::new(b))])
            .await
            .unwrap();

        let result = store
            .apply(vec![ChangeToApply::new()
                .catchup(a, 1)
                .update(EntityPatch::new(a).set(label("y")))])
            .await
            .unwrap();

        let ticks: Vec<Tick> = result.changes.iter().map(Change::tick).collect();
        assert_eq!(ticks, vec![2, 4]);
        assert!(result.changes.iter().all(|change| change.id() == a));
    }

    #[tokio::test]
    async fn test_catchup_behind_retention_returns_current_state() {
        let mut config = MeridianConfig::default();
        config.world.log_retention_ms = 0;
        let store = WorldStore::in_memory(ConfigHandle::new(config));
        let a = store.allocate_id();

        store
            .apply(vec![ChangeToApply::new().create(Entity::new(a).with(label("x")))])
            .await
            .unwrap();
        assert_eq!(store.trim(), 1);
        assert_eq!(store.retained_since(), 1);

        let result = store
            .apply(vec![ChangeToApply::new().catchup(a, 0)])
            .await
            .unwrap();
        assert!(matches!(
            &result.changes[..],
            [Change::Create { tick: 2, entity }] if entity.get(ComponentKind::Label) == Some(&label("x"))
        ));
    }

    #[tokio::test]
    async fn test_events_published_only_on_success() {
        let store = store();
        let mut events = store.events();
        let a = store.allocate_id();

        store
            .apply(vec![
                ChangeToApply::new().create(Entity::new(a)).event("spawned", a),
                ChangeToApply::new().iff(a, 7).event("never", a),
            ])
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.tick, 1);
        assert_eq!(event.event.topic, "spawned");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_housekeeping_trims_old_entries() {
        let mut config = MeridianConfig::default();
        config.world.log_retention_ms = 1_000;
        config.world.trim_interval_ms = 100;
        let store = WorldStore::in_memory(ConfigHandle::new(config));
        let scope = TaskScope::new("test");
        store.spawn_housekeeping(&scope);

        let a = store.allocate_id();
        store
            .apply(vec![ChangeToApply::new().create(Entity::new(a))])
            .await
            .unwrap();
        assert_eq!(store.log_len(), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(store.log_len(), 1);

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(store.log_len(), 0);
        assert_eq!(store.retained_since(), 1);

        scope.shutdown().await;
    }

    #[tokio::test]
    async fn test_wal_failure_keeps_committed_outcomes() {
        use crate::wal::{ChangeLogWal, FlakySink};
        use std::sync::atomic::AtomicUsize;

        let path = std::env::temp_dir().join(format!(
            "test_world_store_flaky_{}.wal",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let budget = Arc::new(AtomicUsize::new(1));
        let sink_budget = Arc::clone(&budget);
        let (wal, recovery) =
            ChangeLogWal::open_with(&path, move |file| Box::new(FlakySink::new(file, sink_budget)))
                .unwrap();
        let store = WorldStore::from_recovery(ConfigHandle::default(), Some(wal), recovery);
        let mut events = store.events();
        let (a, b, c) = (store.allocate_id(), store.allocate_id(), store.allocate_id());

        let result = store
            .apply(vec![
                ChangeToApply::new().create(Entity::new(a)).catchup(a, 0).event("made", a),
                ChangeToApply::new().create(Entity::new(b)),
                ChangeToApply::new().create(Entity::new(c)),
            ])
            .await
            .unwrap();
        assert_eq!(
            result.outcomes,
            vec![ApplyStatus::Success, ApplyStatus::Failed, ApplyStatus::Failed]
        );
        assert_eq!(result.failed(), 2);
        assert_eq!(result.changes.iter().map(Change::id).collect::<Vec<_>>(), vec![a]);
        assert_eq!(events.recv().await.unwrap().tick, 1);
        assert_eq!(store.tick(), 1);
        assert!(store.get(&[b]).await.unwrap()[0].is_none());

        budget.store(1, Ordering::SeqCst);
        let retried = store
            .apply(vec![ChangeToApply::new().create(Entity::new(c))])
            .await
            .unwrap();
        assert!(retried.all_succeeded());
        drop(store);

        let reopened = WorldStore::with_wal(ConfigHandle::default(), &path).unwrap();
        assert_eq!(reopened.tick(), 2);
        let read = reopened.get(&[a, b, c]).await.unwrap();
        assert!(read[0].is_some());
        assert!(read[1].is_none());
        assert!(read[2].is_some());

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_wal_backed_store_survives_restart() {
        let path = std::env::temp_dir().join(format!(
            "test_world_store_{}.wal",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));

        let a;
        {
            let store = WorldStore::with_wal(ConfigHandle::default(), &path).unwrap();
            a = store.allocate_id();
            store
                .apply(vec![ChangeToApply::new().create(Entity::new(a).with(label("kept")))])
                .await
                .unwrap();
            store.checkpoint().unwrap();
            store
                .apply(vec![ChangeToApply::new().iff(a, 1).update(EntityPatch::new(a).set(label("later")))])
                .await
                .unwrap();
        }

        let store = WorldStore::with_wal(ConfigHandle::default(), &path).unwrap();
        assert_eq!(store.tick(), 2);
        let read = store.get_with_version(&[a]).await.unwrap();
        assert_eq!(read[0].0, 2);
        assert_eq!(read[0].1.as_ref().unwrap().get(ComponentKind::Label), Some(&label("later")));
        assert_ne!(store.allocate_id(), a);

        std::fs::remove_file(&path).ok();
    }
}
