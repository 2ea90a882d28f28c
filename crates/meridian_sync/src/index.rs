//! # Sync Index
//!
//! One world subscription per sync server, mirrored in memory and bucketed
//! by shard so area-of-interest queries touch only nearby cells. Every
//! applied batch is rebroadcast to sessions together with the post-commit
//! state of the entities it touched.
//!
//! If the world stream closes, the index resubscribes and reconciles the new
//! bootstrap against its mirror, emitting deletes for entities that vanished
//! in between. Sessions never see the seam.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use meridian_core::{
    Change, Component, ComponentKind, ConfigHandle, Entity, EntityId, EntityLookup, Position,
    ShardId, Shutdown, TaskScope, Tick, SHARD_DIM,
};
use meridian_world::{SubscriptionConfig, World};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::scanner::SpatialIndex;

/// Batches buffered per session before it must resynchronize.
const BATCH_CHANNEL_CAPACITY: usize = 1024;

/// One applied world update.
#[derive(Clone, Debug)]
pub struct IndexBatch {
    /// Last tick covered.
    pub tick: Tick,
    /// Changes in commit order.
    pub changes: Arc<[Change]>,
    /// State of every touched entity after the batch.
    pub post: Arc<HashMap<EntityId, Option<Entity>>>,
}

/// Mirrored world state.
#[derive(Debug, Default)]
pub struct IndexState {
    tick: Tick,
    entities: HashMap<EntityId, (Tick, Entity)>,
    buckets: HashMap<ShardId, HashSet<EntityId>>,
    located: HashMap<EntityId, (ShardId, Position)>,
}

impl IndexState {
    /// Last tick applied.
    #[must_use]
    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// Live entity count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the mirror is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Current entity.
    #[must_use]
    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id).map(|(_, entity)| entity)
    }

    /// Current version, `0` if absent.
    #[must_use]
    pub fn version(&self, id: EntityId) -> Tick {
        self.entities.get(&id).map_or(0, |(version, _)| *version)
    }

    /// Every live entity with its version.
    pub fn iter(&self) -> impl Iterator<Item = (Tick, &Entity)> {
        self.entities.values().map(|(version, entity)| (*version, entity))
    }

    /// Applies `changes` committed up to `tick`; returns post-batch state
    /// of every touched id.
    pub fn apply(&mut self, tick: Tick, changes: &[Change]) -> HashMap<EntityId, Option<Entity>> {
        let mut touched = HashSet::new();
        for change in changes {
            let id = change.id();
            touched.insert(id);
            match change {
                Change::Create { tick, entity } => {
                    self.entities.insert(id, (*tick, entity.clone()));
                }
                Change::Update { tick, patch } => {
                    let slot = self
                        .entities
                        .entry(id)
                        .or_insert_with(|| (*tick, Entity::new(id)));
                    slot.0 = (*tick).max(slot.0);
                    slot.1.apply_patch(patch);
                }
                Change::Delete { .. } => {
                    self.entities.remove(&id);
                }
            }
            let position = self
                .get(id)
                .and_then(|entity| entity.get(ComponentKind::Position))
                .and_then(Component::as_position)
                .copied();
            self.relocate(id, position);
        }
        self.tick = self.tick.max(tick);

        touched
            .into_iter()
            .map(|id| (id, self.get(id).cloned()))
            .collect()
    }

    fn relocate(&mut self, id: EntityId, position: Option<Position>) {
        let shard = position.map(|p| ShardId::containing(&p));
        let previous = match (position, self.located.get(&id)) {
            (Some(p), Some((old, _))) if Some(*old) == shard => {
                self.located.insert(id, (*old, p));
                return;
            }
            (_, Some((old, _))) => Some(*old),
            (_, None) => None,
        };
        if let Some(old) = previous {
            if let Some(bucket) = self.buckets.get_mut(&old) {
                bucket.remove(&id);
                if bucket.is_empty() {
                    self.buckets.remove(&old);
                }
            }
            self.located.remove(&id);
        }
        if let (Some(p), Some(shard)) = (position, shard) {
            self.buckets.entry(shard).or_default().insert(id);
            self.located.insert(id, (shard, p));
        }
    }
}

impl EntityLookup for IndexState {
    fn lookup(&self, id: EntityId) -> Option<&Entity> {
        self.get(id)
    }
}

impl SpatialIndex for IndexState {
    fn position(&self, id: EntityId) -> Option<Position> {
        self.located.get(&id).map(|(_, position)| *position)
    }

    fn within(&self, center: &Position, radius: f64) -> Vec<EntityId> {
        if !radius.is_finite() || radius < 0.0 {
            return Vec::new();
        }
        let limit = radius * radius;
        let inside = |position: &Position| position.distance_squared(center) <= limit;

        // More cells than located entities: walk the entities instead.
        let span = (radius / SHARD_DIM).ceil();
        #[allow(clippy::cast_precision_loss)]
        let located = self.located.len() as f64;
        if (2.0 * span + 1.0).powi(3) > located {
            return self
                .located
                .iter()
                .filter(|(_, (_, position))| inside(position))
                .map(|(id, _)| *id)
                .collect();
        }

        #[allow(clippy::cast_possible_truncation)]
        let cells = span as i32;
        ShardId::containing(center)
            .neighborhood(cells)
            .filter_map(|shard| self.buckets.get(&shard))
            .flatten()
            .filter(|id| self.located.get(*id).is_some_and(|(_, position)| inside(position)))
            .copied()
            .collect()
    }
}

#[derive(Debug)]
struct IndexShared {
    state: RwLock<IndexState>,
    batches: broadcast::Sender<Arc<IndexBatch>>,
    ready: watch::Sender<bool>,
}

/// Shared mirror of the world for sync sessions. Cheap to clone.
#[derive(Clone, Debug)]
pub struct SyncIndex {
    shared: Arc<IndexShared>,
    scope: Arc<Mutex<Option<TaskScope>>>,
}

impl SyncIndex {
    /// Creates an empty, stopped index.
    #[must_use]
    pub fn new() -> Self {
        let (batches, _) = broadcast::channel(BATCH_CHANNEL_CAPACITY);
        let (ready, _) = watch::channel(false);
        Self {
            shared: Arc::new(IndexShared {
                state: RwLock::new(IndexState::default()),
                batches,
                ready,
            }),
            scope: Arc::new(Mutex::new(None)),
        }
    }

    /// Starts mirroring `world` under `parent`. No-op if running.
    pub fn start<W: World>(&self, world: W, config: ConfigHandle, parent: &Shutdown) {
        let mut slot = self.scope.lock();
        if slot.is_some() {
            return;
        }
        let scope = TaskScope::child_of("sync-index", parent);
        let shared = Arc::clone(&self.shared);
        let shutdown = scope.token();
        scope.spawn("sync-index", async move { mirror(shared, world, config, shutdown).await });
        *slot = Some(scope);
    }

    /// Waits for the first bootstrap to be mirrored.
    ///
    /// # Errors
    ///
    /// [`SyncError::IndexStopped`] if the index stops first.
    pub async fn ready(&self) -> SyncResult<()> {
        let mut ready = self.shared.ready.subscribe();
        ready
            .wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| SyncError::IndexStopped)
    }

    /// Read access to the mirror. Do not hold across an await.
    #[must_use]
    pub fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.shared.state.read()
    }

    /// Mirror snapshot and a batch receiver starting right after it.
    pub fn attach<T>(
        &self,
        snapshot: impl FnOnce(&IndexState) -> T,
    ) -> (T, broadcast::Receiver<Arc<IndexBatch>>) {
        let state = self.shared.state.read();
        let batches = self.shared.batches.subscribe();
        (snapshot(&state), batches)
    }

    /// Stops mirroring.
    pub async fn stop(&self) {
        let scope = self.scope.lock().take();
        if let Some(scope) = scope {
            scope.shutdown().await;
        }
    }
}

impl Default for SyncIndex {
    fn default() -> Self {
        Self::new()
    }
}

async fn mirror<W: World>(
    shared: Arc<IndexShared>,
    world: W,
    config: ConfigHandle,
    shutdown: Shutdown,
) {
    let mut generation = 0u64;
    loop {
        let mut stream = world.subscribe(SubscriptionConfig::everything(), shutdown.clone());
        // Ids seen in this generation's bootstrap; `None` once live.
        let mut seen: Option<HashSet<EntityId>> = Some(HashSet::new());

        while let Some(update) = stream.recv().await {
            let mut changes = update.changes;
            if let Some(seen) = seen.as_mut() {
                seen.extend(changes.iter().map(Change::id));
            }
            if update.bootstrapped {
                if let Some(seen) = seen.take() {
                    if generation > 0 {
                        let vanished: Vec<Change> = shared
                            .state
                            .read()
                            .entities
                            .keys()
                            .filter(|id| !seen.contains(id))
                            .map(|id| Change::Delete {
                                tick: update.tick,
                                id: *id,
                            })
                            .collect();
                        debug!(vanished = vanished.len(), "reconciled sync index after resubscribe");
                        changes.extend(vanished);
                    }
                }
            }

            if !changes.is_empty() {
                let mut state = shared.state.write();
                let post = state.apply(update.tick, &changes);
                // No sessions is fine.
                let _ = shared.batches.send(Arc::new(IndexBatch {
                    tick: update.tick,
                    changes: changes.into(),
                    post: Arc::new(post),
                }));
            }

            if update.bootstrapped {
                let entities = shared.state.read().len();
                info!(entities, tick = update.tick, "sync index bootstrapped");
                shared.ready.send_replace(true);
            }
        }

        if shutdown.is_cancelled() {
            break;
        }
        generation += 1;
        warn!(generation, "sync index stream closed; resubscribing");
        let pause = config.snapshot().simulation.retry_base_ms;
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(std::time::Duration::from_millis(pause)) => {}
        }
    }
}
