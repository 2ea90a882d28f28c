//! # Simulation Runner
//!
//! Drives one [`Simulation`] for the shards this worker owns. Three tasks
//! share a [`SimulationQueue`]:
//!
//! - **invalidation pump**: subscribes to the world, maps each change to
//!   shards (bootstrap discoveries low priority, live changes high)
//! - **ownership listener**: drops released shards from the queue and
//!   requeues known shards on acquisition
//! - **worker**: pops a batch, reads each shard entity with its version,
//!   updates, commits with the version as iff
//!
//! A batch that fails to commit goes back on the queue whole, followed by
//! an exponential backoff with jitter.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use meridian_core::{ConfigHandle, ShardId, Shutdown, SimulationConfig, TaskScope};
use meridian_shard::{ShardEvent, ShardOwnership};
use meridian_world::{SubscriptionConfig, World};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, info, warn};

use crate::error::{SimError, SimResult};
use crate::queue::SimulationQueue;
use crate::simulation::{Requeue, Simulation};

/// Retry delay after `failures` consecutive failed batches.
fn backoff(config: &SimulationConfig, failures: u32, rng: &mut impl Rng) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    let base = config
        .retry_base_ms
        .saturating_mul(1 << exponent)
        .min(config.retry_max_ms);
    let jitter = rng.gen_range(0..=base / 2);
    Duration::from_millis(base + jitter)
}

struct Context<W, S> {
    world: W,
    simulation: Arc<S>,
    ownership: Arc<dyn ShardOwnership>,
    queue: Arc<SimulationQueue>,
    config: ConfigHandle,
    /// Every shard the invalidation pump has seen, owned or not. Requeued
    /// on acquisition, since a previous owner may have left it unfinished.
    known: Mutex<HashSet<ShardId>>,
}

/// Runs a simulation over owned shards.
pub struct SimulationRunner<W, S> {
    context: Arc<Context<W, S>>,
    scope: Mutex<Option<TaskScope>>,
}

impl<W: World, S: Simulation> SimulationRunner<W, S> {
    /// Creates a stopped runner.
    #[must_use]
    pub fn new(world: W, simulation: Arc<S>, ownership: Arc<dyn ShardOwnership>, config: ConfigHandle) -> Self {
        let queue = Arc::new(SimulationQueue::new(config.clone(), Arc::clone(&ownership)));
        Self {
            context: Arc::new(Context {
                world,
                simulation,
                ownership,
                queue,
                config,
                known: Mutex::new(HashSet::new()),
            }),
            scope: Mutex::new(None),
        }
    }

    /// The runner's queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<SimulationQueue> {
        &self.context.queue
    }

    /// Spawns the pump, listener and worker under `parent`.
    ///
    /// # Errors
    ///
    /// [`SimError::AlreadyStarted`] if running.
    pub fn start(&self, parent: &Shutdown) -> SimResult<()> {
        let mut slot = self.scope.lock();
        if slot.is_some() {
            return Err(SimError::AlreadyStarted(self.context.simulation.name().to_owned()));
        }

        let name = self.context.simulation.name().to_owned();
        let scope = TaskScope::child_of(format!("sim-{name}"), parent);

        let context = Arc::clone(&self.context);
        let shutdown = scope.token();
        scope.spawn("sim-invalidation", async move { context.pump(shutdown).await });

        let context = Arc::clone(&self.context);
        let shutdown = scope.token();
        let events = self.context.ownership.events();
        scope.spawn("sim-ownership", async move { context.listen(events, shutdown).await });

        let context = Arc::clone(&self.context);
        let shutdown = scope.token();
        scope.spawn("sim-worker", async move { context.work(shutdown).await });

        info!(simulation = %name, "simulation runner started");
        *slot = Some(scope);
        Ok(())
    }

    /// Stops every task and waits for them.
    pub async fn stop(&self) {
        let scope = self.scope.lock().take();
        if let Some(scope) = scope {
            scope.shutdown().await;
            info!(simulation = %self.context.simulation.name(), "simulation runner stopped");
        }
    }
}

impl<W: World, S: Simulation> Context<W, S> {
    async fn pump(&self, shutdown: Shutdown) {
        let name = self.simulation.name();
        loop {
            self.simulation.reset();
            let mut stream = self.world.subscribe(
                SubscriptionConfig::filtered(self.simulation.filter()),
                shutdown.clone(),
            );
            let mut bootstrapping = true;

            while let Some(update) = stream.recv().await {
                let mut known = self.known.lock();
                for change in &update.changes {
                    for shard in self.simulation.invalidate(change) {
                        known.insert(shard);
                        if bootstrapping {
                            self.queue.push_low(shard);
                        } else {
                            self.queue.push(shard);
                        }
                    }
                }
                if update.bootstrapped {
                    debug!(simulation = %name, tick = update.tick, "invalidation stream bootstrapped");
                    bootstrapping = false;
                }
            }

            if shutdown.is_cancelled() {
                break;
            }
            warn!(simulation = %name, "invalidation stream closed; resubscribing");
            let pause = self.config.snapshot().simulation.retry_base_ms;
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(Duration::from_millis(pause)) => {}
            }
        }
    }

    async fn listen(&self, mut events: tokio::sync::broadcast::Receiver<ShardEvent>, shutdown: Shutdown) {
        loop {
            let first = tokio::select! {
                () = shutdown.cancelled() => break,
                event = events.recv() => event,
            };

            let (mut released, mut acquired) = (false, false);
            let mut note = |event: Result<ShardEvent, RecvError>| match event {
                Ok(ShardEvent::Released(_)) => released = true,
                Ok(ShardEvent::Acquired(_)) => acquired = true,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "ownership events lagged; resynchronizing");
                    released = true;
                    acquired = true;
                }
                Err(RecvError::Closed) => {}
            };
            if matches!(first, Err(RecvError::Closed)) {
                break;
            }
            note(first);
            loop {
                match events.try_recv() {
                    Ok(event) => note(Ok(event)),
                    Err(TryRecvError::Lagged(missed)) => note(Err(RecvError::Lagged(missed))),
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                }
            }

            if released {
                let dropped = self.queue.retain_owned();
                debug!(simulation = %self.simulation.name(), dropped, "abandoned released shards");
            }
            if acquired {
                let known: Vec<ShardId> = self.known.lock().iter().copied().collect();
                for shard in known {
                    self.queue.push_low(shard);
                }
            }
        }
    }

    async fn work(&self, shutdown: Shutdown) {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.subsec_nanos().into());
        let mut rng = StdRng::seed_from_u64(seed);
        let mut failures = 0u32;

        while let Some(batch) = self.queue.pop(&shutdown).await {
            match self.process(&batch).await {
                Ok(()) => failures = 0,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = backoff(&self.config.snapshot().simulation, failures, &mut rng);
                    warn!(
                        simulation = %self.simulation.name(),
                        error = %e,
                        shards = batch.len(),
                        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "simulation batch failed; requeued"
                    );
                    self.queue.push_all(batch);
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn process(&self, batch: &[ShardId]) -> SimResult<()> {
        let ids: Vec<_> = batch.iter().map(|shard| self.simulation.shard_entity(shard)).collect();
        let states = self.world.get_with_version(&ids).await?;

        let mut transactions = Vec::new();
        let mut requeues = Vec::new();
        for (shard, (version, entity)) in batch.iter().zip(states) {
            if !self.queue.owns(shard) {
                continue;
            }
            if let Some(result) = self.simulation.update(shard, version, entity.as_ref()) {
                transactions.extend(result.transactions);
                if let Some(requeue) = result.requeue {
                    requeues.push((*shard, requeue));
                }
            }
        }

        if !transactions.is_empty() {
            let result = self.world.apply(transactions).await?;
            if result.failed() > 0 {
                return Err(SimError::Unpersisted {
                    failed: result.failed(),
                });
            }
            if !result.all_succeeded() {
                return Err(SimError::Aborted {
                    aborted: result.aborted(),
                });
            }
        }

        for (shard, requeue) in requeues {
            match requeue {
                Requeue::Immediately => self.queue.push(shard),
                Requeue::After(delay) => self.queue.defer(shard, delay),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lighting::LightingSimulation;
    use meridian_core::{
        ApplyStatus, Change, ChangeToApply, Component, ComponentKind, Entity, EntityId, EntityPatch,
        MeridianConfig, Position, Tick,
    };
    use meridian_shard::FixedOwnership;
    use meridian_world::{ApplyResult, Subscription, WorldResult, WorldStore};
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> ConfigHandle {
        let mut config = MeridianConfig::default();
        config.simulation.throttle_ms = 10;
        config.simulation.retry_base_ms = 10;
        ConfigHandle::new(config)
    }

    fn lamp(id: EntityId, x: f64, intensity: u8) -> Entity {
        Entity::new(id)
            .with(Component::Position(Position::new(x, 1.0, 1.0)))
            .with(Component::LightSource { intensity })
    }

    async fn illumination(store: &WorldStore, sim: &LightingSimulation, shard: ShardId) -> Option<Component> {
        let id = sim.shard_entity(&shard);
        let read = store.get(&[id]).await.unwrap();
        read[0]
            .as_ref()
            .and_then(|entity| entity.get(ComponentKind::Illumination).cloned())
    }

    /// Aborts the first `remaining` apply calls.
    #[derive(Clone)]
    struct FlakyWorld {
        inner: WorldStore,
        remaining: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
    }

    impl World for FlakyWorld {
        fn apply(
            &self,
            transactions: Vec<ChangeToApply>,
        ) -> impl Future<Output = WorldResult<ApplyResult>> + Send {
            let this = self.clone();
            async move {
                this.calls.fetch_add(1, Ordering::SeqCst);
                let abort = this
                    .remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if abort {
                    return Ok(ApplyResult {
                        outcomes: vec![ApplyStatus::Aborted; transactions.len()],
                        changes: Vec::new(),
                    });
                }
                this.inner.apply(transactions).await
            }
        }

        fn get_with_version(
            &self,
            ids: &[EntityId],
        ) -> impl Future<Output = WorldResult<Vec<(Tick, Option<Entity>)>>> + Send {
            self.inner.get_with_version(ids)
        }

        fn subscribe(&self, config: SubscriptionConfig, cancel: Shutdown) -> Subscription {
            self.inner.subscribe(config, cancel)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_light_illuminates_neighborhood() {
        let store = WorldStore::in_memory(config());
        let sim = Arc::new(LightingSimulation::new());
        let scope = TaskScope::new("test");
        let runner = SimulationRunner::new(
            store.clone(),
            Arc::clone(&sim),
            Arc::new(FixedOwnership::all()),
            store.config().clone(),
        );
        runner.start(&scope.token()).unwrap();

        let id = store.allocate_id();
        store
            .apply(vec![ChangeToApply::new().create(lamp(id, 1.0, 12))])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(
            illumination(&store, &sim, ShardId::new(0, 0, 0)).await,
            Some(Component::Illumination { level: 12, sources: 1 })
        );
        assert_eq!(
            illumination(&store, &sim, ShardId::new(1, 1, 1)).await,
            Some(Component::Illumination { level: 7, sources: 1 })
        );
        assert_eq!(illumination(&store, &sim, ShardId::new(2, 0, 0)).await, None);

        store
            .apply(vec![ChangeToApply::new().delete(id)])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            illumination(&store, &sim, ShardId::new(0, 0, 0)).await,
            Some(Component::Illumination { level: 0, sources: 0 })
        );

        runner.stop().await;
        scope.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_covers_existing_lights() {
        let store = WorldStore::in_memory(config());
        let id = store.allocate_id();
        store
            .apply(vec![ChangeToApply::new().create(lamp(id, 1.0, 9))])
            .await
            .unwrap();

        let sim = Arc::new(LightingSimulation::new());
        let scope = TaskScope::new("test");
        let runner = SimulationRunner::new(
            store.clone(),
            Arc::clone(&sim),
            Arc::new(FixedOwnership::all()),
            store.config().clone(),
        );
        runner.start(&scope.token()).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(
            illumination(&store, &sim, ShardId::new(0, 0, 0)).await,
            Some(Component::Illumination { level: 9, sources: 1 })
        );
        runner.stop().await;
        scope.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_batch_is_retried() {
        let store = WorldStore::in_memory(config());
        let flaky = FlakyWorld {
            inner: store.clone(),
            remaining: Arc::new(AtomicUsize::new(3)),
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let sim = Arc::new(LightingSimulation::new());
        let scope = TaskScope::new("test");
        let runner = SimulationRunner::new(
            flaky.clone(),
            Arc::clone(&sim),
            Arc::new(FixedOwnership::all()),
            store.config().clone(),
        );
        runner.start(&scope.token()).unwrap();

        store
            .apply(vec![ChangeToApply::new().create(lamp(store.allocate_id(), 1.0, 12))])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(flaky.calls.load(Ordering::SeqCst) > 3);
        assert_eq!(flaky.remaining.load(Ordering::SeqCst), 0);
        assert_eq!(
            illumination(&store, &sim, ShardId::new(0, 0, 0)).await,
            Some(Component::Illumination { level: 12, sources: 1 })
        );
        runner.stop().await;
        scope.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_shards_are_not_processed() {
        let store = WorldStore::in_memory(config());
        let ownership = Arc::new(FixedOwnership::all());
        let sim = Arc::new(LightingSimulation::new());
        let scope = TaskScope::new("test");
        let runner = SimulationRunner::new(
            store.clone(),
            Arc::clone(&sim),
            ownership.clone(),
            store.config().clone(),
        );
        runner.start(&scope.token()).unwrap();
        tokio::task::yield_now().await;

        ownership.release_all();
        store
            .apply(vec![ChangeToApply::new().create(lamp(store.allocate_id(), 1.0, 12))])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(illumination(&store, &sim, ShardId::new(0, 0, 0)).await, None);
        assert!(runner.queue().is_empty());

        // Re-acquiring requeues every shard seen while away.
        ownership.acquire_all();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            illumination(&store, &sim, ShardId::new(0, 0, 0)).await,
            Some(Component::Illumination { level: 12, sources: 1 })
        );
        runner.stop().await;
        scope.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reacquired_shard_is_recomputed_after_handover() {
        let store = WorldStore::in_memory(config());
        let ownership = Arc::new(FixedOwnership::all());
        let sim = Arc::new(LightingSimulation::new());
        let scope = TaskScope::new("test");
        let runner = SimulationRunner::new(
            store.clone(),
            Arc::clone(&sim),
            ownership.clone(),
            store.config().clone(),
        );
        runner.start(&scope.token()).unwrap();

        store
            .apply(vec![ChangeToApply::new().create(lamp(store.allocate_id(), 1.0, 12))])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let origin = ShardId::new(0, 0, 0);
        assert_eq!(
            illumination(&store, &sim, origin).await,
            Some(Component::Illumination { level: 12, sources: 1 })
        );

        // Another owner leaves the shard half-written while we hold nothing.
        ownership.release_all();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let cell = sim.shard_entity(&origin);
        store
            .apply(vec![ChangeToApply::new().update(
                EntityPatch::new(cell).set(Component::Illumination { level: 0, sources: 0 }),
            )])
            .await
            .unwrap();

        // No light changed since the release; the shard comes back anyway.
        ownership.acquire_all();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            illumination(&store, &sim, origin).await,
            Some(Component::Illumination { level: 12, sources: 1 })
        );
        runner.stop().await;
        scope.shutdown().await;
    }

    struct Pulse {
        runs: AtomicUsize,
    }

    impl Simulation for Pulse {
        fn name(&self) -> &str {
            "pulse"
        }

        fn invalidate(&self, change: &Change) -> Vec<ShardId> {
            if change.id() == EntityId::new(1) {
                vec![ShardId::new(0, 0, 0)]
            } else {
                Vec::new()
            }
        }

        fn shard_entity(&self, _shard: &ShardId) -> EntityId {
            EntityId::derived(9, 0)
        }

        fn update(&self, _shard: &ShardId, _version: Tick, _state: Option<&Entity>) -> Option<crate::UpdateResult> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Some(crate::UpdateResult {
                transactions: Vec::new(),
                requeue: Some(Requeue::After(Duration::from_millis(100))),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_after_reschedules_shard() {
        let store = WorldStore::in_memory(config());
        let sim = Arc::new(Pulse {
            runs: AtomicUsize::new(0),
        });
        let scope = TaskScope::new("test");
        let runner = SimulationRunner::new(
            store.clone(),
            Arc::clone(&sim),
            Arc::new(FixedOwnership::all()),
            store.config().clone(),
        );
        runner.start(&scope.token()).unwrap();
        store
            .apply(vec![ChangeToApply::new().create(Entity::new(EntityId::new(1)))])
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1050)).await;
        let runs = sim.runs.load(Ordering::SeqCst);
        assert!((9..=11).contains(&runs), "ran {runs} times");

        runner.stop().await;
        scope.shutdown().await;
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = SimulationConfig {
            retry_base_ms: 10,
            retry_max_ms: 100,
            ..SimulationConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        let first = backoff(&config, 1, &mut rng);
        assert!(first >= Duration::from_millis(10) && first <= Duration::from_millis(15));
        let later = backoff(&config, 30, &mut rng);
        assert!(later >= Duration::from_millis(100) && later <= Duration::from_millis(150));
    }
}
