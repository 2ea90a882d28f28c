//! # Node
//!
//! Startup order: world, housekeeping, shard ownership, simulations, sync
//! index. Shutdown runs in reverse so that simulations stop before their
//! shards are handed over and the world is checkpointed last.

use std::sync::Arc;

use meridian_core::{ConfigHandle, TaskScope};
use meridian_shard::{
    generate_nonce, DiscoveryRegistry, LocalDiscovery, ShardManager, ShardOwnership,
};
use meridian_sim::{LightingSimulation, SimulationRunner};
use meridian_sync::{SubscribeRequest, SyncIndex, SyncSession, WorldResidency};
use meridian_world::WorldStore;
use tracing::{info, warn};

use crate::error::NodeResult;

/// Shard domain the lighting simulation runs in.
pub const LIGHTING_DOMAIN: &str = "lighting";

/// One running MERIDIAN node.
pub struct Node {
    config: ConfigHandle,
    world: WorldStore,
    shards: Arc<ShardManager<LocalDiscovery>>,
    lighting: SimulationRunner<WorldStore, LightingSimulation>,
    index: SyncIndex,
    residency: Arc<WorldResidency<WorldStore>>,
    scope: TaskScope,
}

impl Node {
    /// Opens the world and starts every background task.
    ///
    /// Nodes sharing `registry` split the lighting domain's shards between
    /// them.
    ///
    /// # Errors
    ///
    /// Fails if the world cannot be opened, the registry is unreachable, or
    /// a runner fails to start.
    pub async fn start(config: ConfigHandle, registry: &DiscoveryRegistry) -> NodeResult<Self> {
        let world = WorldStore::open(config.clone())?;
        let scope = TaskScope::new("node");
        world.spawn_housekeeping(&scope);

        let nonce = generate_nonce();
        let shards = Arc::new(ShardManager::new(
            LIGHTING_DOMAIN,
            nonce.clone(),
            registry.join(),
            config.clone(),
        ));
        shards.start(&scope.token()).await?;

        let lighting = SimulationRunner::new(
            world.clone(),
            Arc::new(LightingSimulation::new()),
            Arc::clone(&shards) as Arc<dyn ShardOwnership>,
            config.clone(),
        );
        lighting.start(&scope.token())?;

        let index = SyncIndex::new();
        index.start(world.clone(), config.clone(), &scope.token());

        let residency = Arc::new(WorldResidency::new(world.clone()));
        info!(%nonce, tick = world.tick(), "node started");
        Ok(Self {
            config,
            world,
            shards,
            lighting,
            index,
            residency,
            scope,
        })
    }

    /// The authoritative world.
    #[must_use]
    pub fn world(&self) -> &WorldStore {
        &self.world
    }

    /// Lighting shard ownership.
    #[must_use]
    pub fn shards(&self) -> &ShardManager<LocalDiscovery> {
        &self.shards
    }

    /// The lighting runner.
    #[must_use]
    pub fn lighting(&self) -> &SimulationRunner<WorldStore, LightingSimulation> {
        &self.lighting
    }

    /// The shared sync index.
    #[must_use]
    pub fn index(&self) -> &SyncIndex {
        &self.index
    }

    /// Live configuration.
    #[must_use]
    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// Opens a client session.
    ///
    /// # Errors
    ///
    /// See [`SyncSession::open`].
    pub fn connect(&self, request: SubscribeRequest) -> NodeResult<SyncSession> {
        let session = SyncSession::open(
            self.index.clone(),
            Arc::clone(&self.residency),
            &self.config,
            request,
            &self.scope.token(),
        )?;
        Ok(session)
    }

    /// Stops every task, hands shards over and checkpoints the world.
    pub async fn stop(self) {
        self.lighting.stop().await;
        self.shards.stop().await;
        self.index.stop().await;
        self.scope.shutdown().await;
        if let Err(e) = self.world.checkpoint() {
            warn!(error = %e, "final checkpoint failed");
        }
        info!(tick = self.world.tick(), "node stopped");
    }
}
