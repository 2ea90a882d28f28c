//! # Node Error Types

use meridian_core::CoreError;
use meridian_shard::ShardError;
use meridian_sim::SimError;
use meridian_sync::SyncError;
use meridian_world::WorldError;
use thiserror::Error;

/// Errors raised while bringing a node up or serving clients.
#[derive(Error, Debug)]
pub enum NodeError {
    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    Config(#[from] CoreError),

    /// The world store failed.
    #[error("world error: {0}")]
    World(#[from] WorldError),

    /// Shard ownership could not be established.
    #[error("shard error: {0}")]
    Shard(#[from] ShardError),

    /// A simulation runner failed to start.
    #[error("simulation error: {0}")]
    Sim(#[from] SimError),

    /// A client session was rejected.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),
}

/// Result type for node operations.
pub type NodeResult<T> = Result<T, NodeError>;
