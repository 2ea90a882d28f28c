//! # Sync Error Types

use meridian_world::WorldError;
use thiserror::Error;

/// Errors that can occur while serving a client.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The request named a filter that does not exist.
    #[error("unknown filter: {0}")]
    UnknownFilter(String),

    /// The requested radius is negative, not finite, or above the cap.
    #[error("invalid radius: {0}")]
    InvalidRadius(f64),

    /// The world store failed a read.
    #[error("world store error: {0}")]
    World(#[from] WorldError),

    /// The sync index was stopped.
    #[error("sync index stopped")]
    IndexStopped,
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
