//! # Simulation Error Types

use meridian_world::WorldError;
use thiserror::Error;

/// Errors that can occur while running a simulation.
#[derive(Error, Debug)]
pub enum SimError {
    /// The world store failed a read or a write.
    #[error("world store error: {0}")]
    World(#[from] WorldError),

    /// Some transactions of an update batch lost their version race.
    #[error("{aborted} simulation transaction(s) aborted")]
    Aborted {
        /// Number of aborted transactions.
        aborted: usize,
    },

    /// Some transactions of an update batch could not be persisted.
    #[error("{failed} simulation transaction(s) not persisted")]
    Unpersisted {
        /// Number of failed transactions.
        failed: usize,
    },

    /// `start` was called on a running runner.
    #[error("simulation {0} is already running")]
    AlreadyStarted(String),
}

/// Result type for simulation operations.
pub type SimResult<T> = Result<T, SimError>;
