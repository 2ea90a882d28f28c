//! # Shard Error Types

use meridian_core::BalanceStrategy;
use thiserror::Error;

/// Errors that can occur while managing shard ownership.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShardError {
    /// The configured balancing strategy has no implementation.
    #[error("shard domain {domain}: balancing strategy {strategy:?} is not supported")]
    UnsupportedStrategy {
        /// Shard domain name.
        domain: String,
        /// Requested strategy.
        strategy: BalanceStrategy,
    },

    /// The discovery channel could not be reached.
    #[error("discovery unavailable: {0}")]
    DiscoveryUnavailable(String),

    /// `start` was called on a running manager.
    #[error("shard manager for {0} is already running")]
    AlreadyStarted(String),
}

/// Result type for shard operations.
pub type ShardResult<T> = Result<T, ShardError>;
