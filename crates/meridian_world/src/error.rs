//! # World Error Types
//!
//! Failures of the store itself. An aborted transaction is not an error:
//! it is reported as [`ApplyStatus::Aborted`](meridian_core::ApplyStatus).

use meridian_core::CoreError;
use thiserror::Error;

/// Errors that can occur in the world store.
#[derive(Error, Debug)]
pub enum WorldError {
    /// A proposed change failed schema validation. Nothing was applied.
    #[error("rejected change: {0}")]
    InvalidChange(#[from] CoreError),

    /// The write-ahead log could not be read or written.
    #[error("write-ahead log failure: {0}")]
    Wal(String),

    /// The write-ahead log is not one this build understands.
    #[error("corrupt write-ahead log: {0}")]
    CorruptWal(String),

    /// The backing store cannot serve requests.
    #[error("world store unavailable: {0}")]
    Unavailable(String),
}

impl From<std::io::Error> for WorldError {
    fn from(e: std::io::Error) -> Self {
        Self::Wal(e.to_string())
    }
}

/// Result type for world operations.
pub type WorldResult<T> = Result<T, WorldError>;
