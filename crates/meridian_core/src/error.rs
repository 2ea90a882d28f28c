//! # Core Error Types
//!
//! Errors raised by the entity model, configuration loading and validation.

use thiserror::Error;

use crate::ecs::ComponentKind;

/// Errors that can occur in the core crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A component value failed schema validation.
    #[error("invalid {kind:?} component: {reason}")]
    InvalidComponent {
        /// Kind of the offending component.
        kind: ComponentKind,
        /// Human readable reason.
        reason: String,
    },

    /// A patch carried a value under the wrong component key.
    #[error("patch key {key:?} does not match value kind {value:?}")]
    MismatchedPatch {
        /// Key the value was stored under.
        key: ComponentKind,
        /// Actual kind of the value.
        value: ComponentKind,
    },

    /// Configuration could not be read or parsed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
