//! # Component System
//!
//! Components are a closed sum type. Every kind the build knows about is a
//! variant of [`Component`]; [`ComponentKind`] is the matching tag used as the
//! key of an entity's component bag, in filters and in component-scoped iffs.
//!
//! Values are validated once, when a transaction reaches the store
//! ([`Component::validate`]). Everything past that boundary can assume
//! well-formed data.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::entity::EntityId;
use crate::error::{CoreError, CoreResult};

/// Longest accepted label, in bytes.
pub const MAX_LABEL_LEN: usize = 64;

/// Brightest accepted light source.
pub const MAX_LIGHT_INTENSITY: u8 = 15;

/// Position component for entities.
///
/// Represents a 3D position in world space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// X coordinate in world space.
    pub x: f64,
    /// Y coordinate in world space.
    pub y: f64,
    /// Z coordinate in world space.
    pub z: f64,
}

impl Position {
    /// Creates a new position.
    #[inline]
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Squared euclidean distance to another position.
    #[inline]
    #[must_use]
    pub fn distance_squared(&self, other: &Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }

    /// Whether all coordinates are finite.
    #[inline]
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Tag identifying a component kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ComponentKind {
    /// [`Component::Position`]
    Position,
    /// [`Component::Label`]
    Label,
    /// [`Component::RemoteConnection`]
    RemoteConnection,
    /// [`Component::LightSource`]
    LightSource,
    /// [`Component::Health`]
    Health,
    /// [`Component::Following`]
    Following,
    /// [`Component::Illumination`]
    Illumination,
}

impl ComponentKind {
    /// Every kind, in key order.
    pub const ALL: [Self; 7] = [
        Self::Position,
        Self::Label,
        Self::RemoteConnection,
        Self::LightSource,
        Self::Health,
        Self::Following,
        Self::Illumination,
    ];
}

/// A component value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Component {
    /// Location in world space.
    Position(Position),
    /// Display name.
    Label(String),
    /// Marker: the entity is driven by a connected client.
    RemoteConnection,
    /// Emits light into the surrounding shards.
    LightSource {
        /// Brightness, `0..=MAX_LIGHT_INTENSITY`.
        intensity: u8,
    },
    /// Hit points.
    Health {
        /// Current hit points.
        hp: u32,
        /// Upper bound for `hp`.
        max: u32,
    },
    /// Entities this one follows. Followed entities stay resident for its
    /// subscriptions regardless of distance.
    Following(BTreeSet<EntityId>),
    /// Per-shard lighting state written by the lighting simulation.
    Illumination {
        /// Accumulated light level.
        level: u32,
        /// Number of light sources contributing.
        sources: u32,
    },
}

impl Component {
    /// Returns the kind tag of this value.
    #[must_use]
    pub const fn kind(&self) -> ComponentKind {
        match self {
            Self::Position(_) => ComponentKind::Position,
            Self::Label(_) => ComponentKind::Label,
            Self::RemoteConnection => ComponentKind::RemoteConnection,
            Self::LightSource { .. } => ComponentKind::LightSource,
            Self::Health { .. } => ComponentKind::Health,
            Self::Following(_) => ComponentKind::Following,
            Self::Illumination { .. } => ComponentKind::Illumination,
        }
    }

    /// Schema validation, run at the store boundary.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidComponent`] describing the first violation.
    pub fn validate(&self) -> CoreResult<()> {
        let invalid = |reason: &str| {
            Err(CoreError::InvalidComponent {
                kind: self.kind(),
                reason: reason.to_string(),
            })
        };

        match self {
            Self::Position(position) if !position.is_finite() => invalid("non-finite coordinate"),
            Self::Label(label) if label.is_empty() => invalid("empty label"),
            Self::Label(label) if label.len() > MAX_LABEL_LEN => invalid("label too long"),
            Self::LightSource { intensity } if *intensity > MAX_LIGHT_INTENSITY => {
                invalid("intensity out of range")
            }
            Self::Health { hp, max } if hp > max => invalid("hp exceeds max"),
            _ => Ok(()),
        }
    }

    /// Returns the position payload, if this is a position.
    #[inline]
    #[must_use]
    pub const fn as_position(&self) -> Option<&Position> {
        match self {
            Self::Position(position) => Some(position),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(Component::RemoteConnection.kind(), ComponentKind::RemoteConnection);
        assert_eq!(
            Component::Health { hp: 1, max: 2 }.kind(),
            ComponentKind::Health
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(Component::Position(Position::new(f64::NAN, 0.0, 0.0)).validate().is_err());
        assert!(Component::Label(String::new()).validate().is_err());
        assert!(Component::Label("x".repeat(MAX_LABEL_LEN + 1)).validate().is_err());
        assert!(Component::LightSource { intensity: 16 }.validate().is_err());
        assert!(Component::Health { hp: 5, max: 4 }.validate().is_err());

        assert!(Component::Label("ok".into()).validate().is_ok());
        assert!(Component::LightSource { intensity: 15 }.validate().is_ok());
    }

    #[test]
    fn test_distance() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position::new(3.0, 4.0, 0.0);
        assert!((a.distance_squared(&b) - 25.0).abs() < f64::EPSILON);
    }
}
