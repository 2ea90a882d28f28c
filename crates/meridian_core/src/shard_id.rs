//! # Shard Addressing
//!
//! The world is cut into cubic cells of [`SHARD_DIM`] units. A [`ShardId`]
//! names one cell; it is derived from coordinates only, so every process
//! computes the same id for the same place.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ecs::Position;

/// Edge length of a shard cell, in world units.
pub const SHARD_DIM: f64 = 32.0;

/// Bits per axis in [`ShardId::packed`].
const AXIS_BITS: u32 = 21;
const AXIS_MASK: u64 = (1 << AXIS_BITS) - 1;

/// Cell coordinates of one shard.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    /// Cell index along X.
    pub x: i32,
    /// Cell index along Y.
    pub y: i32,
    /// Cell index along Z.
    pub z: i32,
}

impl ShardId {
    /// Creates a shard id from cell coordinates.
    #[inline]
    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// The shard containing `position`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn containing(position: &Position) -> Self {
        Self {
            x: (position.x / SHARD_DIM).floor() as i32,
            y: (position.y / SHARD_DIM).floor() as i32,
            z: (position.z / SHARD_DIM).floor() as i32,
        }
    }

    /// This shard and every shard within `padding` cells on each axis.
    ///
    /// Cells past the edge of the `i32` grid are skipped; a negative
    /// `padding` is treated as zero.
    pub fn neighborhood(self, padding: i32) -> impl Iterator<Item = Self> {
        let padding = padding.max(0);
        (-padding..=padding).flat_map(move |dx| {
            (-padding..=padding).flat_map(move |dy| {
                (-padding..=padding).filter_map(move |dz| {
                    Some(Self::new(
                        self.x.checked_add(dx)?,
                        self.y.checked_add(dy)?,
                        self.z.checked_add(dz)?,
                    ))
                })
            })
        })
    }

    /// Packs the coordinates into 63 bits (21 per axis, wrapping).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn packed(self) -> u64 {
        ((self.x as u64 & AXIS_MASK) << (2 * AXIS_BITS))
            | ((self.y as u64 & AXIS_MASK) << AXIS_BITS)
            | (self.z as u64 & AXIS_MASK)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.x, self.y, self.z)
    }
}
