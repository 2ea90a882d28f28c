//! # Entity Management
//!
//! Entities are an immutable 64-bit identifier plus a bag of components.
//! Ids are never reused after deletion.
//!
//! Two id ranges exist:
//! - Allocated ids (high bit clear), handed out by the world store
//! - Derived ids (high bit set), computed from a namespace and a key so that
//!   per-shard state entities can be addressed without a lookup

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::component::{Component, ComponentKind};
use super::change::EntityPatch;

/// Unique identifier for an entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct EntityId(u64);

/// Marks derived ids.
const DERIVED_BIT: u64 = 1 << 63;

impl EntityId {
    /// Creates an entity id from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Derives a stable id from a namespace and a key.
    ///
    /// # Arguments
    ///
    /// * `namespace` - Owner of the id range (one per simulation)
    /// * `key` - Key within the namespace, truncated to 47 bits
    #[inline]
    #[must_use]
    pub const fn derived(namespace: u16, key: u64) -> Self {
        Self(DERIVED_BIT | ((namespace as u64) << 47) | (key & ((1 << 47) - 1)))
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether this id was derived rather than allocated.
    #[inline]
    #[must_use]
    pub const fn is_derived(self) -> bool {
        self.0 & DERIVED_BIT != 0
    }

    /// Null/invalid entity ID.
    pub const NULL: Self = Self(0);

    /// Checks if this entity ID is null/invalid.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An entity and its component bag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// The unique identifier for this entity.
    pub id: EntityId,
    components: BTreeMap<ComponentKind, Component>,
}

impl Entity {
    /// Creates an entity with no components.
    #[must_use]
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            components: BTreeMap::new(),
        }
    }

    /// Builder-style component insertion.
    #[must_use]
    pub fn with(mut self, component: Component) -> Self {
        self.set(component);
        self
    }

    /// Sets a component, replacing any previous value of the same kind.
    pub fn set(&mut self, component: Component) {
        self.components.insert(component.kind(), component);
    }

    /// Removes a component, returning it if present.
    pub fn remove(&mut self, kind: ComponentKind) -> Option<Component> {
        self.components.remove(&kind)
    }

    /// Returns the component of the given kind.
    #[must_use]
    pub fn get(&self, kind: ComponentKind) -> Option<&Component> {
        self.components.get(&kind)
    }

    /// Checks if this entity has a specific component.
    #[inline]
    #[must_use]
    pub fn has(&self, kind: ComponentKind) -> bool {
        self.components.contains_key(&kind)
    }

    /// Iterates over the kinds present on this entity.
    pub fn kinds(&self) -> impl Iterator<Item = ComponentKind> + '_ {
        self.components.keys().copied()
    }

    /// Iterates over the components.
    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.components.values()
    }

    /// Number of components attached.
    #[must_use]
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Whether the entity carries no components.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Applies a partial update in place.
    pub fn apply_patch(&mut self, patch: &EntityPatch) {
        for (kind, value) in patch.entries() {
            match value {
                Some(component) => {
                    self.components.insert(kind, component.clone());
                }
                None => {
                    self.components.remove(&kind);
                }
            }
        }
    }

    /// Builds an entity out of the values a patch sets.
    ///
    /// Used when an update targets an entity that does not exist.
    #[must_use]
    pub fn from_patch(patch: &EntityPatch) -> Self {
        let mut entity = Self::new(patch.id);
        entity.apply_patch(patch);
        entity
    }
}
