//! # Changes and Transactions
//!
//! The vocabulary shared by every layer:
//!
//! ```text
//! ChangeToApply ──apply──▶ [ProposedChange] ──stamp tick──▶ [Change] ──▶ log
//!   iffs / catchups / events
//! ```
//!
//! A [`ProposedChange`] is what a writer asks for. A [`Change`] is what the
//! store committed, stamped with the tick of the transaction that produced it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::component::{Component, ComponentKind};
use super::entity::{Entity, EntityId};
use crate::error::{CoreError, CoreResult};

/// The store's logical clock. One tick per committed transaction.
pub type Tick = u64;

/// Partial entity: components to set (`Some`) or remove (`None`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityPatch {
    /// Target entity.
    pub id: EntityId,
    values: BTreeMap<ComponentKind, Option<Component>>,
}

impl EntityPatch {
    /// Creates an empty patch for `id`.
    #[must_use]
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            values: BTreeMap::new(),
        }
    }

    /// Sets a component.
    #[must_use]
    pub fn set(mut self, component: Component) -> Self {
        self.values.insert(component.kind(), Some(component));
        self
    }

    /// Removes a component.
    #[must_use]
    pub fn remove(mut self, kind: ComponentKind) -> Self {
        self.values.insert(kind, None);
        self
    }

    /// Iterates over `(kind, new value)` pairs.
    pub fn entries(&self) -> impl Iterator<Item = (ComponentKind, Option<&Component>)> {
        self.values.iter().map(|(kind, value)| (*kind, value.as_ref()))
    }

    /// Kinds this patch sets or removes.
    pub fn touched(&self) -> impl Iterator<Item = ComponentKind> + '_ {
        self.values.keys().copied()
    }

    /// Whether this patch sets or removes `kind`.
    #[inline]
    #[must_use]
    pub fn touches(&self, kind: ComponentKind) -> bool {
        self.values.contains_key(&kind)
    }

    /// The value this patch sets for `kind`, if any.
    #[must_use]
    pub fn value(&self, kind: ComponentKind) -> Option<&Component> {
        self.values.get(&kind).and_then(Option::as_ref)
    }

    /// Whether the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn validate(&self) -> CoreResult<()> {
        for (key, value) in &self.values {
            if let Some(component) = value {
                if component.kind() != *key {
                    return Err(CoreError::MismatchedPatch {
                        key: *key,
                        value: component.kind(),
                    });
                }
                component.validate()?;
            }
        }
        Ok(())
    }
}

/// A mutation requested by a writer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ProposedChange {
    /// Create (or overwrite) an entity.
    Create(Entity),
    /// Partially update an entity. Creates it if absent.
    Update(EntityPatch),
    /// Delete an entity. No-op if absent.
    Delete(EntityId),
}

impl ProposedChange {
    /// Entity this change targets.
    #[must_use]
    pub fn id(&self) -> EntityId {
        match self {
            Self::Create(entity) => entity.id,
            Self::Update(patch) => patch.id,
            Self::Delete(id) => *id,
        }
    }

    /// Schema validation of every carried component.
    ///
    /// # Errors
    ///
    /// Returns the first invalid component or mismatched patch key.
    pub fn validate(&self) -> CoreResult<()> {
        match self {
            Self::Create(entity) => entity.components().try_for_each(Component::validate),
            Self::Update(patch) => patch.validate(),
            Self::Delete(_) => Ok(()),
        }
    }
}

/// A committed mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum Change {
    /// Entity came into existence (or into view).
    Create {
        /// Commit tick.
        tick: Tick,
        /// Full entity state.
        entity: Entity,
    },
    /// Entity was partially updated.
    Update {
        /// Commit tick.
        tick: Tick,
        /// What changed.
        patch: EntityPatch,
    },
    /// Entity was deleted (or left view).
    Delete {
        /// Commit tick.
        tick: Tick,
        /// Deleted entity.
        id: EntityId,
    },
}

impl Change {
    /// Commit tick of this change.
    #[inline]
    #[must_use]
    pub const fn tick(&self) -> Tick {
        match self {
            Self::Create { tick, .. } | Self::Update { tick, .. } | Self::Delete { tick, .. } => {
                *tick
            }
        }
    }

    /// Entity this change targets.
    #[inline]
    #[must_use]
    pub fn id(&self) -> EntityId {
        match self {
            Self::Create { entity, .. } => entity.id,
            Self::Update { patch, .. } => patch.id,
            Self::Delete { id, .. } => *id,
        }
    }
}

/// Optimistic-concurrency precondition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iff {
    /// Entity to check.
    pub id: EntityId,
    /// Version the entity (or component) must currently have. `0` means absent.
    pub version: Tick,
    /// Restrict the check to one component's last-write tick.
    pub component: Option<ComponentKind>,
}

/// Request for changes to `id` committed after `since`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Catchup {
    /// Entity of interest.
    pub id: EntityId,
    /// Exclusive lower bound.
    pub since: Tick,
}

/// Gameplay-level event published alongside a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomainEvent {
    /// Event topic, e.g. `"light_toggled"`.
    pub topic: String,
    /// Entity the event is about.
    pub subject: EntityId,
}

/// Outcome of one transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyStatus {
    /// Every iff held; all changes were applied.
    Success,
    /// An iff failed; nothing was applied.
    Aborted,
    /// The commit could not be made durable; nothing was applied.
    Failed,
}

/// A transaction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChangeToApply {
    /// Preconditions; all must hold.
    pub iffs: Vec<Iff>,
    /// Eager catch-up requests honored on success.
    pub catchups: Vec<Catchup>,
    /// Mutations, applied in order.
    pub changes: Vec<ProposedChange>,
    /// Events published on success.
    pub events: Vec<DomainEvent>,
}

impl ChangeToApply {
    /// Creates an empty transaction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires `id` to be at `version`.
    #[must_use]
    pub fn iff(mut self, id: EntityId, version: Tick) -> Self {
        self.iffs.push(Iff {
            id,
            version,
            component: None,
        });
        self
    }

    /// Requires component `kind` of `id` to have been last written at `version`.
    #[must_use]
    pub fn iff_component(mut self, id: EntityId, kind: ComponentKind, version: Tick) -> Self {
        self.iffs.push(Iff {
            id,
            version,
            component: Some(kind),
        });
        self
    }

    /// Asks for changes to `id` after `since`.
    #[must_use]
    pub fn catchup(mut self, id: EntityId, since: Tick) -> Self {
        self.catchups.push(Catchup { id, since });
        self
    }

    /// Adds a create.
    #[must_use]
    pub fn create(mut self, entity: Entity) -> Self {
        self.changes.push(ProposedChange::Create(entity));
        self
    }

    /// Adds an update.
    #[must_use]
    pub fn update(mut self, patch: EntityPatch) -> Self {
        self.changes.push(ProposedChange::Update(patch));
        self
    }

    /// Adds a delete.
    #[must_use]
    pub fn delete(mut self, id: EntityId) -> Self {
        self.changes.push(ProposedChange::Delete(id));
        self
    }

    /// Adds a domain event.
    #[must_use]
    pub fn event(mut self, topic: impl Into<String>, subject: EntityId) -> Self {
        self.events.push(DomainEvent {
            topic: topic.into(),
            subject,
        });
        self
    }

    /// Validates every proposed change.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure.
    pub fn validate(&self) -> CoreResult<()> {
        self.changes.iter().try_for_each(ProposedChange::validate)
    }
}
