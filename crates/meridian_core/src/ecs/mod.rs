//! # Entity Model
//!
//! Entities, components, the change vocabulary and the versioned table.
//!
//! ## Design Philosophy
//!
//! - Components are a closed sum type, validated once at the store boundary
//! - Every mutation is a [`ProposedChange`] inside a [`ChangeToApply`]
//! - The table is a materialized view of the committed [`Change`] sequence

mod change;
mod component;
mod entity;
mod table;

pub use change::{
    ApplyStatus, Catchup, Change, ChangeToApply, DomainEvent, EntityPatch, Iff, ProposedChange,
    Tick,
};
pub use component::{
    Component, ComponentKind, Position, MAX_LABEL_LEN, MAX_LIGHT_INTENSITY,
};
pub use entity::{Entity, EntityId};
pub use table::{TableRecord, VersionedTable};
