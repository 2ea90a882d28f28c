//! # MERIDIAN Core
//!
//! The entity model shared by every MERIDIAN crate:
//! - Closed component sum type and the change/transaction vocabulary
//! - Versioned entity table with optimistic-concurrency preconditions
//! - Filter context maintaining per-subscription inclusion sets
//! - Shard addressing, runtime configuration and task scopes
//!
//! ## Example
//!
//! ```rust
//! use meridian_core::{ChangeToApply, Component, Entity, EntityId, ProposedChange, VersionedTable};
//!
//! let mut table = VersionedTable::new();
//! let id = EntityId::new(1);
//! let tx = ChangeToApply::new().iff(id, 0).create(Entity::new(id).with(Component::RemoteConnection));
//!
//! assert!(table.check_iffs(&tx.iffs));
//! table.apply(1, &tx.changes);
//! assert_eq!(table.version(id), 1);
//! # let _ = ProposedChange::Delete(id);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod ecs;
pub mod error;
pub mod filter;
pub mod scope;
pub mod shard_id;

pub use config::{
    BalanceStrategy, ConfigHandle, MeridianConfig, ShardDomainConfig, ShardsConfig,
    SimulationConfig, SyncConfig, WorldConfig,
};
pub use ecs::{
    ApplyStatus, Catchup, Change, ChangeToApply, Component, ComponentKind, DomainEvent, Entity,
    EntityId, EntityPatch, Iff, Position, ProposedChange, TableRecord, Tick, VersionedTable,
};
pub use error::{CoreError, CoreResult};
pub use filter::{EntityFilter, EntityLookup, FilterContext};
pub use scope::{Shutdown, TaskScope};
pub use shard_id::{ShardId, SHARD_DIM};
