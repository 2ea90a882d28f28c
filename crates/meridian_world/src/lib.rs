//! # MERIDIAN World
//!
//! The authoritative entity store:
//! - `apply`: batches of transactions, each guarded by version preconditions
//! - `get_with_version`: point reads with the version a later `apply` can pin
//! - `subscribe`: filtered bootstrap followed by the live change tail
//! - Age-based change-log trimming and an optional write-ahead log
//!
//! ## Example
//!
//! ```rust
//! use meridian_core::{ChangeToApply, ConfigHandle, Entity};
//! use meridian_world::WorldStore;
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let store = WorldStore::in_memory(ConfigHandle::default());
//! let id = store.allocate_id();
//!
//! let result = store.apply(vec![ChangeToApply::new().iff(id, 0).create(Entity::new(id))]).await?;
//! assert!(result.all_succeeded());
//! assert_eq!(store.get_with_version(&[id]).await?[0].0, 1);
//! # Ok::<(), meridian_world::WorldError>(())
//! # }).unwrap();
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod api;
pub mod error;
mod store;
pub mod subscription;
pub mod wal;

pub use api::World;
pub use error::{WorldError, WorldResult};
pub use store::{ApplyResult, CommittedEvent, WorldStore};
pub use subscription::{Resume, Subscription, SubscriptionConfig, WorldUpdate};
pub use wal::{ChangeLogWal, Recovery};
