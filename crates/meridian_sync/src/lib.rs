//! # MERIDIAN Sync
//!
//! Streams the part of the world a client can see:
//! - [`SyncIndex`]: one world subscription, mirrored and bucketed by shard
//! - [`SubscriptionScanner`]: radius plus always-resident area of interest
//! - [`Observer`]: per-client version map and delta generation
//! - [`SyncSession`]: bootstrap, live deltas, heartbeats
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use meridian_core::{ConfigHandle, EntityId, TaskScope};
//! use meridian_sync::{NoResidency, SubscribeRequest, SyncIndex, SyncSession};
//! use meridian_world::WorldStore;
//!
//! # async fn run() -> meridian_sync::SyncResult<()> {
//! let config = ConfigHandle::default();
//! let world = WorldStore::in_memory(config.clone());
//! let scope = TaskScope::new("sync");
//!
//! let index = SyncIndex::new();
//! index.start(world, config.clone(), &scope.token());
//!
//! let request = SubscribeRequest::new(EntityId::new(7));
//! let mut session = SyncSession::open(index, Arc::new(NoResidency), &config, request, &scope.token())?;
//! while let Some(delta) = session.recv().await {
//!     println!("{} changes", delta.changes.len());
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod error;
pub mod filters;
pub mod index;
pub mod observer;
pub mod residency;
pub mod scanner;
pub mod session;

pub use error::{SyncError, SyncResult};
pub use filters::{named_filter, FILTER_NAMES};
pub use index::{IndexBatch, IndexState, SyncIndex};
pub use observer::Observer;
pub use residency::{NoResidency, ResidencySource, WorldResidency};
pub use scanner::{ScanDelta, SpatialIndex, SubscriptionScanner};
pub use session::{SubscribeRequest, SyncDelta, SyncSession};
