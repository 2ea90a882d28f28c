//! # MERIDIAN Shard
//!
//! Distributed shard ownership:
//! - Rendezvous hashing: each logical shard goes to the live worker with the
//!   highest `hash(nonce, shard)`
//! - Debounced rebalancing on membership or configuration change
//! - `Acquired` / `Released` events for shard-scoped workers
//! - Graceful hand-over on stop
//!
//! ## Example
//!
//! ```rust
//! use std::collections::BTreeSet;
//! use meridian_core::BalanceStrategy;
//! use meridian_shard::balance::assign;
//!
//! let workers: BTreeSet<String> = ["a".to_owned(), "b".to_owned()].into();
//! let mine = assign("lighting", BalanceStrategy::Balanced, 16, &workers, "a").unwrap();
//! let theirs = assign("lighting", BalanceStrategy::Balanced, 16, &workers, "b").unwrap();
//! assert_eq!(mine.len() + theirs.len(), 16);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod balance;
pub mod discovery;
pub mod error;
pub mod manager;

pub use balance::{logical_shard, rendezvous_owner};
pub use discovery::{generate_nonce, Discovery, DiscoveryRegistry, LocalDiscovery};
pub use error::{ShardError, ShardResult};
pub use manager::{FixedOwnership, ShardEvent, ShardManager, ShardOwnership};
