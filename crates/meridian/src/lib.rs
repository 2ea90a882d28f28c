//! # MERIDIAN
//!
//! A distributed, versioned entity world. This crate runs one node.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                              NODE                                │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐   apply    ┌──────────────┐   subscribe        │
//! │  │  Simulation  │──────────> │    World     │ ─────────┐         │
//! │  │   Runner     │ <───────── │    Store     │          │         │
//! │  └──────┬───────┘ invalidate └──────────────┘          ▼         │
//! │         │ owns?                                 ┌──────────────┐ │
//! │  ┌──────┴───────┐                               │  Sync Index  │ │
//! │  │    Shard     │<── discovery                  └──────┬───────┘ │
//! │  │   Manager    │                                      │         │
//! │  └──────────────┘                               ┌──────┴───────┐ │
//! │                                                 │   Sessions   │ │
//! │                                                 └──────────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `error`: node-level error type
//! - `node`: startup and shutdown ordering

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod error;
pub mod node;

// Re-export the units
pub use meridian_core as core;
pub use meridian_shard as shard;
pub use meridian_sim as sim;
pub use meridian_sync as sync;
pub use meridian_world as world;

pub use error::{NodeError, NodeResult};
pub use node::{Node, LIGHTING_DOMAIN};
