//! # MERIDIAN Sim
//!
//! Shard-scoped simulations over the world:
//! - [`Simulation`]: maps committed changes to stale shards and recomputes
//!   one shard entity at a time
//! - [`SimulationQueue`]: deduplicated, throttled, prioritized shard queue
//! - [`SimulationRunner`]: ties the world stream, shard ownership and the
//!   queue together
//! - [`LightingSimulation`]: reference simulation
//!
//! Per shard: `idle → queued → running → (committed | deferred | idle)`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod error;
pub mod lighting;
pub mod queue;
pub mod runner;
pub mod simulation;

pub use error::{SimError, SimResult};
pub use lighting::LightingSimulation;
pub use queue::SimulationQueue;
pub use runner::SimulationRunner;
pub use simulation::{Requeue, Simulation, UpdateResult};
