//! # Simulation Queue
//!
//! Deduplicating shard queue with per-shard throttling.
//!
//! ```text
//! push ──────▶ high ─┐
//! push_low ──▶ low ──┼─▶ pop ──▶ (throttled? ──yes──▶ delayed) ──▶ batch
//! defer ─────▶ delayed ──(due)──▶ high
//! ```
//!
//! A shard sits in at most one of the three sets. A shard popped before
//! `simulation.throttle_ms` has passed since its last run goes to the
//! delayed set until its window closes, so it runs at most once per window
//! and is never starved.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use meridian_core::{ConfigHandle, ShardId, Shutdown};
use meridian_shard::ShardOwnership;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Default)]
struct QueueState {
    high: VecDeque<ShardId>,
    low: VecDeque<ShardId>,
    /// Members of `high` or `low`.
    queued: HashSet<ShardId>,
    delayed: HashMap<ShardId, Instant>,
    last_run: HashMap<ShardId, Instant>,
}

impl QueueState {
    fn contains(&self, shard: &ShardId) -> bool {
        self.queued.contains(shard) || self.delayed.contains_key(shard)
    }

    fn promote_due(&mut self, now: Instant) {
        let due: Vec<ShardId> = self
            .delayed
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(shard, _)| *shard)
            .collect();
        for shard in due {
            self.delayed.remove(&shard);
            self.queued.insert(shard);
            self.high.push_back(shard);
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.values().min().copied()
    }

    fn next_candidate(&mut self) -> Option<ShardId> {
        let shard = self.high.pop_front().or_else(|| self.low.pop_front())?;
        self.queued.remove(&shard);
        Some(shard)
    }
}

/// Shards awaiting an update.
pub struct SimulationQueue {
    state: Mutex<QueueState>,
    wake: Notify,
    config: ConfigHandle,
    ownership: Arc<dyn ShardOwnership>,
}

impl std::fmt::Debug for SimulationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationQueue")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl SimulationQueue {
    /// Creates an empty queue admitting only shards `ownership` owns.
    #[must_use]
    pub fn new(config: ConfigHandle, ownership: Arc<dyn ShardOwnership>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            config,
            ownership,
        }
    }

    /// Whether this worker currently owns `shard`.
    #[inline]
    #[must_use]
    pub fn owns(&self, shard: &ShardId) -> bool {
        self.ownership.owns(shard)
    }

    /// Queues `shard` with high priority. Promotes it if queued low.
    pub fn push(&self, shard: ShardId) {
        if !self.owns(&shard) {
            return;
        }
        {
            let mut state = self.state.lock();
            if state.delayed.contains_key(&shard) {
                return;
            }
            if state.queued.contains(&shard) {
                let before = state.low.len();
                state.low.retain(|queued| *queued != shard);
                if state.low.len() != before {
                    state.high.push_back(shard);
                }
                return;
            }
            state.queued.insert(shard);
            state.high.push_back(shard);
        }
        self.wake.notify_one();
    }

    /// Queues `shard` with low priority unless already pending.
    pub fn push_low(&self, shard: ShardId) {
        if !self.owns(&shard) {
            return;
        }
        {
            let mut state = self.state.lock();
            if state.contains(&shard) {
                return;
            }
            state.queued.insert(shard);
            state.low.push_back(shard);
        }
        self.wake.notify_one();
    }

    /// Queues every shard in `shards` with high priority.
    pub fn push_all(&self, shards: impl IntoIterator<Item = ShardId>) {
        for shard in shards {
            self.push(shard);
        }
    }

    /// Schedules `shard` to become due after `delay`.
    ///
    /// An earlier existing deadline wins.
    pub fn defer(&self, shard: ShardId, delay: Duration) {
        if !self.owns(&shard) {
            return;
        }
        let at = Instant::now() + delay;
        {
            let mut state = self.state.lock();
            if state.queued.remove(&shard) {
                state.high.retain(|queued| *queued != shard);
                state.low.retain(|queued| *queued != shard);
            }
            let deadline = state.delayed.entry(shard).or_insert(at);
            *deadline = (*deadline).min(at);
        }
        self.wake.notify_one();
    }

    /// Drops every pending shard no longer owned. Returns how many.
    pub fn retain_owned(&self) -> usize {
        let mut state = self.state.lock();
        let before = state.queued.len() + state.delayed.len();

        let ownership = &self.ownership;
        state.high.retain(|shard| ownership.owns(shard));
        state.low.retain(|shard| ownership.owns(shard));
        state.queued.retain(|shard| ownership.owns(shard));
        state.delayed.retain(|shard, _| ownership.owns(shard));
        state.last_run.retain(|shard, _| ownership.owns(shard));

        before - (state.queued.len() + state.delayed.len())
    }

    /// High-priority and delayed shards.
    #[must_use]
    pub fn pending(&self) -> Vec<ShardId> {
        let state = self.state.lock();
        state
            .high
            .iter()
            .copied()
            .chain(state.delayed.keys().copied())
            .collect()
    }

    /// Number of shards in any set.
    #[must_use]
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.queued.len() + state.delayed.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for a batch of runnable shards.
    ///
    /// Returns at most `simulation.shards_per_batch` shards, high priority
    /// first, each stamped as run now. Returns `None` once `cancel` fires.
    pub async fn pop(&self, cancel: &Shutdown) -> Option<Vec<ShardId>> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            let config = self.config.snapshot();
            let throttle = config.simulation.throttle();
            let limit = config.simulation.shards_per_batch.max(1);

            let next_due = {
                let now = Instant::now();
                let mut state = self.state.lock();
                state.promote_due(now);

                let mut batch = Vec::new();
                while batch.len() < limit {
                    let Some(shard) = state.next_candidate() else {
                        break;
                    };
                    if !self.owns(&shard) {
                        continue;
                    }
                    if let Some(last) = state.last_run.get(&shard).copied() {
                        if now < last + throttle {
                            trace!(%shard, "throttled; deferring");
                            state.delayed.insert(shard, last + throttle);
                            continue;
                        }
                    }
                    state.last_run.insert(shard, now);
                    batch.push(shard);
                }

                if !batch.is_empty() {
                    return Some(batch);
                }
                state.next_due()
            };

            match next_due {
                Some(at) => {
                    tokio::select! {
                        () = cancel.cancelled() => return None,
                        () = self.wake.notified() => {}
                        () = tokio::time::sleep_until(at) => {}
                    }
                }
                None => {
                    tokio::select! {
                        () = cancel.cancelled() => return None,
                        () = self.wake.notified() => {}
                    }
                }
            }
        }
    }
}
