//! # Sync Sessions
//!
//! One session per connected client:
//!
//! ```text
//! open ──▶ wait for index ──▶ bootstrap (bootstrap_complete = true)
//!                                 │
//!                                 ▼
//!          ┌──────────── live deltas ◀── index batches
//!          │  heartbeat when idle
//!          │  always-resident refresh
//!          └─ radius changes
//! ```
//!
//! A session that falls behind the index broadcast re-bootstraps against the
//! client's version map; the client sees deletes and creates, never a gap.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use meridian_core::{Change, ConfigHandle, EntityId, Shutdown, TaskScope, Tick};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::filters::named_filter;
use crate::index::SyncIndex;
use crate::observer::Observer;
use crate::residency::ResidencySource;

/// Deltas buffered per client.
const DELTA_CHANNEL_CAPACITY: usize = 256;

/// What a client asks for when it connects.
#[derive(Clone, Debug, Default)]
pub struct SubscribeRequest {
    /// Entity the client is attached to.
    pub target: EntityId,
    /// Area-of-interest radius. Defaults to the configured radius.
    pub radius: Option<f64>,
    /// Named filter, see [`crate::FILTER_NAMES`]. Defaults to everything.
    pub filter: Option<String>,
    /// Entities the client already holds, by version.
    pub known_versions: Option<HashMap<EntityId, Tick>>,
}

impl SubscribeRequest {
    /// Everything around `target`, from scratch.
    #[must_use]
    pub fn new(target: EntityId) -> Self {
        Self {
            target,
            ..Self::default()
        }
    }
}

/// One message to the client.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncDelta {
    /// Changes to apply, in order.
    pub changes: Vec<Change>,
    /// Set on the first delta only.
    pub bootstrap_complete: bool,
    /// Server wall-clock time, unix millis. Set on idle heartbeats.
    pub heartbeat: Option<u64>,
}

impl SyncDelta {
    /// Whether this is a bare heartbeat.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.heartbeat.is_some() && self.changes.is_empty()
    }
}

/// A live client session. Dropping it stops the session.
#[derive(Debug)]
pub struct SyncSession {
    deltas: mpsc::Receiver<SyncDelta>,
    radius: watch::Sender<f64>,
    max_radius: f64,
    scope: TaskScope,
}

impl SyncSession {
    /// Validates `request` and starts serving it.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`SyncError::UnknownFilter`] for an unrecognized filter name
    /// - [`SyncError::InvalidRadius`] for a radius outside `0..=sync.max_radius`
    pub fn open<R: ResidencySource>(
        index: SyncIndex,
        residency: Arc<R>,
        config: &ConfigHandle,
        request: SubscribeRequest,
        parent: &Shutdown,
    ) -> SyncResult<Self> {
        let filter = named_filter(request.filter.as_deref())?;
        let snapshot = config.snapshot();
        let radius = request.radius.unwrap_or(snapshot.sync.radius);
        let max_radius = snapshot.sync.max_radius;
        validate_radius(radius, max_radius)?;

        let observer = Observer::new(
            request.target,
            radius,
            filter,
            request.known_versions.unwrap_or_default(),
        );
        let (tx, deltas) = mpsc::channel(DELTA_CHANNEL_CAPACITY);
        let (radius_tx, radius_rx) = watch::channel(radius);

        let scope = TaskScope::child_of(format!("sync-session-{}", request.target), parent);
        let cadence = Cadence {
            heartbeat: Duration::from_millis(snapshot.sync.heartbeat_ms.max(1)),
            residency: Duration::from_millis(snapshot.sync.residency_refresh_ms.max(1)),
        };
        let shutdown = scope.token();
        scope.spawn("sync-session", async move {
            serve(index, residency, observer, cadence, tx, radius_rx, shutdown).await;
        });

        info!(subject = %request.target, radius, "sync session opened");
        Ok(Self {
            deltas,
            radius: radius_tx,
            max_radius,
            scope,
        })
    }

    /// Next delta, or `None` once the session ended.
    pub async fn recv(&mut self) -> Option<SyncDelta> {
        self.deltas.recv().await
    }

    /// Changes the area-of-interest radius.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidRadius`] for a radius outside `0..=sync.max_radius`
    /// as configured when the session opened.
    pub fn set_radius(&self, radius: f64) -> SyncResult<()> {
        validate_radius(radius, self.max_radius)?;
        self.radius.send_replace(radius);
        Ok(())
    }

    /// Stops the session and waits for it.
    pub async fn close(self) {
        self.scope.shutdown().await;
    }
}

fn validate_radius(radius: f64, max_radius: f64) -> SyncResult<()> {
    if (0.0..=max_radius).contains(&radius) {
        Ok(())
    } else {
        Err(SyncError::InvalidRadius(radius))
    }
}

#[derive(Clone, Copy, Debug)]
struct Cadence {
    heartbeat: Duration,
    residency: Duration,
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

async fn always_resident<R: ResidencySource>(
    residency: &R,
    subject: EntityId,
) -> HashSet<EntityId> {
    match residency.always_resident(subject).await {
        Ok(always) => always,
        Err(e) => {
            warn!(%subject, error = %e, "always-resident lookup failed");
            HashSet::new()
        }
    }
}

async fn serve<R: ResidencySource>(
    index: SyncIndex,
    residency: Arc<R>,
    mut observer: Observer,
    cadence: Cadence,
    tx: mpsc::Sender<SyncDelta>,
    mut radius: watch::Receiver<f64>,
    shutdown: Shutdown,
) {
    tokio::select! {
        () = shutdown.cancelled() => return,
        ready = index.ready() => {
            if ready.is_err() {
                return;
            }
        }
    }

    let subject = observer.scanner().subject();
    let always = always_resident(&*residency, subject).await;
    let (changes, mut batches) = index.attach(|state| {
        let mut changes = observer.bootstrap(state);
        changes.extend(observer.refresh_always(always, state));
        changes
    });
    debug!(%subject, changes = changes.len(), "sync bootstrap");
    let bootstrap = SyncDelta {
        changes,
        bootstrap_complete: true,
        heartbeat: None,
    };
    if tx.send(bootstrap).await.is_err() {
        return;
    }

    let mut heartbeat = tokio::time::interval(cadence.heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.reset();
    let mut refresh = tokio::time::interval(cadence.residency);
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
    refresh.reset();
    let mut idle = true;

    loop {
        let changes = tokio::select! {
            () = shutdown.cancelled() => break,
            received = batches.recv() => match received {
                Ok(batch) => {
                    let state = index.read();
                    observer.observe(&batch, &state)
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%subject, skipped, "sync session lagged; resynchronizing");
                    let state = index.read();
                    observer.bootstrap(&state)
                }
                Err(RecvError::Closed) => break,
            },
            _ = heartbeat.tick() => {
                if idle {
                    let beat = SyncDelta {
                        heartbeat: Some(unix_millis()),
                        ..SyncDelta::default()
                    };
                    if tx.send(beat).await.is_err() {
                        break;
                    }
                }
                idle = true;
                continue;
            }
            _ = refresh.tick() => {
                let always = always_resident(&*residency, subject).await;
                let state = index.read();
                observer.refresh_always(always, &state)
            }
            changed = radius.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = *radius.borrow_and_update();
                let state = index.read();
                observer.set_radius(next, &state)
            }
        };

        if changes.is_empty() {
            continue;
        }
        idle = false;
        let delta = SyncDelta {
            changes,
            ..SyncDelta::default()
        };
        if tx.send(delta).await.is_err() {
            break;
        }
    }

    debug!(%subject, "sync session ended");
}
