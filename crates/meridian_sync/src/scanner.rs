//! # Subscription Scanner
//!
//! Decides which entities a client should currently hold: everything within
//! `radius` of the subject, every always-resident entity, and the subject
//! itself.

use std::collections::HashSet;

use meridian_core::{EntityId, Position};

/// Spatial queries over some entity index.
pub trait SpatialIndex {
    /// Current position of `id`, if it has one.
    fn position(&self, id: EntityId) -> Option<Position>;

    /// Ids within `radius` of `center` (inclusive).
    fn within(&self, center: &Position, radius: f64) -> Vec<EntityId>;
}

/// Residency change produced by a scan. Both lists are sorted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanDelta {
    /// Ids that became resident.
    pub entered: Vec<EntityId>,
    /// Ids that stopped being resident.
    pub left: Vec<EntityId>,
}

impl ScanDelta {
    /// Whether nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entered.is_empty() && self.left.is_empty()
    }
}

/// Area-of-interest tracker for one client.
#[derive(Debug)]
pub struct SubscriptionScanner {
    subject: EntityId,
    radius: f64,
    spatial: HashSet<EntityId>,
    always: HashSet<EntityId>,
    resident: HashSet<EntityId>,
}

impl SubscriptionScanner {
    /// Creates a scanner holding only the subject.
    #[must_use]
    pub fn new(subject: EntityId, radius: f64) -> Self {
        Self {
            subject,
            radius,
            spatial: HashSet::new(),
            always: HashSet::new(),
            resident: HashSet::from([subject]),
        }
    }

    /// The entity the client is attached to.
    #[must_use]
    pub fn subject(&self) -> EntityId {
        self.subject
    }

    /// Current radius.
    #[must_use]
    pub fn radius(&self) -> f64 {
        self.radius
    }

    /// Whether `id` is currently resident.
    #[must_use]
    pub fn is_resident(&self, id: EntityId) -> bool {
        self.resident.contains(&id)
    }

    /// Current resident set.
    #[must_use]
    pub fn resident(&self) -> &HashSet<EntityId> {
        &self.resident
    }

    /// Recomputes the spatial set around the subject.
    ///
    /// A subject without a position sees nothing spatially.
    pub fn rescan(&mut self, index: &impl SpatialIndex) -> ScanDelta {
        self.spatial = index
            .position(self.subject)
            .map(|center| index.within(&center, self.radius).into_iter().collect())
            .unwrap_or_default();
        self.recompute()
    }

    /// Replaces the always-resident set.
    pub fn refresh_always_resident(&mut self, always: HashSet<EntityId>) -> ScanDelta {
        self.always = always;
        self.recompute()
    }

    /// Changes the radius and rescans.
    pub fn set_radius(&mut self, radius: f64, index: &impl SpatialIndex) -> ScanDelta {
        self.radius = radius;
        self.rescan(index)
    }

    fn recompute(&mut self) -> ScanDelta {
        let mut next: HashSet<EntityId> = self.spatial.union(&self.always).copied().collect();
        next.insert(self.subject);

        let mut entered: Vec<EntityId> = next.difference(&self.resident).copied().collect();
        let mut left: Vec<EntityId> = self.resident.difference(&next).copied().collect();
        entered.sort_unstable();
        left.sort_unstable();

        self.resident = next;
        ScanDelta { entered, left }
    }
}
