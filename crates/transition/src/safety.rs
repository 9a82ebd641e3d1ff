//! Occupant safety around a region that is about to be overwritten.

use glam::Vec3;
use worldswap_common::{EntityId, Region};

/// Moves people out of harm's way and clears debris before a paste.
///
/// `relocate` and `clear_transient_entities` are idempotent: on an empty
/// region they do nothing and return 0.
pub trait SafetyCoordinator: Send + Sync {
    /// Players currently standing inside `region`.
    fn occupants(&self, region: &Region) -> Vec<EntityId>;

    /// Move every occupant of `region` to `fallback`. Returns how many moved.
    fn relocate(&self, region: &Region, fallback: Vec3) -> usize;

    /// Remove dropped items and mobs inside `region`. Returns how many were removed.
    fn clear_transient_entities(&self, region: &Region) -> usize;

    /// Start the short visual suppression effect that hides the swap.
    fn apply_suppression(&self, entities: &[EntityId]);

    fn remove_suppression(&self, entities: &[EntityId]);
}

/// Reports how many players are present, for the rotation occupancy guard.
pub trait OccupancyProbe: Send + Sync {
    fn online(&self) -> usize;
}

/// What securing a region did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SafetyReport {
    /// Occupants found in the region before anything moved.
    pub occupants: Vec<EntityId>,
    pub relocated: usize,
    pub cleared: usize,
}

/// Relocate occupants then strip transient entities, optionally suppressing
/// the occupants' view first so they never see the cleanup.
pub(crate) fn secure_region(
    safety: &dyn SafetyCoordinator,
    region: &Region,
    fallback: Vec3,
    suppress: bool,
) -> SafetyReport {
    let occupants = safety.occupants(region);
    if suppress && !occupants.is_empty() {
        safety.apply_suppression(&occupants);
    }
    let relocated = safety.relocate(region, fallback);
    let cleared = safety.clear_transient_entities(region);
    tracing::debug!(%region, relocated, cleared, "region secured");
    SafetyReport {
        occupants,
        relocated,
        cleared,
    }
}

/// A coordinator for hosts with nobody to protect.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSafety;

impl SafetyCoordinator for NoopSafety {
    fn occupants(&self, _region: &Region) -> Vec<EntityId> {
        Vec::new()
    }

    fn relocate(&self, _region: &Region, _fallback: Vec3) -> usize {
        0
    }

    fn clear_transient_entities(&self, _region: &Region) -> usize {
        0
    }

    fn apply_suppression(&self, _entities: &[EntityId]) {}

    fn remove_suppression(&self, _entities: &[EntityId]) {}
}

impl OccupancyProbe for NoopSafety {
    fn online(&self) -> usize {
        0
    }
}
