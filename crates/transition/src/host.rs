//! Adapters that run the core against a kernel [`World`].

use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use worldswap_common::{BlockId, BlockPos, EntityId, EntityKind, EnvironmentId, Region};
use worldswap_kernel::{ChangeSummary, World};
use worldswap_persist::Snapshot;

use crate::config::SwapConfig;
use crate::domain::{AppliedHandle, MutationAuthority};
use crate::error::MutationError;
use crate::observers::{EnvironmentChange, Observer, ObserverError};
use crate::safety::{OccupancyProbe, SafetyCoordinator};

/// Vertical range a paste may touch, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildLimits {
    pub min_y: i32,
    pub max_y: i32,
}

impl Default for BuildLimits {
    fn default() -> Self {
        Self {
            min_y: -64,
            max_y: 319,
        }
    }
}

impl BuildLimits {
    pub fn admits(&self, region: &Region) -> bool {
        region.min.y >= self.min_y && region.max.y <= self.max_y
    }
}

/// A shared live world, plus the capabilities the core needs from it.
#[derive(Debug, Clone, Default)]
pub struct WorldHost {
    world: Arc<Mutex<World>>,
}

impl WorldHost {
    pub fn new(world: World) -> Self {
        Self {
            world: Arc::new(Mutex::new(world)),
        }
    }

    pub fn world(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// What happened to the world since the last call.
    pub fn take_changes(&self) -> ChangeSummary {
        self.world().take_changes()
    }

    /// The mutation authority for this world. Build exactly one and hand it
    /// to a [`MutationDomain`](crate::MutationDomain).
    pub fn authority(&self, limits: BuildLimits) -> WorldAuthority {
        WorldAuthority {
            world: self.world.clone(),
            limits,
            undo: HashMap::new(),
            next: 0,
        }
    }
}

impl SafetyCoordinator for WorldHost {
    fn occupants(&self, region: &Region) -> Vec<EntityId> {
        self.world()
            .entities_in_region(region, |kind| kind == EntityKind::Player)
    }

    fn relocate(&self, region: &Region, fallback: Vec3) -> usize {
        let mut world = self.world();
        let occupants = world.entities_in_region(region, |kind| kind == EntityKind::Player);
        for id in &occupants {
            if let Some(data) = world.get(*id) {
                let mut transform = data.transform;
                transform.position = fallback;
                world.set_transform(*id, transform);
            }
        }
        occupants.len()
    }

    fn clear_transient_entities(&self, region: &Region) -> usize {
        let mut world = self.world();
        let doomed = world.entities_in_region(region, EntityKind::is_transient);
        for id in &doomed {
            world.despawn(*id);
        }
        doomed.len()
    }

    fn apply_suppression(&self, entities: &[EntityId]) {
        let mut world = self.world();
        for id in entities {
            world.set_suppressed(*id, true);
        }
    }

    fn remove_suppression(&self, entities: &[EntityId]) {
        let mut world = self.world();
        for id in entities {
            world.set_suppressed(*id, false);
        }
    }
}

impl OccupancyProbe for WorldHost {
    fn online(&self) -> usize {
        self.world().player_count()
    }
}

/// Writes snapshots into the world and keeps what they overwrote.
pub struct WorldAuthority {
    world: Arc<Mutex<World>>,
    limits: BuildLimits,
    undo: HashMap<AppliedHandle, Vec<(BlockPos, Option<BlockId>)>>,
    next: u64,
}

impl WorldAuthority {
    /// Applications that can still be undone.
    pub fn outstanding(&self) -> usize {
        self.undo.len()
    }
}

impl MutationAuthority for WorldAuthority {
    fn apply(&mut self, snapshot: &Snapshot, origin: BlockPos) -> Result<AppliedHandle, MutationError> {
        let region = snapshot.absolute_bounds(origin);
        if !self.limits.admits(&region) {
            return Err(MutationError::OutOfBounds { region });
        }

        let mut world = self.world.lock().unwrap_or_else(PoisonError::into_inner);
        let mut overwritten = Vec::new();
        for rel in snapshot.bounds.iter() {
            let pos = rel.offset(origin);
            let old = world.set_block(pos, snapshot.block_at(rel));
            overwritten.push((pos, old));
        }

        self.next += 1;
        let handle = AppliedHandle(self.next);
        tracing::debug!(%handle, %region, blocks = overwritten.len(), "snapshot pasted");
        self.undo.insert(handle, overwritten);
        Ok(handle)
    }

    fn undo(&mut self, handle: AppliedHandle) -> Result<(), MutationError> {
        let overwritten = self
            .undo
            .remove(&handle)
            .ok_or(MutationError::UnknownHandle(handle))?;
        let mut world = self.world.lock().unwrap_or_else(PoisonError::into_inner);
        for (pos, old) in overwritten.into_iter().rev() {
            world.set_block(pos, old);
        }
        Ok(())
    }
}

/// Observer that places every player on the new environment's spawn points,
/// round-robin in id order.
#[derive(Debug, Clone)]
pub struct SpawnPlacer {
    host: WorldHost,
    spawns: HashMap<EnvironmentId, Vec<Vec3>>,
}

impl SpawnPlacer {
    pub fn new(host: WorldHost, spawns: HashMap<EnvironmentId, Vec<Vec3>>) -> Self {
        Self { host, spawns }
    }

    pub fn from_config(host: WorldHost, config: &SwapConfig) -> Self {
        let spawns = config
            .environments
            .iter()
            .map(|env| (env.id.clone(), env.spawns.clone()))
            .collect();
        Self::new(host, spawns)
    }
}

impl Observer for SpawnPlacer {
    fn on_environment_changed(&self, change: &EnvironmentChange) -> Result<(), ObserverError> {
        let spawns = self
            .spawns
            .get(&change.current)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("no spawn points for '{}'", change.current))?;
        let mut world = self.host.world();
        for (i, id) in world.players().into_iter().enumerate() {
            if let Some(data) = world.get(id) {
                let mut transform = data.transform;
                transform.position = spawns[i % spawns.len()];
                world.set_transform(id, transform);
            }
        }
        Ok(())
    }
}
