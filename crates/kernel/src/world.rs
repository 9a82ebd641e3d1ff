use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use worldswap_common::{BlockId, BlockPos, EntityId, EntityKind, Region, Transform};

/// An event record produced by every mutation to the world.
///
/// Each event carries enough information to reconstruct or reverse the mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorldEvent {
    /// Entity was spawned with the given transform.
    Spawned {
        id: EntityId,
        kind: EntityKind,
        transform: Transform,
    },
    /// Entity was despawned. Carries the data it had for undo support.
    Despawned {
        id: EntityId,
        kind: EntityKind,
        transform: Transform,
    },
    /// Entity transform was updated.
    TransformUpdated {
        id: EntityId,
        old: Transform,
        new: Transform,
    },
    /// A block position changed. `None` is empty space.
    BlockChanged {
        pos: BlockPos,
        old: Option<BlockId>,
        new: Option<BlockId>,
    },
    /// Visual suppression toggled on an entity.
    SuppressionChanged { id: EntityId, active: bool },
}

/// What a run of [`WorldEvent`]s did, counted by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    pub blocks: usize,
    pub moved: usize,
    pub spawned: usize,
    pub despawned: usize,
    pub suppression: usize,
}

impl ChangeSummary {
    pub fn from_events(events: &[WorldEvent]) -> Self {
        let mut summary = Self::default();
        for event in events {
            match event {
                WorldEvent::Spawned { .. } => summary.spawned += 1,
                WorldEvent::Despawned { .. } => summary.despawned += 1,
                WorldEvent::TransformUpdated { .. } => summary.moved += 1,
                WorldEvent::BlockChanged { .. } => summary.blocks += 1,
                WorldEvent::SuppressionChanged { .. } => summary.suppression += 1,
            }
        }
        summary
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl std::fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} blocks changed, {} entities moved, {} spawned, {} removed",
            self.blocks, self.moved, self.spawned, self.despawned
        )
    }
}

/// The authoritative live world.
///
/// All mutations go through explicit operations and are logged. BTreeMaps give
/// deterministic iteration order, so hashes agree across platforms.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct World {
    entities: BTreeMap<EntityId, EntityData>,
    blocks: BTreeMap<BlockPos, BlockId>,
    /// Append-only event log of all mutations.
    #[serde(skip)]
    event_log: Vec<WorldEvent>,
}

/// Per-entity data stored in the world.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntityData {
    pub kind: EntityKind,
    pub transform: Transform,
    #[serde(default)]
    pub suppressed: bool,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entities in the world.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Number of non-empty block positions.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Drain and return the event log.
    pub fn drain_events(&mut self) -> Vec<WorldEvent> {
        std::mem::take(&mut self.event_log)
    }

    /// Read-only access to the event log.
    pub fn events(&self) -> &[WorldEvent] {
        &self.event_log
    }

    /// Drain the event log into a summary of what changed since the last call.
    pub fn take_changes(&mut self) -> ChangeSummary {
        ChangeSummary::from_events(&self.drain_events())
    }

    /// Read-only access to all entities.
    pub fn entities(&self) -> &BTreeMap<EntityId, EntityData> {
        &self.entities
    }

    /// Read-only access to all blocks.
    pub fn blocks(&self) -> &BTreeMap<BlockPos, BlockId> {
        &self.blocks
    }

    /// Spawn a new entity. Returns its id.
    pub fn spawn(&mut self, kind: EntityKind, transform: Transform) -> EntityId {
        let id = EntityId::new();
        self.spawn_with_id(id, kind, transform);
        id
    }

    /// Spawn an entity with a specific id.
    pub fn spawn_with_id(&mut self, id: EntityId, kind: EntityKind, transform: Transform) {
        self.entities.insert(
            id,
            EntityData {
                kind,
                transform,
                suppressed: false,
            },
        );
        self.event_log.push(WorldEvent::Spawned {
            id,
            kind,
            transform,
        });
    }

    /// Remove an entity. Returns the data if it existed.
    pub fn despawn(&mut self, id: EntityId) -> Option<EntityData> {
        let data = self.entities.remove(&id);
        if let Some(ref d) = data {
            self.event_log.push(WorldEvent::Despawned {
                id,
                kind: d.kind,
                transform: d.transform,
            });
        }
        data
    }

    pub fn get(&self, id: EntityId) -> Option<&EntityData> {
        self.entities.get(&id)
    }

    /// Update an entity's transform and log the change.
    pub fn set_transform(&mut self, id: EntityId, new: Transform) -> bool {
        if let Some(data) = self.entities.get_mut(&id) {
            let old = data.transform;
            data.transform = new;
            self.event_log
                .push(WorldEvent::TransformUpdated { id, old, new });
            true
        } else {
            false
        }
    }

    /// Toggle visual suppression. Returns false for unknown entities or no-op toggles.
    pub fn set_suppressed(&mut self, id: EntityId, active: bool) -> bool {
        match self.entities.get_mut(&id) {
            Some(data) if data.suppressed != active => {
                data.suppressed = active;
                self.event_log
                    .push(WorldEvent::SuppressionChanged { id, active });
                true
            }
            _ => false,
        }
    }

    pub fn block(&self, pos: BlockPos) -> Option<BlockId> {
        self.blocks.get(&pos).copied()
    }

    /// Set or clear one block. Returns the previous content.
    ///
    /// Writing the value already present is not logged.
    pub fn set_block(&mut self, pos: BlockPos, new: Option<BlockId>) -> Option<BlockId> {
        let old = match new {
            Some(block) => self.blocks.insert(pos, block),
            None => self.blocks.remove(&pos),
        };
        if old != new {
            self.event_log
                .push(WorldEvent::BlockChanged { pos, old, new });
        }
        old
    }

    /// Entities standing inside `region` whose kind passes `filter`.
    pub fn entities_in_region(
        &self,
        region: &Region,
        filter: impl Fn(EntityKind) -> bool,
    ) -> Vec<EntityId> {
        self.entities
            .iter()
            .filter(|(_, d)| filter(d.kind) && region.contains_position(d.transform.position))
            .map(|(id, _)| *id)
            .collect()
    }

    /// All player entities.
    pub fn players(&self) -> Vec<EntityId> {
        self.entities
            .iter()
            .filter(|(_, d)| d.kind == EntityKind::Player)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn player_count(&self) -> usize {
        self.entities
            .values()
            .filter(|d| d.kind == EntityKind::Player)
            .count()
    }

    /// Compute a deterministic hash of the world state for comparison.
    /// Uses canonical (BTreeMap) iteration order.
    pub fn state_hash(&self) -> u64 {
        let mut h: u64 = 0xcbf2_9ce4_8422_2325; // FNV offset basis
        let mix = |h: &mut u64, bytes: &[u8]| {
            for &b in bytes {
                *h ^= b as u64;
                *h = h.wrapping_mul(0x0100_0000_01b3);
            }
        };
        for (id, data) in &self.entities {
            let t = data.transform;
            mix(&mut h, id.0.as_bytes());
            mix(&mut h, &[data.kind as u8, u8::from(data.suppressed)]);
            for v in [t.position.x, t.position.y, t.position.z] {
                mix(&mut h, &v.to_le_bytes());
            }
            for v in [t.rotation.x, t.rotation.y, t.rotation.z, t.rotation.w] {
                mix(&mut h, &v.to_le_bytes());
            }
            for v in [t.scale.x, t.scale.y, t.scale.z] {
                mix(&mut h, &v.to_le_bytes());
            }
        }
        for (pos, block) in &self.blocks {
            mix(&mut h, &pos.x.to_le_bytes());
            mix(&mut h, &pos.y.to_le_bytes());
            mix(&mut h, &pos.z.to_le_bytes());
            mix(&mut h, &block.0.to_le_bytes());
        }
        h
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn player_at(world: &mut World, x: f32, y: f32, z: f32) -> EntityId {
        world.spawn(EntityKind::Player, Transform::at(Vec3::new(x, y, z)))
    }

    #[test]
    fn world_starts_empty() {
        let w = World::new();
        assert_eq!(w.entity_count(), 0);
        assert_eq!(w.block_count(), 0);
    }

    #[test]
    fn spawn_and_despawn() {
        let mut w = World::new();
        let id = w.spawn(EntityKind::Item, Transform::default());
        assert_eq!(w.entity_count(), 1);
        assert!(w.get(id).is_some());

        let data = w.despawn(id);
        assert_eq!(data.unwrap().kind, EntityKind::Item);
        assert_eq!(w.entity_count(), 0);
    }

    #[test]
    fn set_block_returns_previous_and_skips_noop_events() {
        let mut w = World::new();
        let pos = BlockPos::new(1, 2, 3);
        assert_eq!(w.set_block(pos, Some(BlockId(4))), None);
        assert_eq!(w.set_block(pos, Some(BlockId(4))), Some(BlockId(4)));
        assert_eq!(w.set_block(pos, None), Some(BlockId(4)));
        assert_eq!(w.set_block(pos, None), None);
        // only the two real changes are logged
        assert_eq!(w.events().len(), 2);
        assert_eq!(w.block(pos), None);
    }

    #[test]
    fn entities_in_region_filters_by_kind_and_position() {
        let mut w = World::new();
        let region = Region::new(BlockPos::ORIGIN, BlockPos::new(9, 9, 9));
        let inside = player_at(&mut w, 1.5, 1.0, 1.5);
        let _outside = player_at(&mut w, 20.0, 1.0, 1.5);
        let item = w.spawn(EntityKind::Item, Transform::at(Vec3::new(2.0, 0.0, 2.0)));

        let players = w.entities_in_region(&region, |k| k == EntityKind::Player);
        assert_eq!(players, vec![inside]);

        let transient = w.entities_in_region(&region, EntityKind::is_transient);
        assert_eq!(transient, vec![item]);
        assert_eq!(w.player_count(), 2);
    }

    #[test]
    fn suppression_toggles_once() {
        let mut w = World::new();
        let id = player_at(&mut w, 0.0, 0.0, 0.0);
        assert!(w.set_suppressed(id, true));
        assert!(!w.set_suppressed(id, true));
        assert!(w.get(id).unwrap().suppressed);
        assert!(w.set_suppressed(id, false));
        assert!(!w.set_suppressed(EntityId::new(), true));
    }

    #[test]
    fn set_transform_logs_event() {
        let mut w = World::new();
        let id = player_at(&mut w, 0.0, 0.0, 0.0);
        let new_t = Transform::at(Vec3::new(1.0, 2.0, 3.0));
        assert!(w.set_transform(id, new_t));
        assert_eq!(w.get(id).unwrap().transform.position, new_t.position);
        // spawn + transform update
        assert_eq!(w.events().len(), 2);
    }

    #[test]
    fn drain_events_clears_log() {
        let mut w = World::new();
        w.spawn(EntityKind::Mob, Transform::default());
        let events = w.drain_events();
        assert_eq!(events.len(), 1);
        assert!(w.events().is_empty());
    }

    #[test]
    fn take_changes_counts_by_kind_and_drains() {
        let mut world = World::new();
        let id = player_at(&mut world, 0.0, 0.0, 0.0);
        world.set_transform(id, Transform::at(Vec3::new(5.0, 0.0, 0.0)));
        world.set_suppressed(id, true);
        for x in 0..4 {
            world.set_block(BlockPos::new(x, 0, 0), Some(BlockId(x as u32 + 1)));
        }
        world.set_block(BlockPos::new(1, 0, 0), None);
        let gone = world.spawn(EntityKind::Item, Transform::default());
        world.despawn(gone);

        let changes = world.take_changes();
        assert_eq!(
            changes,
            ChangeSummary {
                blocks: 5,
                moved: 1,
                spawned: 2,
                despawned: 1,
                suppression: 1,
            }
        );
        assert!(world.take_changes().is_empty());
    }

    #[test]
    fn state_hash_tracks_blocks() {
        let mut a = World::new();
        let before = a.state_hash();
        a.set_block(BlockPos::ORIGIN, Some(BlockId(1)));
        assert_ne!(before, a.state_hash());
        a.set_block(BlockPos::ORIGIN, None);
        assert_eq!(before, a.state_hash());
    }
}
