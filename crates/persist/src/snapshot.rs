use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use worldswap_common::{BlockId, BlockPos, EnvironmentId, Region};
use worldswap_kernel::World;

use crate::StoreError;

/// Decoded, immutable content of one environment.
///
/// Block positions are relative: `bounds.min` is always the origin, and the
/// paste origin supplied at apply time places the snapshot in the world.
/// Positions inside `bounds` without an entry are empty space, which a paste
/// writes too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub bounds: Region,
    #[serde(with = "block_pairs")]
    pub blocks: BTreeMap<BlockPos, BlockId>,
    /// Content hash for integrity verification (FNV-1a over canonical bytes).
    pub hash: u64,
}

impl Snapshot {
    /// Build a snapshot from relative block content.
    pub fn new(bounds: Region, blocks: BTreeMap<BlockPos, BlockId>) -> Self {
        let hash = content_hash(&bounds, &blocks);
        Self {
            bounds,
            blocks,
            hash,
        }
    }

    /// Copy the blocks of `region` out of a live world, rebased to the origin.
    pub fn capture(world: &World, region: Region) -> Self {
        let base = region.min;
        let rebase = BlockPos::new(-base.x, -base.y, -base.z);
        let blocks = world
            .blocks()
            .range(region.min..=region.max)
            .filter(|(pos, _)| region.contains_block(**pos))
            .map(|(pos, block)| (pos.offset(rebase), *block))
            .collect();
        Self::new(region.translate(rebase), blocks)
    }

    /// Verify the snapshot integrity by recomputing the hash.
    pub fn verify(&self) -> bool {
        self.hash == content_hash(&self.bounds, &self.blocks)
    }

    /// Content at a relative position. `None` is empty space.
    pub fn block_at(&self, rel: BlockPos) -> Option<BlockId> {
        self.blocks.get(&rel).copied()
    }

    /// The world region a paste at `origin` overwrites.
    pub fn absolute_bounds(&self, origin: BlockPos) -> Region {
        self.bounds.translate(origin)
    }
}

/// Anything that can hand out decoded snapshots by environment id.
///
/// Implementations may be slow (disk, decompression) so callers run
/// [`decode`](Self::decode) off the mutation path.
pub trait SnapshotSource: Send + Sync {
    fn contains(&self, id: &EnvironmentId) -> bool;

    /// Known environment ids in insertion order.
    fn ids(&self) -> Vec<EnvironmentId>;

    fn decode(&self, id: &EnvironmentId) -> Result<Snapshot, StoreError>;
}

/// In-memory snapshot store.
///
/// Keeps snapshots in insertion order; the file-backed
/// [`SnapshotLibrary`](crate::SnapshotLibrary) is the on-disk counterpart.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    order: Vec<EnvironmentId>,
    snapshots: HashMap<EnvironmentId, Snapshot>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the snapshot for `id`. Replacing keeps the original position.
    pub fn insert(&mut self, id: impl Into<EnvironmentId>, snapshot: Snapshot) {
        let id = id.into();
        if self.snapshots.insert(id.clone(), snapshot).is_none() {
            self.order.push(id);
        }
    }

    /// Capture a region of `world` and store it under `id`.
    pub fn capture(&mut self, id: impl Into<EnvironmentId>, world: &World, region: Region) {
        self.insert(id, Snapshot::capture(world, region));
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl SnapshotSource for MemorySnapshotStore {
    fn contains(&self, id: &EnvironmentId) -> bool {
        self.snapshots.contains_key(id)
    }

    fn ids(&self) -> Vec<EnvironmentId> {
        self.order.clone()
    }

    fn decode(&self, id: &EnvironmentId) -> Result<Snapshot, StoreError> {
        let snap = self
            .snapshots
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if !snap.verify() {
            return Err(StoreError::IntegrityMismatch {
                expected: format!("{:#x}", snap.hash),
                actual: "snapshot content hash mismatch".into(),
            });
        }
        Ok(snap.clone())
    }
}

/// Blocks travel as a flat list of pairs; struct map keys are not portable
/// across self-describing formats.
mod block_pairs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;
    use worldswap_common::{BlockId, BlockPos};

    pub fn serialize<S: Serializer>(
        blocks: &BTreeMap<BlockPos, BlockId>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let pairs: Vec<(BlockPos, BlockId)> = blocks.iter().map(|(p, b)| (*p, *b)).collect();
        pairs.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<BlockPos, BlockId>, D::Error> {
        let pairs = Vec::<(BlockPos, BlockId)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

/// FNV-1a over bounds and blocks in canonical order.
/// Sufficient for corruption detection; file integrity uses SHA-256.
fn content_hash(bounds: &Region, blocks: &BTreeMap<BlockPos, BlockId>) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    let mut mix = |bytes: &[u8]| {
        for &byte in bytes {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
    };
    for pos in [bounds.min, bounds.max].iter().chain(blocks.keys()) {
        mix(&pos.x.to_le_bytes());
        mix(&pos.y.to_le_bytes());
        mix(&pos.z.to_le_bytes());
    }
    for block in blocks.values() {
        mix(&block.0.to_le_bytes());
    }
    hash
}
