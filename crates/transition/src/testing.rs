//! Shared fixtures for the in-crate tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use worldswap_common::{BlockId, BlockPos, Region};
use worldswap_persist::{MemorySnapshotStore, Snapshot};

use crate::domain::{AppliedHandle, MutationAuthority, MutationDomain};
use crate::error::MutationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    /// Handle issued and the marker block id of the applied snapshot.
    Apply(AppliedHandle, u32),
    Undo(AppliedHandle),
}

/// Window into a [`RecordingAuthority`] after it moved into a domain.
#[derive(Clone, Default)]
pub struct Recorder {
    pub calls: Arc<Mutex<Vec<Call>>>,
    pub fail_apply: Arc<AtomicBool>,
    inside: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Recorder {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn applies(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Apply(..)))
            .count()
    }

    pub fn undos(&self) -> Vec<AppliedHandle> {
        self.calls()
            .iter()
            .filter_map(|c| match c {
                Call::Undo(h) => Some(*h),
                Call::Apply(..) => None,
            })
            .collect()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }

    /// Most calls ever inside the authority at the same time.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Mark a call as running for a moment so overlaps have a chance to show.
    fn dwell(&self) {
        let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_micros(200));
        self.inside.fetch_sub(1, Ordering::SeqCst);
    }
}

struct RecordingAuthority {
    rec: Recorder,
    next: u64,
}

impl MutationAuthority for RecordingAuthority {
    fn apply(&mut self, snapshot: &Snapshot, _origin: BlockPos) -> Result<AppliedHandle, MutationError> {
        self.rec.dwell();
        if self.rec.fail_apply.load(Ordering::SeqCst) {
            return Err(MutationError::Host("paste rejected".into()));
        }
        self.next += 1;
        let handle = AppliedHandle(self.next);
        let marker = snapshot.block_at(BlockPos::ORIGIN).map_or(0, |b| b.0);
        self.rec.calls.lock().unwrap().push(Call::Apply(handle, marker));
        Ok(handle)
    }

    fn undo(&mut self, handle: AppliedHandle) -> Result<(), MutationError> {
        self.rec.dwell();
        self.rec.calls.lock().unwrap().push(Call::Undo(handle));
        Ok(())
    }
}

pub fn recording_domain() -> (MutationDomain, Recorder) {
    let rec = Recorder::default();
    let domain = MutationDomain::new(RecordingAuthority {
        rec: rec.clone(),
        next: 0,
    });
    (domain, rec)
}

/// A 2x2x2 snapshot whose origin block is `BlockId(marker)`.
pub fn marked_snapshot(marker: u32) -> Snapshot {
    let mut blocks = BTreeMap::new();
    blocks.insert(BlockPos::ORIGIN, BlockId(marker));
    Snapshot::new(Region::new(BlockPos::ORIGIN, BlockPos::new(1, 1, 1)), blocks)
}

/// Store with one marked snapshot per name; markers count from 1.
pub fn store(names: &[&str]) -> MemorySnapshotStore {
    let mut store = MemorySnapshotStore::new();
    for (i, name) in names.iter().enumerate() {
        store.insert(*name, marked_snapshot(i as u32 + 1));
    }
    store
}
