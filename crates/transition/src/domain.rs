//! The mutation domain: the one gate every apply and undo passes through.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use worldswap_common::{BlockPos, Region};
use worldswap_persist::Snapshot;

use crate::error::MutationError;

/// Opaque receipt for one applied snapshot, needed to undo it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppliedHandle(pub u64);

impl fmt::Display for AppliedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The host capability allowed to write snapshots into live world state.
///
/// Both calls are synchronous and bounded in the host's own terms. They are
/// only ever invoked through a [`MutationDomain`], which guarantees no two
/// calls overlap.
pub trait MutationAuthority: Send + 'static {
    fn apply(&mut self, snapshot: &Snapshot, origin: BlockPos)
        -> Result<AppliedHandle, MutationError>;

    fn undo(&mut self, handle: AppliedHandle) -> Result<(), MutationError>;
}

/// Shared, cloneable gate around the single [`MutationAuthority`].
///
/// Waiters suspend on the async lock instead of blocking a worker thread; the
/// authority itself runs only for the instant of the call.
///
/// Applications made with [`apply_temporary`](Self::apply_temporary) are
/// expected to be undone later. Any later apply whose region overlaps one of
/// them undoes it first (newest first), so a stale undo can never write old
/// blocks over newer content. The owner's eventual `undo` of such a handle
/// is then a no-op.
#[derive(Clone)]
pub struct MutationDomain {
    gate: Arc<Mutex<Gate>>,
}

struct Gate {
    authority: Box<dyn MutationAuthority>,
    /// Outstanding temporary applications, oldest first.
    temporary: Vec<(AppliedHandle, Region)>,
    /// Temporary applications already undone by an overlapping apply.
    superseded: HashSet<AppliedHandle>,
}

impl Gate {
    /// Undo every temporary application `region` would clobber, plus any
    /// later one stacked on top of those.
    fn retire_overlapping(&mut self, region: &Region) {
        let mut doomed: Vec<bool> = self
            .temporary
            .iter()
            .map(|(_, r)| r.intersects(region))
            .collect();
        for j in 0..self.temporary.len() {
            if !doomed[j] {
                let later = self.temporary[j].1;
                let stacked = (0..j).any(|i| doomed[i] && self.temporary[i].1.intersects(&later));
                doomed[j] = stacked;
            }
        }

        for j in (0..self.temporary.len()).rev() {
            if !doomed[j] {
                continue;
            }
            let (handle, temp_region) = self.temporary.remove(j);
            match self.authority.undo(handle) {
                Ok(()) => tracing::info!(%handle, region = %temp_region, "temporary paste superseded"),
                Err(e) => tracing::error!(%handle, region = %temp_region, "undo of superseded paste failed: {e}"),
            }
            self.superseded.insert(handle);
        }
    }
}

impl MutationDomain {
    pub fn new(authority: impl MutationAuthority) -> Self {
        Self {
            gate: Arc::new(Mutex::new(Gate {
                authority: Box::new(authority),
                temporary: Vec::new(),
                superseded: HashSet::new(),
            })),
        }
    }

    pub async fn apply(
        &self,
        snapshot: &Snapshot,
        origin: BlockPos,
    ) -> Result<AppliedHandle, MutationError> {
        let mut gate = self.gate.lock().await;
        let _span = tracing::debug_span!("mutation_apply", %origin).entered();
        gate.retire_overlapping(&snapshot.absolute_bounds(origin));
        gate.authority.apply(snapshot, origin)
    }

    /// Apply a paste that its caller will undo later.
    pub async fn apply_temporary(
        &self,
        snapshot: &Snapshot,
        origin: BlockPos,
    ) -> Result<AppliedHandle, MutationError> {
        let mut gate = self.gate.lock().await;
        let _span = tracing::debug_span!("mutation_apply_temporary", %origin).entered();
        let region = snapshot.absolute_bounds(origin);
        gate.retire_overlapping(&region);
        let handle = gate.authority.apply(snapshot, origin)?;
        gate.temporary.push((handle, region));
        Ok(handle)
    }

    pub async fn undo(&self, handle: AppliedHandle) -> Result<(), MutationError> {
        let mut gate = self.gate.lock().await;
        let _span = tracing::debug_span!("mutation_undo", %handle).entered();
        if gate.superseded.remove(&handle) {
            tracing::debug!(%handle, "already undone by a later paste");
            return Ok(());
        }
        gate.temporary.retain(|(h, _)| *h != handle);
        gate.authority.undo(handle)
    }

    /// Whether a later overlapping paste already undid this temporary one.
    pub async fn is_superseded(&self, handle: AppliedHandle) -> bool {
        self.gate.lock().await.superseded.contains(&handle)
    }
}

impl fmt::Debug for MutationDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationDomain").finish_non_exhaustive()
    }
}
