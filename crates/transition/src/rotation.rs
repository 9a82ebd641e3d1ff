//! Periodic automatic transitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use worldswap_common::{BlockPos, EnvironmentId, SplitMix64};

use crate::countdown::stopped;
use crate::error::{RotationError, TransitionError};
use crate::orchestrator::{CommittedTransition, Orchestrator};
use crate::safety::OccupancyProbe;

/// How the next environment is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationMode {
    #[default]
    Sequential,
    Random,
    /// Delegated to an [`EnvironmentResolver`], e.g. a vote.
    External,
}

/// Picks the next environment in [`RotationMode::External`].
///
/// `None` skips the cycle.
pub trait EnvironmentResolver: Send + Sync {
    fn resolve(
        &self,
        candidates: &[EnvironmentId],
        current: Option<&EnvironmentId>,
    ) -> Option<EnvironmentId>;

    /// Called once the resolved environment has been committed.
    fn committed(&self, _environment: &EnvironmentId) {}
}

/// One vote per voter; the most voted candidate wins.
///
/// Ties go to whichever candidate comes first in the configured list. Votes
/// for environments outside the candidate list are ignored. The box empties
/// only when the winner is committed, so a cycle that overlaps a manual
/// transition or fails keeps every vote for the next one.
#[derive(Debug, Default)]
pub struct VoteBox {
    votes: Mutex<BTreeMap<String, EnvironmentId>>,
}

impl VoteBox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a vote, replacing the voter's earlier one (which is returned).
    pub fn cast(&self, voter: impl Into<String>, choice: EnvironmentId) -> Option<EnvironmentId> {
        self.lock().insert(voter.into(), choice)
    }

    pub fn retract(&self, voter: &str) -> bool {
        self.lock().remove(voter).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Votes per environment, most voted first.
    pub fn tally(&self) -> Vec<(EnvironmentId, usize)> {
        let mut counts: BTreeMap<EnvironmentId, usize> = BTreeMap::new();
        for choice in self.lock().values() {
            *counts.entry(choice.clone()).or_default() += 1;
        }
        let mut tally: Vec<_> = counts.into_iter().collect();
        tally.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        tally
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, EnvironmentId>> {
        self.votes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EnvironmentResolver for VoteBox {
    fn resolve(
        &self,
        candidates: &[EnvironmentId],
        _current: Option<&EnvironmentId>,
    ) -> Option<EnvironmentId> {
        let ballots = self.lock();
        let mut best: Option<(usize, &EnvironmentId)> = None;
        for candidate in candidates {
            let count = ballots.values().filter(|v| *v == candidate).count();
            if count > 0 && best.is_none_or(|(top, _)| count > top) {
                best = Some((count, candidate));
            }
        }
        best.map(|(_, id)| id.clone())
    }

    fn committed(&self, _environment: &EnvironmentId) {
        self.lock().clear();
    }
}

/// Fixed parameters of a rotation.
#[derive(Debug, Clone)]
pub struct RotationSettings {
    pub mode: RotationMode,
    /// Candidates in configured order.
    pub list: Vec<EnvironmentId>,
    /// Random mode skips the current environment when there is an alternative.
    pub exclude_current: bool,
    /// Cycles are skipped while fewer players are online. 0 disables the guard.
    pub min_occupancy: usize,
    pub origin: BlockPos,
    pub countdown_seconds: u32,
    pub seed: u64,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            mode: RotationMode::Sequential,
            list: Vec::new(),
            exclude_current: true,
            min_occupancy: 0,
            origin: BlockPos::ORIGIN,
            countdown_seconds: 0,
            seed: 0x5eed,
        }
    }
}

/// What one scheduler firing did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Rotated(CommittedTransition),
    /// The occupancy guard held the cycle back.
    Suppressed { online: usize, required: usize },
    NoSelection,
    /// A manual transition was in flight; waits for the next interval.
    Overlapped(EnvironmentId),
    Failed {
        target: EnvironmentId,
        error: TransitionError,
    },
}

struct Selection {
    cursor: i64,
    rng: SplitMix64,
}

struct Core {
    orchestrator: Orchestrator,
    settings: RotationSettings,
    occupancy: Arc<dyn OccupancyProbe>,
    resolver: Mutex<Option<Arc<dyn EnvironmentResolver>>>,
    selection: Mutex<Selection>,
}

struct Running {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Fires [`Orchestrator::begin`] on a fixed interval.
///
/// `Stopped` until [`start`](Self::start). Dropping every handle stops the
/// loop at its next wait.
#[derive(Clone)]
pub struct RotationScheduler {
    core: Arc<Core>,
    running: Arc<Mutex<Option<Running>>>,
}

impl RotationScheduler {
    pub fn new(
        orchestrator: Orchestrator,
        settings: RotationSettings,
        occupancy: Arc<dyn OccupancyProbe>,
    ) -> Self {
        let rng = SplitMix64::new(settings.seed);
        Self {
            core: Arc::new(Core {
                orchestrator,
                settings,
                occupancy,
                resolver: Mutex::new(None),
                selection: Mutex::new(Selection { cursor: -1, rng }),
            }),
            running: Arc::new(Mutex::new(None)),
        }
    }

    /// Resolver consulted in [`RotationMode::External`].
    pub fn set_resolver(&self, resolver: Arc<dyn EnvironmentResolver>) {
        *self
            .core
            .resolver
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(resolver);
    }

    pub fn settings(&self) -> &RotationSettings {
        &self.core.settings
    }

    /// Index of the last sequential pick, -1 before the first.
    pub fn cursor(&self) -> i64 {
        self.core.selection().cursor
    }

    pub fn set_cursor(&self, cursor: i64) {
        self.core.selection().cursor = cursor;
    }

    /// Start firing every `interval`, the first one `interval` from now.
    ///
    /// Restarting replaces the running timer; it never stacks a second one.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, interval: Duration) -> Result<(), RotationError> {
        if interval.is_zero() {
            return Err(RotationError::ZeroInterval);
        }
        let mut running = self.running();
        if let Some(old) = running.take() {
            old.stop.send_replace(true);
        }

        let (stop, mut stop_rx) = watch::channel(false);
        let core = self.core.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = stopped(&mut stop_rx) => break,
                    _ = ticker.tick() => {}
                }
                // a cycle that started runs to completion even if stop arrives meanwhile
                core.run_cycle().await;
            }
            tracing::debug!("rotation loop exited");
        });
        *running = Some(Running { stop, task });
        tracing::info!(secs = interval.as_secs_f32(), mode = ?self.core.settings.mode, "rotation started");
        Ok(())
    }

    /// Stop firing. Idempotent; a cycle already in flight finishes.
    pub fn stop(&self) -> bool {
        match self.running().take() {
            Some(old) => {
                old.stop.send_replace(true);
                tracing::info!("rotation stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running()
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Choose the next environment according to the mode. Sequential mode
    /// advances the cursor.
    pub fn select_next(&self) -> Option<EnvironmentId> {
        self.core.select_next()
    }

    /// One firing: occupancy guard, selection, then `begin`.
    pub async fn run_cycle(&self) -> CycleOutcome {
        self.core.run_cycle().await
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for RotationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationScheduler")
            .field("mode", &self.core.settings.mode)
            .field("cursor", &self.cursor())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Core {
    fn selection(&self) -> MutexGuard<'_, Selection> {
        self.selection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn select_next(&self) -> Option<EnvironmentId> {
        let list = &self.settings.list;
        match self.settings.mode {
            RotationMode::Sequential => {
                if list.is_empty() {
                    return None;
                }
                let len = list.len() as i64;
                let mut selection = self.selection();
                // restored cursors may be anything; normalise before stepping
                let next = (selection.cursor.rem_euclid(len) + 1) % len;
                selection.cursor = next;
                Some(list[next as usize].clone())
            }
            RotationMode::Random => {
                if list.is_empty() {
                    return None;
                }
                let current = self.orchestrator.current();
                let mut candidates: Vec<&EnvironmentId> = list.iter().collect();
                if self.settings.exclude_current && list.len() > 1 {
                    candidates.retain(|id| Some(*id) != current.as_ref());
                    if candidates.is_empty() {
                        candidates = list.iter().collect();
                    }
                }
                let index = self.selection().rng.below(candidates.len());
                Some(candidates[index].clone())
            }
            RotationMode::External => {
                let resolver = self
                    .resolver
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                let Some(resolver) = resolver else {
                    tracing::warn!("external rotation has no resolver");
                    return None;
                };
                let current = self.orchestrator.current();
                resolver.resolve(list, current.as_ref())
            }
        }
    }

    async fn run_cycle(&self) -> CycleOutcome {
        let settings = &self.settings;
        if settings.min_occupancy > 0 {
            let online = self.occupancy.online();
            if online < settings.min_occupancy {
                tracing::info!(online, required = settings.min_occupancy, "rotation skipped: not enough players");
                return CycleOutcome::Suppressed {
                    online,
                    required: settings.min_occupancy,
                };
            }
        }

        let Some(target) = self.select_next() else {
            tracing::warn!(mode = ?settings.mode, "rotation skipped: nothing selected");
            return CycleOutcome::NoSelection;
        };

        match self
            .orchestrator
            .begin(target.clone(), settings.origin, settings.countdown_seconds)
            .await
        {
            Ok(done) => {
                tracing::info!(environment = %done.environment, "rotated");
                if settings.mode == RotationMode::External {
                    let resolver = self
                        .resolver
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    if let Some(resolver) = resolver {
                        resolver.committed(&done.environment);
                    }
                }
                CycleOutcome::Rotated(done)
            }
            Err(TransitionError::AlreadyInProgress) => {
                tracing::warn!(target = %target, "rotation skipped: transition already in progress");
                CycleOutcome::Overlapped(target)
            }
            Err(error) => {
                tracing::warn!(target = %target, "rotation failed: {error}");
                CycleOutcome::Failed { target, error }
            }
        }
    }
}
