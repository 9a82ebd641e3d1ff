//! The transition orchestrator: one end-to-end swap of the current environment.

use glam::Vec3;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tracing::Instrument;
use worldswap_common::{BlockPos, EntityId, EnvironmentId};
use worldswap_persist::{SessionState, SnapshotSource};

use crate::countdown::{Countdown, CountdownOutcome};
use crate::domain::{AppliedHandle, MutationDomain};
use crate::error::TransitionError;
use crate::history::HistoryStack;
use crate::observers::{CallbackRegistry, EnvironmentChange};
use crate::safety::{SafetyCoordinator, secure_region};

const EVENT_CAPACITY: usize = 64;

/// Lifecycle of the single in-flight transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionState {
    Idle,
    AwaitingSnapshot,
    CountingDown,
    Applying,
    Committed,
    Failed,
}

/// Progress notifications, in the order a transition emits them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionEvent {
    Started {
        target: EnvironmentId,
    },
    /// The region was secured. Always precedes the first countdown tick.
    Relocated {
        target: EnvironmentId,
        occupants: usize,
        relocated: usize,
        cleared: usize,
    },
    Countdown {
        target: EnvironmentId,
        remaining: u32,
    },
    Applied {
        target: EnvironmentId,
        handle: AppliedHandle,
    },
    Committed {
        current: EnvironmentId,
        previous: Option<EnvironmentId>,
    },
    Failed {
        target: EnvironmentId,
        error: TransitionError,
    },
}

/// Result of a committed transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTransition {
    pub environment: EnvironmentId,
    pub previous: Option<EnvironmentId>,
    pub relocated: usize,
    pub cleared: usize,
}

/// Fixed behaviour of an orchestrator.
#[derive(Debug, Clone)]
pub struct TransitionSettings {
    /// Where occupants of the affected region are sent.
    pub fallback: Vec3,
    /// Hide the cleanup from occupants with a short visual suppression.
    pub suppression: bool,
    /// Cap on rollback history. `None` keeps everything.
    pub history_depth: Option<usize>,
}

impl Default for TransitionSettings {
    fn default() -> Self {
        Self {
            fallback: Vec3::ZERO,
            suppression: false,
            history_depth: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Swap,
    Rollback,
}

struct Slots {
    state: TransitionState,
    current: Option<EnvironmentId>,
    history: HistoryStack,
}

struct Inner {
    source: Arc<dyn SnapshotSource>,
    domain: MutationDomain,
    safety: Arc<dyn SafetyCoordinator>,
    registry: CallbackRegistry,
    settings: TransitionSettings,
    slots: Mutex<Slots>,
    events: broadcast::Sender<TransitionEvent>,
    shutdown: watch::Sender<bool>,
}

/// Owns `current`, the rollback history and the transition state.
///
/// Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        domain: MutationDomain,
        safety: Arc<dyn SafetyCoordinator>,
        settings: TransitionSettings,
    ) -> Self {
        let history = match settings.history_depth {
            Some(depth) => HistoryStack::with_max_depth(depth),
            None => HistoryStack::new(),
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                source,
                domain,
                safety,
                registry: CallbackRegistry::new(),
                settings,
                slots: Mutex::new(Slots {
                    state: TransitionState::Idle,
                    current: None,
                    history,
                }),
                events,
                shutdown,
            }),
        }
    }

    /// Swap the current environment for `target`.
    ///
    /// Rejects with `AlreadyInProgress` rather than queueing. Dropping the
    /// returned future before it resolves abandons the transition without
    /// committing and frees the slot.
    pub async fn begin(
        &self,
        target: EnvironmentId,
        origin: BlockPos,
        countdown_seconds: u32,
    ) -> Result<CommittedTransition, TransitionError> {
        let (guard, target) = self.claim(|_| Ok(target))?;
        self.run(guard, target, origin, countdown_seconds, Mode::Swap)
            .await
    }

    /// Transition back to the environment on top of the history stack.
    ///
    /// The entry is popped only when that transition commits.
    pub async fn rollback(
        &self,
        origin: BlockPos,
        countdown_seconds: u32,
    ) -> Result<CommittedTransition, TransitionError> {
        let (guard, target) = self.claim(|slots| {
            slots
                .history
                .peek()
                .cloned()
                .ok_or(TransitionError::HistoryEmpty)
        })?;
        self.run(guard, target, origin, countdown_seconds, Mode::Rollback)
            .await
    }

    /// Receive progress events for every subsequent transition.
    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> TransitionState {
        self.slots().state
    }

    pub fn current(&self) -> Option<EnvironmentId> {
        self.slots().current.clone()
    }

    /// Rollback history, oldest first.
    pub fn history(&self) -> Vec<EnvironmentId> {
        self.slots().history.entries().to_vec()
    }

    pub fn registry(&self) -> &CallbackRegistry {
        &self.inner.registry
    }

    pub fn domain(&self) -> &MutationDomain {
        &self.inner.domain
    }

    pub fn source(&self) -> &Arc<dyn SnapshotSource> {
        &self.inner.source
    }

    pub fn settings(&self) -> &TransitionSettings {
        &self.inner.settings
    }

    /// Load persisted `current` and history. Only allowed while idle.
    pub fn restore(&self, state: &SessionState) -> Result<(), TransitionError> {
        let mut slots = self.slots();
        if slots.state != TransitionState::Idle {
            return Err(TransitionError::AlreadyInProgress);
        }
        let entries = state.history.clone();
        let history = match self.inner.settings.history_depth {
            Some(depth) => HistoryStack::from_entries_bounded(entries, depth),
            None => HistoryStack::from_entries(entries),
        };
        slots.current = state.current.clone();
        slots.history = history;
        tracing::debug!(current = ?slots.current, depth = slots.history.len(), "session restored");
        Ok(())
    }

    /// Current environment and history in their persisted form.
    pub fn session(&self, rotation_cursor: i64) -> SessionState {
        let slots = self.slots();
        SessionState {
            current: slots.current.clone(),
            history: slots.history.entries().to_vec(),
            rotation_cursor,
        }
    }

    /// Cancel any running countdown and refuse further transitions.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        tracing::info!("orchestrator shutting down");
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the in-flight slot, resolving the target while the lock is held.
    fn claim(
        &self,
        resolve: impl FnOnce(&Slots) -> Result<EnvironmentId, TransitionError>,
    ) -> Result<(InFlight<'_>, EnvironmentId), TransitionError> {
        let mut slots = self.slots();
        if slots.state != TransitionState::Idle {
            return Err(TransitionError::AlreadyInProgress);
        }
        if self.is_shut_down() {
            return Err(TransitionError::ShuttingDown);
        }
        let target = resolve(&slots)?;
        if target.is_empty() || !self.inner.source.contains(&target) {
            return Err(TransitionError::UnknownEnvironment(target));
        }
        slots.state = TransitionState::AwaitingSnapshot;
        Ok((InFlight { inner: &self.inner }, target))
    }

    async fn run(
        &self,
        guard: InFlight<'_>,
        target: EnvironmentId,
        origin: BlockPos,
        countdown_seconds: u32,
        mode: Mode,
    ) -> Result<CommittedTransition, TransitionError> {
        let span = tracing::info_span!("transition", target = %target, ?mode);
        let result = self
            .steps(&guard, &target, origin, countdown_seconds, mode)
            .instrument(span)
            .await;
        if let Err(error) = &result {
            guard.set(TransitionState::Failed);
            tracing::warn!(target = %target, "transition failed: {error}");
            self.emit(TransitionEvent::Failed {
                target,
                error: error.clone(),
            });
        }
        result
    }

    async fn steps(
        &self,
        guard: &InFlight<'_>,
        target: &EnvironmentId,
        origin: BlockPos,
        countdown_seconds: u32,
        mode: Mode,
    ) -> Result<CommittedTransition, TransitionError> {
        self.emit(TransitionEvent::Started {
            target: target.clone(),
        });

        let source = self.inner.source.clone();
        let id = target.clone();
        let snapshot = match tokio::task::spawn_blocking(move || source.decode(&id)).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                return Err(TransitionError::SnapshotUnavailable {
                    id: target.clone(),
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                return Err(TransitionError::SnapshotUnavailable {
                    id: target.clone(),
                    reason: format!("decode task failed: {e}"),
                });
            }
        };
        tracing::debug!(blocks = snapshot.blocks.len(), "snapshot decoded");

        let region = snapshot.absolute_bounds(origin);
        let settings = &self.inner.settings;
        let report = secure_region(
            self.inner.safety.as_ref(),
            &region,
            settings.fallback,
            settings.suppression,
        );
        let suppressed = Suppressed {
            safety: self.inner.safety.as_ref(),
            entities: if settings.suppression {
                report.occupants.clone()
            } else {
                Vec::new()
            },
        };
        self.emit(TransitionEvent::Relocated {
            target: target.clone(),
            occupants: report.occupants.len(),
            relocated: report.relocated,
            cleared: report.cleared,
        });

        guard.set(TransitionState::CountingDown);
        let mut shutdown = self.inner.shutdown.subscribe();
        let outcome = Countdown::new(countdown_seconds)
            .run(&mut shutdown, |remaining| {
                tracing::debug!(remaining, "countdown");
                self.emit(TransitionEvent::Countdown {
                    target: target.clone(),
                    remaining,
                });
            })
            .await;
        if outcome == CountdownOutcome::Cancelled {
            return Err(TransitionError::Cancelled(target.clone()));
        }

        guard.set(TransitionState::Applying);
        let handle = self
            .inner
            .domain
            .apply(&snapshot, origin)
            .await
            .map_err(|source| {
                tracing::error!(%region, "paste failed: {source}");
                TransitionError::MutationFailed {
                    id: target.clone(),
                    source,
                }
            })?;
        drop(snapshot);
        self.emit(TransitionEvent::Applied {
            target: target.clone(),
            handle,
        });

        let previous = {
            let mut slots = self.slots();
            let previous = slots.current.replace(target.clone());
            match mode {
                Mode::Swap => {
                    if previous.as_ref() != Some(target) {
                        slots.history.push_if_changed(previous.as_ref());
                    }
                }
                Mode::Rollback => {
                    if slots.history.peek() == Some(target) {
                        slots.history.pop();
                    }
                }
            }
            slots.state = TransitionState::Committed;
            previous
        };
        drop(suppressed);

        tracing::info!(previous = ?previous, relocated = report.relocated, cleared = report.cleared, "environment committed");
        let change = EnvironmentChange {
            current: target.clone(),
            previous: previous.clone(),
        };
        self.inner.registry.notify_all(&change);
        self.emit(TransitionEvent::Committed {
            current: target.clone(),
            previous: previous.clone(),
        });

        Ok(CommittedTransition {
            environment: target.clone(),
            previous,
            relocated: report.relocated,
            cleared: report.cleared,
        })
    }

    fn emit(&self, event: TransitionEvent) {
        // no subscribers is fine
        let _ = self.inner.events.send(event);
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.slots();
        f.debug_struct("Orchestrator")
            .field("state", &slots.state)
            .field("current", &slots.current)
            .field("history", &slots.history.len())
            .finish_non_exhaustive()
    }
}

/// The claimed in-flight slot. Dropping it returns the state to `Idle`.
struct InFlight<'a> {
    inner: &'a Inner,
}

impl InFlight<'_> {
    fn set(&self, state: TransitionState) {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state = state;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set(TransitionState::Idle);
    }
}

/// Suppression applied to occupants; lifted on drop.
struct Suppressed<'a> {
    safety: &'a dyn SafetyCoordinator,
    entities: Vec<EntityId>,
}

impl Drop for Suppressed<'_> {
    fn drop(&mut self) {
        if !self.entities.is_empty() {
            self.safety.remove_suppression(&self.entities);
        }
    }
}
