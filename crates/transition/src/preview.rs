//! Temporary, self-reverting pastes keyed by requester.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use worldswap_common::{BlockPos, EnvironmentId};
use worldswap_persist::SnapshotSource;

use crate::domain::{AppliedHandle, MutationDomain};
use crate::error::PreviewError;

/// Default preview lifetime.
pub const DEFAULT_PREVIEW_DURATION: Duration = Duration::from_secs(30);

/// What a successful [`PreviewManager::start_preview`] put in the world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewTicket {
    pub session: u64,
    pub environment: EnvironmentId,
    pub handle: AppliedHandle,
    pub revert_at: Instant,
}

struct Session {
    id: u64,
    environment: EnvironmentId,
    /// Taken by whichever revert path runs first.
    handle: Mutex<Option<AppliedHandle>>,
    timer: Mutex<Option<AbortHandle>>,
}

impl Session {
    fn handle(&self) -> Option<AppliedHandle> {
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_handle(&self) -> Option<AppliedHandle> {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn stop_timer(&self) {
        if let Some(timer) = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.abort();
        }
    }
}

struct Inner {
    source: Arc<dyn SnapshotSource>,
    domain: MutationDomain,
    sessions: tokio::sync::Mutex<HashMap<String, Arc<Session>>>,
    next_session: AtomicU64,
    closed: AtomicBool,
}

impl Inner {
    /// Undo the session's paste if nothing else has. Returns whether this call did it.
    async fn revert(&self, requester: &str, session: &Session, reason: &'static str) -> bool {
        let Some(handle) = session.take_handle() else {
            return false;
        };
        match self.domain.undo(handle).await {
            Ok(()) => {
                tracing::info!(requester, environment = %session.environment, %handle, reason, "preview reverted");
            }
            Err(e) => {
                tracing::error!(requester, environment = %session.environment, %handle, reason, "preview revert failed: {e}");
            }
        }
        true
    }

    /// Drop sessions whose paste a later overlapping paste already undid.
    async fn prune(&self, sessions: &mut HashMap<String, Arc<Session>>) {
        let mut gone = Vec::new();
        for (requester, session) in sessions.iter() {
            if let Some(handle) = session.handle() {
                if self.domain.is_superseded(handle).await {
                    gone.push(requester.clone());
                }
            }
        }
        for requester in gone {
            if let Some(session) = sessions.remove(&requester) {
                session.stop_timer();
                self.revert(&requester, &session, "superseded").await;
            }
        }
    }

    async fn expire(&self, requester: &str, session: Arc<Session>) {
        let mut sessions = self.sessions.lock().await;
        if sessions
            .get(requester)
            .is_some_and(|live| Arc::ptr_eq(live, &session))
        {
            sessions.remove(requester);
        }
        self.revert(requester, &session, "expired").await;
    }
}

/// Runs previews through the same [`MutationDomain`] as the orchestrator.
///
/// At most one live session per requester. Every applied preview is undone
/// exactly once, by its timer or by an explicit cancel, whichever comes first.
/// The timer is a detached task, so it fires even if every handle to the
/// manager is dropped.
#[derive(Clone)]
pub struct PreviewManager {
    inner: Arc<Inner>,
}

impl PreviewManager {
    pub fn new(source: Arc<dyn SnapshotSource>, domain: MutationDomain) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                domain,
                sessions: tokio::sync::Mutex::new(HashMap::new()),
                next_session: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Paste `target` at `origin` for `duration`, replacing this requester's
    /// live preview (reverted first) if there is one.
    pub async fn start_preview(
        &self,
        requester: &str,
        target: EnvironmentId,
        origin: BlockPos,
        duration: Duration,
    ) -> Result<PreviewTicket, PreviewError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(PreviewError::ShuttingDown);
        }
        if target.is_empty() || !self.inner.source.contains(&target) {
            return Err(PreviewError::UnknownEnvironment(target));
        }

        let source = self.inner.source.clone();
        let id = target.clone();
        let snapshot = match tokio::task::spawn_blocking(move || source.decode(&id)).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                return Err(PreviewError::SnapshotUnavailable {
                    id: target,
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                return Err(PreviewError::SnapshotUnavailable {
                    id: target,
                    reason: format!("decode task failed: {e}"),
                });
            }
        };

        let mut sessions = self.inner.sessions.lock().await;
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(PreviewError::ShuttingDown);
        }
        self.inner.prune(&mut sessions).await;
        if let Some(old) = sessions.remove(requester) {
            old.stop_timer();
            self.inner.revert(requester, &old, "replaced").await;
        }

        let handle = self
            .inner
            .domain
            .apply_temporary(&snapshot, origin)
            .await
            .map_err(|source| {
                tracing::error!(requester, environment = %target, "preview paste failed: {source}");
                PreviewError::MutationFailed {
                    id: target.clone(),
                    source,
                }
            })?;

        let session = Arc::new(Session {
            id: self.inner.next_session.fetch_add(1, Ordering::Relaxed),
            environment: target.clone(),
            handle: Mutex::new(Some(handle)),
            timer: Mutex::new(None),
        });
        let revert_at = Instant::now() + duration;
        let timer = {
            let inner = self.inner.clone();
            let session = session.clone();
            let requester = requester.to_owned();
            tokio::spawn(async move {
                tokio::time::sleep_until(revert_at).await;
                inner.expire(&requester, session).await;
            })
        };
        *session.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(timer.abort_handle());
        sessions.insert(requester.to_owned(), session.clone());

        tracing::info!(requester, environment = %target, %handle, secs = duration.as_secs_f32(), "preview started");
        Ok(PreviewTicket {
            session: session.id,
            environment: target,
            handle,
            revert_at,
        })
    }

    /// Revert the requester's live preview now. `false` if there was none.
    pub async fn cancel_preview(&self, requester: &str) -> bool {
        let mut sessions = self.inner.sessions.lock().await;
        self.inner.prune(&mut sessions).await;
        let Some(session) = sessions.remove(requester) else {
            return false;
        };
        session.stop_timer();
        self.inner.revert(requester, &session, "cancelled").await
    }

    /// Whether `requester` has a preview still standing in the world.
    pub async fn is_live(&self, requester: &str) -> bool {
        self.live().await.contains_key(requester)
    }

    /// Environment currently previewed by `requester`.
    pub async fn previewing(&self, requester: &str) -> Option<EnvironmentId> {
        self.live()
            .await
            .get(requester)
            .map(|s| s.environment.clone())
    }

    pub async fn live_count(&self) -> usize {
        self.live().await.len()
    }

    async fn live(&self) -> tokio::sync::MutexGuard<'_, HashMap<String, Arc<Session>>> {
        let mut sessions = self.inner.sessions.lock().await;
        self.inner.prune(&mut sessions).await;
        sessions
    }

    /// Revert every live preview and refuse new ones. Returns how many were reverted.
    pub async fn shutdown(&self) -> usize {
        self.inner.closed.store(true, Ordering::SeqCst);
        let mut sessions = self.inner.sessions.lock().await;
        let mut reverted = 0;
        for (requester, session) in sessions.drain() {
            session.stop_timer();
            if self.inner.revert(&requester, &session, "shutdown").await {
                reverted += 1;
            }
        }
        reverted
    }
}

impl std::fmt::Debug for PreviewManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreviewManager")
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, Recorder, recording_domain, store};

    fn manager() -> (PreviewManager, Recorder) {
        let (domain, rec) = recording_domain();
        (PreviewManager::new(Arc::new(store(&["A", "B"])), domain), rec)
    }

    async fn start(m: &PreviewManager, who: &str, env: &str) -> PreviewTicket {
        start_at(m, who, env, BlockPos::ORIGIN).await
    }

    async fn start_at(m: &PreviewManager, who: &str, env: &str, origin: BlockPos) -> PreviewTicket {
        m.start_preview(who, env.into(), origin, DEFAULT_PREVIEW_DURATION)
            .await
            .unwrap()
    }

    const ELSEWHERE: BlockPos = BlockPos::new(40, 0, 40);

    async fn sleep_secs(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn timer_reverts_exactly_once() {
        let (m, rec) = manager();
        let ticket = start(&m, "alice", "A").await;
        assert!(m.is_live("alice").await);

        sleep_secs(29).await;
        assert!(rec.undos().is_empty());
        sleep_secs(2).await;

        assert_eq!(rec.undos(), vec![ticket.handle]);
        assert!(!m.is_live("alice").await);
        assert!(!m.cancel_preview("alice").await);
        assert_eq!(rec.undos().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_beats_timer() {
        let (m, rec) = manager();
        let ticket = start(&m, "alice", "A").await;

        assert!(m.cancel_preview("alice").await);
        assert!(!m.cancel_preview("alice").await);
        sleep_secs(60).await;

        assert_eq!(rec.undos(), vec![ticket.handle]);
    }

    #[tokio::test(start_paused = true)]
    async fn replacing_reverts_before_applying() {
        let (m, rec) = manager();
        let first = start(&m, "alice", "A").await;
        let second = start(&m, "alice", "B").await;

        assert_eq!(
            rec.calls(),
            vec![
                Call::Apply(first.handle, 1),
                Call::Undo(first.handle),
                Call::Apply(second.handle, 2),
            ]
        );
        assert_eq!(m.live_count().await, 1);
        assert_eq!(m.previewing("alice").await, Some(EnvironmentId::from("B")));

        sleep_secs(31).await;
        assert_eq!(rec.undos(), vec![first.handle, second.handle]);
    }

    #[tokio::test(start_paused = true)]
    async fn requesters_are_independent() {
        let (m, rec) = manager();
        start(&m, "alice", "A").await;
        start_at(&m, "bob", "A", ELSEWHERE).await;
        assert_eq!(m.live_count().await, 2);

        m.cancel_preview("alice").await;
        assert!(m.is_live("bob").await);
        assert_eq!(rec.undos().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn revert_outlives_the_requester() {
        let (m, rec) = manager();
        let ticket = {
            let m = m.clone();
            tokio::spawn(async move { start(&m, "alice", "A").await })
                .await
                .unwrap()
        };
        drop(m);

        sleep_secs(31).await;
        assert_eq!(rec.undos(), vec![ticket.handle]);
    }

    #[tokio::test]
    async fn failures_leave_no_session() {
        let (m, rec) = manager();
        let err = m
            .start_preview("alice", "nowhere".into(), BlockPos::ORIGIN, DEFAULT_PREVIEW_DURATION)
            .await
            .unwrap_err();
        assert_eq!(err, PreviewError::UnknownEnvironment("nowhere".into()));

        rec.set_failing(true);
        let err = m
            .start_preview("alice", "A".into(), BlockPos::ORIGIN, DEFAULT_PREVIEW_DURATION)
            .await
            .unwrap_err();
        assert!(matches!(err, PreviewError::MutationFailed { .. }));
        assert!(!m.is_live("alice").await);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_reverts_everything() {
        let (m, rec) = manager();
        start(&m, "alice", "A").await;
        start_at(&m, "bob", "B", ELSEWHERE).await;

        assert_eq!(m.shutdown().await, 2);
        assert_eq!(m.live_count().await, 0);
        assert_eq!(rec.undos().len(), 2);
        assert_eq!(
            m.start_preview("carol", "A".into(), BlockPos::ORIGIN, DEFAULT_PREVIEW_DURATION)
                .await,
            Err(PreviewError::ShuttingDown)
        );

        sleep_secs(60).await;
        assert_eq!(rec.undos().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_preview_retires_the_older_one() {
        let (m, rec) = manager();
        let alice = start(&m, "alice", "A").await;
        let bob = start(&m, "bob", "B").await;

        assert_eq!(
            rec.calls(),
            vec![
                Call::Apply(alice.handle, 1),
                Call::Undo(alice.handle),
                Call::Apply(bob.handle, 2),
            ]
        );
        assert!(!m.is_live("alice").await);
        assert_eq!(m.previewing("bob").await, Some(EnvironmentId::from("B")));

        sleep_secs(31).await;
        assert_eq!(rec.undos(), vec![alice.handle, bob.handle]);
    }

    #[tokio::test(start_paused = true)]
    async fn commit_over_a_preview_cancels_its_revert() {
        let (m, rec) = manager();
        let ticket = start(&m, "alice", "A").await;

        let committed = m
            .inner
            .domain
            .apply(&crate::testing::marked_snapshot(2), BlockPos::ORIGIN)
            .await
            .unwrap();
        assert!(!m.is_live("alice").await);

        sleep_secs(31).await;
        assert_eq!(
            rec.calls(),
            vec![
                Call::Apply(ticket.handle, 1),
                Call::Undo(ticket.handle),
                Call::Apply(committed, 2),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn previews_and_transitions_share_one_gate() {
        use crate::orchestrator::{Orchestrator, TransitionSettings};
        use crate::safety::NoopSafety;

        let (domain, rec) = recording_domain();
        let source: Arc<dyn SnapshotSource> = Arc::new(store(&["A", "B"]));
        let orch = Orchestrator::new(
            source.clone(),
            domain.clone(),
            Arc::new(NoopSafety),
            TransitionSettings::default(),
        );
        let m = PreviewManager::new(source, domain);

        let mut viewers = Vec::new();
        for i in 0..8 {
            let m = m.clone();
            viewers.push(tokio::spawn(async move {
                let who = format!("viewer{i}");
                // clear of the swap region and of each other
                let origin = BlockPos::new(100 + i * 10, 0, 0);
                m.start_preview(&who, "B".into(), origin, Duration::from_secs(60))
                    .await
                    .unwrap();
                assert!(m.cancel_preview(&who).await);
            }));
        }
        let swapper = tokio::spawn(async move {
            for target in ["A", "B", "A", "B"] {
                orch.begin(target.into(), BlockPos::ORIGIN, 0).await.unwrap();
            }
        });
        for viewer in viewers {
            viewer.await.unwrap();
        }
        swapper.await.unwrap();

        assert_eq!(rec.peak(), 1);
        assert_eq!(rec.applies(), 12);
        assert_eq!(rec.undos().len(), 8);
    }
}
