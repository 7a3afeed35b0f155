//! Session reclamation and per-user footprint tracking.
//!
//! Reclamation seals a session under its own lock before removing it from
//! the registry, so a request racing with the sweep either lands in the
//! session before it is sealed (and the session stays) or sees the seal and
//! resolves a fresh session.

use std::sync::Arc;
use std::time::Duration;

use conduit_core::ids::UserId;
use conduit_settings::LifecycleSettings;
use conduit_telemetry::metrics::{ORPHAN_RUNS_CANCELLED_TOTAL, SESSIONS_RECLAIMED_TOTAL};
use metrics::counter;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::registry::SessionRegistry;
use crate::session::{SealOutcome, UserSession};

/// Reclamation thresholds.
#[derive(Clone, Debug)]
pub struct LifecycleConfig {
    /// Idle time before an ordinary session is reclaimed.
    pub idle_threshold: Duration,
    /// Idle time before a session over its memory cap is reclaimed.
    pub priority_idle_threshold: Duration,
    /// Detached time after which active runs are cancelled.
    pub orphan_timeout: Duration,
    /// Sweep period.
    pub sweep_interval: Duration,
    /// Per-user footprint cap. Crossing it first drops fully delivered
    /// finished runs, then marks the session for priority reclamation;
    /// in-flight runs and undelivered envelopes are never discarded.
    pub memory_cap_bytes: usize,
}

impl LifecycleConfig {
    /// From the `lifecycle` settings section.
    pub fn from_settings(settings: &LifecycleSettings) -> Self {
        Self {
            idle_threshold: Duration::from_millis(settings.idle_threshold_ms),
            priority_idle_threshold: Duration::from_millis(settings.priority_idle_threshold_ms),
            orphan_timeout: Duration::from_millis(settings.orphan_timeout_ms),
            sweep_interval: Duration::from_millis(settings.sweep_interval_ms),
            memory_cap_bytes: settings.memory_cap_bytes,
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::from_settings(&LifecycleSettings::default())
    }
}

/// Result of a reclamation attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// The session was sealed and removed.
    Reclaimed,
    /// The session has runs, a connection, or recent activity.
    Busy,
    /// No session for this user.
    NotFound,
}

/// What one sweep did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Sessions newly marked over their memory cap.
    pub capped: usize,
    /// Detached runs cancelled.
    pub orphaned_runs: usize,
    /// Sessions reclaimed.
    pub reclaimed: usize,
}

/// Reclaims idle sessions and cancels orphaned runs.
pub struct LifecycleManager {
    registry: Arc<SessionRegistry>,
    config: LifecycleConfig,
}

impl LifecycleManager {
    /// Manager over `registry`.
    pub fn new(registry: Arc<SessionRegistry>, config: LifecycleConfig) -> Self {
        Self { registry, config }
    }

    /// Thresholds in use.
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Reclaim the user's session if it is idle past its threshold.
    /// Reclaiming an already reclaimed user is `NotFound`.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn reclaim(&self, user_id: &UserId) -> ReclaimOutcome {
        match self.registry.get(user_id) {
            Some(session) => self.reclaim_session(&session, Instant::now()),
            None => ReclaimOutcome::NotFound,
        }
    }

    fn reclaim_session(&self, session: &Arc<UserSession>, now: Instant) -> ReclaimOutcome {
        let threshold = if session.is_priority_reclaim() {
            self.config.priority_idle_threshold
        } else {
            self.config.idle_threshold
        };
        if session.try_seal(threshold, now) == SealOutcome::Busy {
            return ReclaimOutcome::Busy;
        }
        if !self.registry.remove_if_same(session.user_id(), session) {
            return ReclaimOutcome::NotFound;
        }
        counter!(SESSIONS_RECLAIMED_TOTAL).increment(1);
        info!(user_id = %session.user_id(), priority = session.is_priority_reclaim(), "session reclaimed");
        ReclaimOutcome::Reclaimed
    }

    /// Estimated bytes held by the user's session.
    pub fn memory_footprint(&self, user_id: &UserId) -> Option<usize> {
        self.registry.get(user_id).map(|s| s.footprint_bytes())
    }

    /// Bring the user's session under the cap by dropping fully delivered
    /// finished runs, else mark it for priority reclamation. In-flight work
    /// is left alone. Returns whether it is still over.
    pub fn enforce_cap(&self, user_id: &UserId) -> bool {
        self.registry
            .get(user_id)
            .is_some_and(|s| self.enforce_cap_on(&s))
    }

    fn enforce_cap_on(&self, session: &UserSession) -> bool {
        let mut footprint = session.footprint_bytes();
        if footprint <= self.config.memory_cap_bytes {
            return false;
        }
        let trimmed = session.trim_delivered();
        if trimmed > 0 {
            footprint = session.footprint_bytes();
            debug!(user_id = %session.user_id(), trimmed, footprint, "delivered runs trimmed over memory cap");
            if footprint <= self.config.memory_cap_bytes {
                return false;
            }
        }
        if !session.is_priority_reclaim() {
            warn!(
                user_id = %session.user_id(),
                footprint,
                cap = self.config.memory_cap_bytes,
                "session over memory cap, marked for priority reclamation"
            );
            session.mark_priority_reclaim();
        }
        true
    }

    /// Enforce caps, cancel orphaned runs, then reclaim idle sessions,
    /// priority-marked sessions first.
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let mut report = SweepReport::default();
        let mut sessions = self.registry.sessions();

        for session in &sessions {
            let was_marked = session.is_priority_reclaim();
            if self.enforce_cap_on(session) && !was_marked {
                report.capped += 1;
            }
            if session
                .detached_for(now)
                .is_some_and(|d| d >= self.config.orphan_timeout)
            {
                for run in session.active_runs() {
                    if !run.is_cancelled() {
                        run.cancel();
                        report.orphaned_runs += 1;
                        counter!(ORPHAN_RUNS_CANCELLED_TOTAL).increment(1);
                        warn!(user_id = %session.user_id(), run_id = %run.run_id(), "orphaned run cancelled");
                    }
                }
            }
        }

        sessions.sort_by_key(|s| !s.is_priority_reclaim());
        for session in &sessions {
            if self.reclaim_session(session, now) == ReclaimOutcome::Reclaimed {
                report.reclaimed += 1;
            }
        }
        if report != SweepReport::default() {
            debug!(?report, "sweep finished");
        }
        report
    }

    /// Run [`LifecycleManager::sweep`] every `sweep_interval` until `shutdown`.
    pub fn spawn_sweeper(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let _ = self.sweep();
                    }
                }
            }
            debug!("sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RunHandle;
    use crate::record::RunRecord;
    use crate::session::ConnectionSink;
    use crate::testing::RecordingSink;
    use conduit_core::context::ExecutionContext;
    use conduit_core::events::{EventEnvelope, EventType};
    use conduit_core::ids::{RunId, ThreadId};

    fn make_config() -> LifecycleConfig {
        LifecycleConfig {
            idle_threshold: Duration::from_secs(60),
            priority_idle_threshold: Duration::from_secs(5),
            orphan_timeout: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(10),
            memory_cap_bytes: 1 << 20,
        }
    }

    fn make_manager(config: LifecycleConfig) -> (LifecycleManager, Arc<SessionRegistry>) {
        let registry = Arc::new(SessionRegistry::new());
        (LifecycleManager::new(Arc::clone(&registry), config), registry)
    }

    fn add_run(registry: &SessionRegistry, user: &str, run: &str) -> Arc<RunHandle> {
        let ctx = ExecutionContext::builder(UserId::from(user), ThreadId::from("t"))
            .run_id(RunId::from(run))
            .build();
        let record = RunRecord::new(&ctx, Vec::new());
        let handle = Arc::new(RunHandle::new(ctx, record));
        assert!(registry.claim_run(handle.run_id(), &UserId::from(user)));
        registry
            .resolve_or_create(&UserId::from(user))
            .register_run(Arc::clone(&handle))
            .unwrap();
        handle
    }

    #[tokio::test(start_paused = true)]
    async fn reclaim_is_idempotent() {
        let (manager, registry) = make_manager(make_config());
        let user = UserId::from("alice");
        let _ = registry.resolve_or_create(&user);
        assert_eq!(manager.reclaim(&user), ReclaimOutcome::Busy);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(manager.reclaim(&user), ReclaimOutcome::Reclaimed);
        assert_eq!(manager.reclaim(&user), ReclaimOutcome::NotFound);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_with_runs_or_connections_are_busy() {
        let (manager, registry) = make_manager(make_config());
        let _run = add_run(&registry, "alice", "r1");
        let sink = RecordingSink::new("c1");
        let bob = registry.resolve_or_create(&UserId::from("bob"));
        let _ = bob.attach(&(Arc::clone(&sink) as Arc<dyn ConnectionSink>), None);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(manager.reclaim(&UserId::from("alice")), ReclaimOutcome::Busy);
        assert_eq!(manager.reclaim(&UserId::from("bob")), ReclaimOutcome::Busy);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn over_cap_sessions_use_priority_threshold() {
        let mut config = make_config();
        config.memory_cap_bytes = 0;
        let (manager, registry) = make_manager(config);
        let user = UserId::from("alice");
        let handle = add_run(&registry, "alice", "r1");

        assert!(manager.memory_footprint(&user).unwrap() > 0);
        assert!(manager.enforce_cap(&user));
        assert!(registry.get(&user).unwrap().is_priority_reclaim());
        assert!(!handle.is_cancelled());

        registry.get(&user).unwrap().finish_run(handle.run_id());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(manager.reclaim(&user), ReclaimOutcome::Reclaimed);
    }

    #[tokio::test(start_paused = true)]
    async fn cap_trims_delivered_runs_of_a_connected_client() {
        let mut config = make_config();
        config.memory_cap_bytes = 0;
        let (manager, registry) = make_manager(config);
        let user = UserId::from("alice");
        let handle = add_run(&registry, "alice", "r1");
        let session = registry.get(&user).unwrap();
        let sink = RecordingSink::new("c1");
        let _ = session.attach(&(Arc::clone(&sink) as Arc<dyn ConnectionSink>), None);
        for seq in 1..=3 {
            let event_type = if seq == 3 { EventType::RunCompleted } else { EventType::PartialResult };
            let _ = session.publish(&EventEnvelope {
                event_type,
                run_id: handle.run_id().clone(),
                payload: serde_json::json!({ "seq": seq }),
                sequence_number: seq,
                timestamp: chrono::Utc::now(),
            });
        }
        session.finish_run(handle.run_id());
        assert!(manager.memory_footprint(&user).unwrap() > 0);

        assert!(!manager.enforce_cap(&user));
        assert_eq!(manager.memory_footprint(&user), Some(0));
        assert!(!session.is_priority_reclaim());
        assert_eq!(sink.sequences(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_cancels_orphaned_runs_once() {
        let (manager, registry) = make_manager(make_config());
        let handle = add_run(&registry, "alice", "r1");

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(manager.sweep().orphaned_runs, 0);

        tokio::time::advance(Duration::from_secs(100)).await;
        let report = manager.sweep();
        assert_eq!(report.orphaned_runs, 1);
        assert_eq!(report.reclaimed, 0);
        assert!(handle.is_cancelled());
        assert_eq!(manager.sweep().orphaned_runs, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn attached_sessions_are_not_orphaned() {
        let (manager, registry) = make_manager(make_config());
        let handle = add_run(&registry, "alice", "r1");
        let sink = RecordingSink::new("c1");
        let session = registry.get(&UserId::from("alice")).unwrap();
        let _ = session.attach(&(Arc::clone(&sink) as Arc<dyn ConnectionSink>), None);

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(manager.sweep(), SweepReport::default());
        assert!(!handle.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_reclaims_and_stops() {
        let (manager, registry) = make_manager(make_config());
        let _ = registry.resolve_or_create(&UserId::from("alice"));
        let shutdown = CancellationToken::new();
        let task = Arc::new(manager).spawn_sweeper(shutdown.clone());

        tokio::time::sleep(Duration::from_secs(75)).await;
        assert!(registry.is_empty());
        shutdown.cancel();
        task.await.unwrap();
    }
}
