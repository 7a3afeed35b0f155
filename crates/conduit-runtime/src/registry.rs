//! Registry of live user sessions and the global run-id index.
//!
//! Both maps are sharded `DashMap`s. Session creation goes through the entry
//! API so two concurrent first requests for the same user observe the same
//! session. Callers always clone the `Arc` out of the map before touching a
//! session, so no shard guard is held while a session lock is taken.

use std::sync::Arc;

use conduit_core::ids::{RunId, UserId};
use conduit_telemetry::metrics::SESSIONS_ACTIVE;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::gauge;
use tracing::{debug, info, instrument};

use crate::engine::RunHandle;
use crate::session::{SessionSummary, UserSession};

#[allow(clippy::cast_precision_loss)]
fn record_session_count(count: usize) {
    gauge!(SESSIONS_ACTIVE).set(count as f64);
}

/// All live sessions, keyed by user.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<UserId, Arc<UserSession>>,
    runs: DashMap<RunId, UserId>,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The user's session, created on first use.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn resolve_or_create(&self, user_id: &UserId) -> Arc<UserSession> {
        if let Some(existing) = self.sessions.get(user_id) {
            return Arc::clone(existing.value());
        }
        let session = self
            .sessions
            .entry(user_id.clone())
            .or_insert_with(|| {
                info!("session created");
                Arc::new(UserSession::new(user_id.clone()))
            })
            .clone();
        record_session_count(self.sessions.len());
        session
    }

    /// The user's session, if one exists.
    pub fn get(&self, user_id: &UserId) -> Option<Arc<UserSession>> {
        self.sessions.get(user_id).map(|s| Arc::clone(s.value()))
    }

    /// Drop the user's session. Absent users are ignored.
    pub fn remove(&self, user_id: &UserId) {
        if self.sessions.remove(user_id).is_some() {
            debug!(%user_id, "session removed");
            record_session_count(self.sessions.len());
        }
    }

    /// Drop the user's session only if it is still `session`.
    pub fn remove_if_same(&self, user_id: &UserId, session: &Arc<UserSession>) -> bool {
        let removed = self
            .sessions
            .remove_if(user_id, |_, current| Arc::ptr_eq(current, session))
            .is_some();
        if removed {
            record_session_count(self.sessions.len());
        }
        removed
    }

    /// Arc clones of every session, released from the map before returning.
    pub fn sessions(&self) -> Vec<Arc<UserSession>> {
        self.sessions.iter().map(|s| Arc::clone(s.value())).collect()
    }

    /// Diagnostic summaries of every session.
    pub fn snapshot(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> =
            self.sessions().iter().map(|s| s.summary()).collect();
        summaries.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        summaries
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether there are no sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Claim `run_id` for `user_id`. `false` if already claimed.
    pub fn claim_run(&self, run_id: &RunId, user_id: &UserId) -> bool {
        match self.runs.entry(run_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let _ = slot.insert(user_id.clone());
                true
            }
        }
    }

    /// Release a run claim.
    pub fn release_run(&self, run_id: &RunId) {
        let _ = self.runs.remove(run_id);
    }

    /// Owner of an active run.
    pub fn owner_of(&self, run_id: &RunId) -> Option<UserId> {
        self.runs.get(run_id).map(|u| u.value().clone())
    }

    /// Handle of an active run owned by `user_id`.
    pub fn find_run(&self, user_id: &UserId, run_id: &RunId) -> Option<Arc<RunHandle>> {
        if self.owner_of(run_id).as_ref() != Some(user_id) {
            return None;
        }
        self.get(user_id)?.run(run_id)
    }

    /// Number of claimed runs.
    pub fn active_runs(&self) -> usize {
        self.runs.len()
    }
}
