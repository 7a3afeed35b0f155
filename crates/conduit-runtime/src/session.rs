//! Per-user session state: active runs, replay outboxes, and the one live
//! connection the user currently holds.
//!
//! Every mutation happens under the session's own lock. No operation here
//! takes another session's lock. The connection is held as a weak reference
//! so a transport can vanish at any time without the session noticing until
//! its next delivery attempt.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use conduit_core::events::EventEnvelope;
use conduit_core::ids::{ConnectionId, RunId, UserId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::engine::RunHandle;
use crate::errors::RuntimeError;

/// Transport endpoint that envelopes are delivered to.
pub trait ConnectionSink: Send + Sync {
    /// Connection identity.
    fn connection_id(&self) -> &ConnectionId;

    /// Queue an envelope without blocking. `false` if the queue is full or
    /// the transport is gone.
    fn deliver(&self, envelope: &EventEnvelope) -> bool;

    /// Close the transport. Must not block or touch any session.
    fn close(&self, reason: DetachReason);
}

/// Why a connection stopped being the session's live connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetachReason {
    /// The client closed the transport.
    ClientClosed,
    /// Too many pings went unanswered.
    HeartbeatTimeout,
    /// The outbound queue was full or closed.
    SendFailed,
    /// A newer connection for the same user attached.
    Replaced,
    /// The session was reclaimed.
    Reclaimed,
    /// The transport was dropped without a close.
    Dropped,
    /// The server is shutting down.
    Shutdown,
}

impl DetachReason {
    /// Whether the detach reflects a transport failure rather than a
    /// voluntary close.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::HeartbeatTimeout | Self::SendFailed | Self::Dropped)
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::SendFailed => "send_failed",
            Self::Replaced => "replaced",
            Self::Reclaimed => "reclaimed",
            Self::Dropped => "dropped",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Client-supplied resume position.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayCursor {
    /// Run the position refers to. `None` means the most recently started run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    /// Highest sequence number the client already has.
    #[serde(default)]
    pub last_seen_sequence: u64,
}

/// What happened to a published envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Buffered and handed to the live connection.
    Delivered,
    /// Buffered for replay; no usable connection.
    Buffered,
    /// Already ingested.
    Duplicate,
    /// The run is unknown to this session, or the session is sealed.
    Discarded,
}

/// Result of attaching a connection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AttachReport {
    /// Envelopes replayed to the new connection.
    pub replayed: usize,
    /// Connection that was displaced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replaced: Option<ConnectionId>,
    /// Whether the replay was cut short by a delivery failure.
    pub interrupted: bool,
}

/// Connection state as seen by the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkStatus {
    /// A connection is attached.
    Attached(ConnectionId),
    /// No connection, runs in flight, last detach was voluntary.
    Reconnecting,
    /// No connection, last detach was a transport failure.
    Failed,
    /// No connection and nothing running.
    Idle,
}

impl LinkStatus {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attached(_) => "attached",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Idle => "idle",
        }
    }
}

/// Diagnostic view of a session.
#[derive(Clone, Debug, Serialize)]
pub struct SessionSummary {
    /// Owning user.
    pub user_id: UserId,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Runs still executing.
    pub active_runs: usize,
    /// Runs with a replay buffer.
    pub buffered_runs: usize,
    /// Envelopes awaiting acknowledgement.
    pub buffered_envelopes: usize,
    /// Estimated bytes held.
    pub footprint_bytes: usize,
    /// Live connection, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,
    /// `attached`, `reconnecting`, `failed`, or `idle`.
    pub link: &'static str,
    /// Marked for early reclamation.
    pub priority_reclaim: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RegisterError {
    Sealed,
    DuplicateRun,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SealOutcome {
    Sealed,
    Busy,
}

#[derive(Default)]
struct RunOutbox {
    buffer: VecDeque<EventEnvelope>,
    buffered_bytes: usize,
    ingested: u64,
    acked: u64,
    delivered: u64,
    terminal_seen: bool,
}

impl RunOutbox {
    /// Buffer an envelope unless it was already seen.
    fn ingest(&mut self, envelope: &EventEnvelope) -> bool {
        if envelope.sequence_number <= self.ingested || envelope.sequence_number <= self.acked {
            return false;
        }
        self.ingested = envelope.sequence_number;
        self.terminal_seen |= envelope.event_type.is_terminal();
        self.buffered_bytes += envelope.approx_size();
        self.buffer.push_back(envelope.clone());
        true
    }

    /// Drop everything at or below `sequence`, capped at the highest
    /// ingested sequence so a stale cursor cannot swallow future envelopes.
    fn prune_through(&mut self, sequence: u64) {
        let sequence = sequence.min(self.ingested);
        if sequence <= self.acked {
            return;
        }
        self.acked = sequence;
        while self
            .buffer
            .front()
            .is_some_and(|e| e.sequence_number <= sequence)
        {
            if let Some(e) = self.buffer.pop_front() {
                self.buffered_bytes = self.buffered_bytes.saturating_sub(e.approx_size());
            }
        }
    }

    fn drained(&self) -> bool {
        self.terminal_seen && self.buffer.is_empty()
    }
}

struct AttachedConnection {
    id: ConnectionId,
    sink: Weak<dyn ConnectionSink>,
}

struct SessionState {
    runs: HashMap<RunId, Arc<RunHandle>>,
    outboxes: HashMap<RunId, RunOutbox>,
    run_order: Vec<RunId>,
    connection: Option<AttachedConnection>,
    last_detach: Option<DetachReason>,
    detached_at: Instant,
    last_activity: Instant,
    priority_reclaim: bool,
    sealed: bool,
}

impl SessionState {
    fn drop_link(&mut self, reason: DetachReason) -> Option<Arc<dyn ConnectionSink>> {
        let link = self.connection.take()?;
        let now = Instant::now();
        self.last_detach = Some(reason);
        self.detached_at = now;
        self.last_activity = now;
        link.sink.upgrade()
    }

    fn forget_run(&mut self, run_id: &RunId) {
        let _ = self.outboxes.remove(run_id);
        self.run_order.retain(|id| id != run_id);
    }
}

/// All live state of one user.
pub struct UserSession {
    user_id: UserId,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
}

impl UserSession {
    /// Empty session with no runs and no connection.
    pub fn new(user_id: UserId) -> Self {
        let now = Instant::now();
        Self {
            user_id,
            created_at: Utc::now(),
            state: Mutex::new(SessionState {
                runs: HashMap::new(),
                outboxes: HashMap::new(),
                run_order: Vec::new(),
                connection: None,
                last_detach: None,
                detached_at: now,
                last_activity: now,
                priority_reclaim: false,
                sealed: false,
            }),
        }
    }

    /// Owning user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub(crate) fn register_run(&self, handle: Arc<RunHandle>) -> Result<(), RegisterError> {
        let mut state = self.state.lock();
        if state.sealed {
            return Err(RegisterError::Sealed);
        }
        let run_id = handle.run_id().clone();
        if state.outboxes.contains_key(&run_id) {
            return Err(RegisterError::DuplicateRun);
        }
        let _ = state.outboxes.insert(run_id.clone(), RunOutbox::default());
        state.run_order.push(run_id.clone());
        let _ = state.runs.insert(run_id, handle);
        state.last_activity = Instant::now();
        Ok(())
    }

    /// Mark a run as no longer executing. Its replay buffer is kept until
    /// acknowledged or the session is reclaimed.
    pub(crate) fn finish_run(&self, run_id: &RunId) {
        let mut state = self.state.lock();
        if state.runs.remove(run_id).is_some() {
            state.last_activity = Instant::now();
        }
    }

    /// Buffer an envelope for its run and deliver it to the live connection.
    ///
    /// A failed delivery detaches the connection so it can never observe a
    /// gap; the client resumes through [`UserSession::attach`].
    pub fn publish(&self, envelope: &EventEnvelope) -> Delivery {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.sealed {
            return Delivery::Discarded;
        }
        let delivered = {
            let Some(outbox) = state.outboxes.get_mut(&envelope.run_id) else {
                return Delivery::Discarded;
            };
            if !outbox.ingest(envelope) {
                return Delivery::Duplicate;
            }
            outbox.delivered
        };

        let Some(link) = state.connection.as_ref() else {
            return Delivery::Buffered;
        };
        if envelope.sequence_number <= delivered {
            return Delivery::Buffered;
        }
        let Some(sink) = link.sink.upgrade() else {
            let _ = state.drop_link(DetachReason::Dropped);
            debug!(
                error = %RuntimeError::ConnectionLost(self.user_id.clone()),
                run_id = %envelope.run_id,
                "connection dropped, buffering"
            );
            return Delivery::Buffered;
        };

        if sink.deliver(envelope) {
            if let Some(outbox) = state.outboxes.get_mut(&envelope.run_id) {
                outbox.delivered = envelope.sequence_number;
            }
            Delivery::Delivered
        } else {
            let _ = state.drop_link(DetachReason::SendFailed);
            sink.close(DetachReason::SendFailed);
            warn!(
                error = %RuntimeError::ConnectionLost(self.user_id.clone()),
                connection_id = %sink.connection_id(),
                run_id = %envelope.run_id,
                sequence = envelope.sequence_number,
                "delivery failed, connection detached"
            );
            Delivery::Buffered
        }
    }

    /// Make `sink` the live connection and replay buffered envelopes.
    ///
    /// Runs are replayed in start order, each in sequence order, beginning
    /// after the cursor (for the run it names, or the latest run) or after
    /// the acknowledged position. A cursor ahead of the acknowledged
    /// position acknowledges what it covers, up to the highest ingested
    /// sequence. Re-attaching the live connection never resends what it
    /// already received.
    #[instrument(skip_all, fields(user_id = %self.user_id, connection_id = %sink.connection_id()))]
    pub fn attach(&self, sink: &Arc<dyn ConnectionSink>, cursor: Option<&ReplayCursor>) -> AttachReport {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut report = AttachReport::default();

        let mut same_connection = false;
        if let Some(previous) = state.connection.take() {
            same_connection = previous.id == *sink.connection_id();
            if !same_connection {
                if let Some(old) = previous.sink.upgrade() {
                    old.close(DetachReason::Replaced);
                }
                info!(replaced = %previous.id, "connection replaced");
                report.replaced = Some(previous.id);
            }
        }
        state.connection = Some(AttachedConnection {
            id: sink.connection_id().clone(),
            sink: Arc::downgrade(sink),
        });
        state.last_activity = Instant::now();

        let cursor_run = cursor.and_then(|c| c.run_id.clone().or_else(|| state.run_order.last().cloned()));
        let order = state.run_order.clone();
        for run_id in &order {
            let Some(outbox) = state.outboxes.get_mut(run_id) else {
                continue;
            };
            if let (Some(c), Some(target)) = (cursor, cursor_run.as_ref()) {
                if target == run_id {
                    outbox.prune_through(c.last_seen_sequence);
                }
            }
            let mut start = match (cursor, cursor_run.as_ref()) {
                (Some(c), Some(target)) if target == run_id => {
                    c.last_seen_sequence.min(outbox.ingested).max(outbox.acked)
                }
                _ => outbox.acked,
            };
            if same_connection {
                start = start.max(outbox.delivered);
            }
            outbox.delivered = start;
            if report.interrupted {
                continue;
            }
            for envelope in outbox.buffer.iter().filter(|e| e.sequence_number > start) {
                if !sink.deliver(envelope) {
                    report.interrupted = true;
                    break;
                }
                outbox.delivered = envelope.sequence_number;
                report.replayed += 1;
            }
        }

        if report.interrupted {
            let _ = state.drop_link(DetachReason::SendFailed);
            sink.close(DetachReason::SendFailed);
            warn!(replayed = report.replayed, "replay interrupted, connection detached");
        } else {
            debug!(replayed = report.replayed, "connection attached");
        }
        report
    }

    /// Detach `connection_id` if it is the live connection.
    pub fn detach(&self, connection_id: &ConnectionId, reason: DetachReason) -> bool {
        let mut state = self.state.lock();
        if state.connection.as_ref().is_none_or(|c| c.id != *connection_id) {
            return false;
        }
        let _ = state.drop_link(reason);
        info!(user_id = %self.user_id, %connection_id, reason = reason.as_str(), "connection detached");
        true
    }

    /// Acknowledge envelopes of `run_id` up to `sequence`.
    pub fn acknowledge(&self, run_id: &RunId, sequence: u64) -> bool {
        let mut state = self.state.lock();
        let finished = !state.runs.contains_key(run_id);
        let Some(outbox) = state.outboxes.get_mut(run_id) else {
            return false;
        };
        outbox.prune_through(sequence);
        if finished && outbox.drained() {
            state.forget_run(run_id);
        }
        true
    }

    /// Connection state.
    pub fn link_status(&self) -> LinkStatus {
        let state = self.state.lock();
        match (&state.connection, state.last_detach) {
            (Some(link), _) => LinkStatus::Attached(link.id.clone()),
            (None, Some(reason)) if reason.is_failure() => LinkStatus::Failed,
            (None, _) if !state.runs.is_empty() => LinkStatus::Reconnecting,
            (None, _) => LinkStatus::Idle,
        }
    }

    /// Handles of runs still executing.
    pub fn active_runs(&self) -> Vec<Arc<RunHandle>> {
        self.state.lock().runs.values().cloned().collect()
    }

    /// Number of runs still executing.
    pub fn active_run_count(&self) -> usize {
        self.state.lock().runs.len()
    }

    /// Whether the session owns this active run.
    pub fn run(&self, run_id: &RunId) -> Option<Arc<RunHandle>> {
        self.state.lock().runs.get(run_id).cloned()
    }

    /// Time since the session became idle (no runs, no connection).
    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        let state = self.state.lock();
        (state.runs.is_empty() && state.connection.is_none())
            .then(|| now.saturating_duration_since(state.last_activity))
    }

    /// Time since the connection went away while runs are still executing.
    pub fn detached_for(&self, now: Instant) -> Option<Duration> {
        let state = self.state.lock();
        (!state.runs.is_empty() && state.connection.is_none())
            .then(|| now.saturating_duration_since(state.detached_at))
    }

    /// Estimated bytes held: replay buffers plus active run records.
    ///
    /// Takes the session lock, then each run's record lock.
    pub fn footprint_bytes(&self) -> usize {
        let state = self.state.lock();
        let buffers: usize = state.outboxes.values().map(|o| o.buffered_bytes).sum();
        let records: usize = state.runs.values().map(|h| h.record_size()).sum();
        buffers + records
    }

    /// Drop the replay buffers of finished runs that the live connection has
    /// received in full. Returns how many runs were dropped.
    pub fn trim_delivered(&self) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.connection.is_none() {
            return 0;
        }
        let done: Vec<RunId> = state
            .outboxes
            .iter()
            .filter(|(id, o)| !state.runs.contains_key(*id) && o.terminal_seen && o.delivered >= o.ingested)
            .map(|(id, _)| id.clone())
            .collect();
        for run_id in &done {
            state.forget_run(run_id);
        }
        done.len()
    }

    /// Flag the session for early reclamation.
    pub fn mark_priority_reclaim(&self) {
        self.state.lock().priority_reclaim = true;
    }

    /// Whether the session is flagged for early reclamation.
    pub fn is_priority_reclaim(&self) -> bool {
        self.state.lock().priority_reclaim
    }

    /// Whether the session has been sealed by reclamation.
    pub fn is_sealed(&self) -> bool {
        self.state.lock().sealed
    }

    /// Seal the session if it has been idle for at least `threshold`.
    /// A sealed session accepts no new runs and discards published events.
    pub(crate) fn try_seal(&self, threshold: Duration, now: Instant) -> SealOutcome {
        let mut state = self.state.lock();
        if state.sealed {
            return SealOutcome::Sealed;
        }
        let idle = state.runs.is_empty() && state.connection.is_none();
        if !idle || now.saturating_duration_since(state.last_activity) < threshold {
            return SealOutcome::Busy;
        }
        state.sealed = true;
        state.outboxes.clear();
        state.run_order.clear();
        SealOutcome::Sealed
    }

    /// Diagnostic snapshot.
    pub fn summary(&self) -> SessionSummary {
        let footprint_bytes = self.footprint_bytes();
        let link = self.link_status();
        let state = self.state.lock();
        SessionSummary {
            user_id: self.user_id.clone(),
            created_at: self.created_at,
            active_runs: state.runs.len(),
            buffered_runs: state.outboxes.len(),
            buffered_envelopes: state.outboxes.values().map(|o| o.buffer.len()).sum(),
            footprint_bytes,
            connection_id: state.connection.as_ref().map(|c| c.id.clone()),
            link: link.as_str(),
            priority_reclaim: state.priority_reclaim,
        }
    }
}
