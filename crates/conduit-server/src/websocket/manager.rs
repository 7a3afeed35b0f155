//! Connection manager: the transport table, session attachment, event
//! dispatch, and connection statistics.
//!
//! Connections are looked up by id in a sharded map. Session state lives in
//! the runtime's registry; this type never holds a map guard while calling
//! into a session.

use std::sync::Arc;

use conduit_core::ids::{ConnectionId, UserId};
use conduit_runtime::bridge::BridgedEnvelope;
use conduit_runtime::registry::SessionRegistry;
use conduit_runtime::session::{
    AttachReport, ConnectionSink, Delivery, DetachReason, LinkStatus, ReplayCursor,
};
use conduit_runtime::Runtime;
use conduit_telemetry::metrics::{
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_HEARTBEAT_EVICTIONS_TOTAL, WS_REPLAYED_TOTAL,
};
use dashmap::DashMap;
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::connection::{ClientConnection, Outbound};
use crate::errors::ConnectionError;

/// Attempts at attaching before giving up on a session that keeps being
/// reclaimed underneath us.
const ATTACH_ATTEMPTS: usize = 3;

/// Connection counts by state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    /// Attached with every ping answered.
    pub active: usize,
    /// Attached with at least one unanswered ping.
    pub missed_beat: usize,
    /// No connection, runs in flight, last detach voluntary.
    pub reconnecting: usize,
    /// No connection, last detach was an eviction or a failed send.
    pub failed: usize,
    /// Open transports not yet bound to a user.
    pub unattached: usize,
}

/// Owns every open connection of one server.
pub struct ConnectionManager {
    runtime: Runtime,
    connections: DashMap<ConnectionId, Arc<ClientConnection>>,
    send_queue_capacity: usize,
}

impl ConnectionManager {
    /// Manager for `runtime`'s sessions. Each connection queues at most
    /// `send_queue_capacity` outbound frames.
    pub fn new(runtime: Runtime, send_queue_capacity: usize) -> Self {
        Self {
            runtime,
            connections: DashMap::new(),
            send_queue_capacity: send_queue_capacity.max(1),
        }
    }

    /// The runtime.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    fn registry(&self) -> &Arc<SessionRegistry> {
        self.runtime.registry()
    }

    /// Open a new, unattached connection. The receiver feeds its writer.
    pub fn register(&self) -> (Arc<ClientConnection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(self.send_queue_capacity);
        let connection = Arc::new(ClientConnection::new(ConnectionId::generate(), tx));
        let _ = self
            .connections
            .insert(connection.id().clone(), Arc::clone(&connection));
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
        debug!(connection_id = %connection.id(), "connection registered");
        (connection, rx)
    }

    /// Open connection by id.
    pub fn get(&self, connection_id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.get(connection_id).map(|c| Arc::clone(c.value()))
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Bind `connection` to the user's session and replay what it missed.
    ///
    /// Any previous connection of the user is closed with
    /// [`DetachReason::Replaced`]. A session sealed by reclamation is
    /// dropped and a fresh one created.
    #[instrument(skip(self, connection, cursor), fields(connection_id = %connection.id(), user_id = %user_id))]
    pub fn attach(
        &self,
        connection: &Arc<ClientConnection>,
        user_id: &UserId,
        cursor: Option<&ReplayCursor>,
    ) -> Result<AttachReport, ConnectionError> {
        connection.bind_user(user_id)?;
        let sink: Arc<dyn ConnectionSink> = Arc::clone(connection) as Arc<dyn ConnectionSink>;

        for _ in 0..ATTACH_ATTEMPTS {
            let session = self.registry().resolve_or_create(user_id);
            if session.is_sealed() {
                let _ = self.registry().remove_if_same(user_id, &session);
                continue;
            }
            let report = session.attach(&sink, cursor);
            if session.is_sealed() {
                let _ = session.detach(connection.id(), DetachReason::Reclaimed);
                let _ = self.registry().remove_if_same(user_id, &session);
                continue;
            }
            counter!(WS_REPLAYED_TOTAL).increment(report.replayed as u64);
            info!(
                replayed = report.replayed,
                replaced = report.replaced.as_ref().map(ConnectionId::as_str),
                interrupted = report.interrupted,
                "connection attached"
            );
            return Ok(report);
        }
        Err(ConnectionError::SessionUnavailable(user_id.clone()))
    }

    /// Close and forget a connection, detaching it from its session. Runs
    /// keep executing and buffering. Unknown ids are ignored.
    pub fn disconnect(&self, connection_id: &ConnectionId, reason: DetachReason) {
        let Some((_, connection)) = self.connections.remove(connection_id) else {
            return;
        };
        gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        connection.close(reason);
        let reason = connection.close_reason().unwrap_or(reason);
        if let Some(user_id) = connection.user_id() {
            if let Some(session) = self.registry().get(&user_id) {
                let _ = session.detach(connection_id, reason);
            }
        }
        debug!(%connection_id, reason = reason.as_str(), "connection removed");
    }

    /// Force-close a connection whose pings went unanswered.
    pub fn evict(&self, connection: &ClientConnection) {
        counter!(WS_HEARTBEAT_EVICTIONS_TOTAL).increment(1);
        warn!(
            connection_id = %connection.id(),
            missed_beats = connection.missed_beats(),
            "heartbeat timeout, evicting connection"
        );
        connection.close(DetachReason::HeartbeatTimeout);
        self.disconnect(connection.id(), DetachReason::HeartbeatTimeout);
    }

    /// Close every connection.
    pub fn close_all(&self, reason: DetachReason) {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|c| c.key().clone()).collect();
        for id in ids {
            self.disconnect(&id, reason);
        }
    }

    /// Route one envelope into its user's session.
    pub fn publish(&self, bridged: &BridgedEnvelope) -> Delivery {
        let Some(session) = self.registry().get(&bridged.user_id) else {
            trace!(user_id = %bridged.user_id, run_id = %bridged.envelope.run_id, "no session, envelope discarded");
            return Delivery::Discarded;
        };
        session.publish(&bridged.envelope)
    }

    /// Consume the runtime's event channel until it closes or `shutdown`.
    pub fn spawn_dispatch(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<BridgedEnvelope>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    next = events.recv() => match next {
                        Some(bridged) => {
                            let _ = manager.publish(&bridged);
                        }
                        None => break,
                    },
                }
            }
            debug!("dispatch stopped");
        })
    }

    /// Count connections by state, scanning the session registry.
    pub fn stats(&self) -> ConnectionStats {
        let mut stats = ConnectionStats::default();
        for session in self.registry().sessions() {
            match session.link_status() {
                LinkStatus::Attached(id) => {
                    let missed = self.get(&id).map_or(0, |c| c.missed_beats());
                    if missed > 0 {
                        stats.missed_beat += 1;
                    } else {
                        stats.active += 1;
                    }
                }
                LinkStatus::Reconnecting => stats.reconnecting += 1,
                LinkStatus::Failed => stats.failed += 1,
                LinkStatus::Idle => {}
            }
        }
        stats.unattached = self
            .connections
            .iter()
            .filter(|c| c.value().user_id().is_none())
            .count();
        stats
    }
}
