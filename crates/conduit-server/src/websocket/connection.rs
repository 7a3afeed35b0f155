//! WebSocket client connection state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conduit_core::events::EventEnvelope;
use conduit_core::ids::{ConnectionId, UserId};
use conduit_runtime::session::{ConnectionSink, DetachReason};
use conduit_telemetry::metrics::WS_SEND_FAILURES_TOTAL;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::ConnectionError;

/// Frame queued for the connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// JSON text frame.
    Text(Arc<String>),
    /// Heartbeat ping.
    Ping,
}

#[derive(Debug, Default)]
struct Heartbeat {
    last_ping: Option<Instant>,
    last_pong: Option<Instant>,
    missed_beats: u32,
    awaiting_pong: bool,
}

/// One connected WebSocket client.
///
/// The connection serves at most one user. It is handed to that user's
/// session as a [`ConnectionSink`]; the session only keeps a weak reference.
pub struct ClientConnection {
    id: ConnectionId,
    user_id: Mutex<Option<UserId>>,
    tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    close_reason: Mutex<Option<DetachReason>>,
    heartbeat: Mutex<Heartbeat>,
    connected_at: Instant,
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// New, unattached connection writing to `tx`.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            user_id: Mutex::new(None),
            tx,
            cancel: CancellationToken::new(),
            close_reason: Mutex::new(None),
            heartbeat: Mutex::new(Heartbeat::default()),
            connected_at: Instant::now(),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// User this connection serves, once attached.
    pub fn user_id(&self) -> Option<UserId> {
        self.user_id.lock().clone()
    }

    /// Bind the connection to `user_id`. Rebinding to the same user is fine;
    /// a different user is rejected.
    pub fn bind_user(&self, user_id: &UserId) -> Result<(), ConnectionError> {
        let mut bound = self.user_id.lock();
        match bound.as_ref() {
            Some(current) if current != user_id => Err(ConnectionError::UserMismatch {
                connection_id: self.id.clone(),
                bound: current.clone(),
                requested: user_id.clone(),
            }),
            Some(_) => Ok(()),
            None => {
                *bound = Some(user_id.clone());
                Ok(())
            }
        }
    }

    /// Queue a text frame. `false` if the queue is full or closed.
    pub fn send(&self, text: Arc<String>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if self.tx.try_send(Outbound::Text(text)).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize `value` and queue it.
    pub fn send_json<T: Serialize>(&self, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.send(Arc::new(json)),
            Err(err) => {
                debug!(connection_id = %self.id, %err, "failed to serialize outbound frame");
                false
            }
        }
    }

    /// Start a heartbeat beat. An unanswered previous ping counts as a
    /// missed beat. Returns the missed-beat count.
    pub fn begin_beat(&self) -> u32 {
        let mut hb = self.heartbeat.lock();
        if hb.awaiting_pong {
            hb.missed_beats += 1;
        }
        hb.missed_beats
    }

    /// Queue a ping and mark it outstanding.
    pub fn send_ping(&self) -> bool {
        {
            let mut hb = self.heartbeat.lock();
            hb.last_ping = Some(Instant::now());
            hb.awaiting_pong = true;
        }
        self.tx.try_send(Outbound::Ping).is_ok()
    }

    /// A pong arrived: clear missed beats.
    pub fn record_pong(&self) {
        let mut hb = self.heartbeat.lock();
        hb.last_pong = Some(Instant::now());
        hb.missed_beats = 0;
        hb.awaiting_pong = false;
    }

    /// Consecutive unanswered pings.
    pub fn missed_beats(&self) -> u32 {
        self.heartbeat.lock().missed_beats
    }

    /// When the last ping was sent.
    pub fn last_ping(&self) -> Option<Instant> {
        self.heartbeat.lock().last_ping
    }

    /// When the last pong arrived.
    pub fn last_pong(&self) -> Option<Instant> {
        self.heartbeat.lock().last_pong
    }

    /// Token cancelled when the connection closes.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Why the connection was closed. The first reason wins.
    pub fn close_reason(&self) -> Option<DetachReason> {
        *self.close_reason.lock()
    }

    /// Frames dropped because the queue was full or closed.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl ConnectionSink for ClientConnection {
    fn connection_id(&self) -> &ConnectionId {
        &self.id
    }

    fn deliver(&self, envelope: &EventEnvelope) -> bool {
        self.send_json(envelope)
    }

    fn close(&self, reason: DetachReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(reason);
        }
        if reason == DetachReason::SendFailed {
            counter!(WS_SEND_FAILURES_TOTAL).increment(1);
        }
        debug!(connection_id = %self.id, reason = reason.as_str(), "closing connection");
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use conduit_core::events::EventType;
    use conduit_core::ids::RunId;
    use serde_json::json;

    fn make_connection(capacity: usize) -> (ClientConnection, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (ClientConnection::new(ConnectionId::from("c1"), tx), rx)
    }

    fn envelope(seq: u64) -> EventEnvelope {
        EventEnvelope {
            event_type: EventType::AgentStarted,
            run_id: RunId::from("r1"),
            payload: json!({"agent_name": "usage"}),
            sequence_number: seq,
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn deliver_serializes_envelope() {
        let (conn, mut rx) = make_connection(4);
        assert!(conn.deliver(&envelope(3)));
        let Some(Outbound::Text(text)) = rx.recv().await else {
            panic!("expected a text frame");
        };
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["type"], "agent_started");
        assert_eq!(parsed["sequence_number"], 3);
    }

    #[test]
    fn full_queue_rejects_and_counts() {
        let (conn, _rx) = make_connection(1);
        assert!(conn.send(Arc::new("a".into())));
        assert!(!conn.send(Arc::new("b".into())));
        assert_eq!(conn.drop_count(), 1);
    }

    #[test]
    fn closed_connection_rejects_sends() {
        let (conn, _rx) = make_connection(4);
        conn.close(DetachReason::HeartbeatTimeout);
        assert!(conn.is_closed());
        assert!(!conn.send(Arc::new("a".into())));
    }

    #[test]
    fn first_close_reason_wins() {
        let (conn, _rx) = make_connection(4);
        conn.close(DetachReason::Replaced);
        conn.close(DetachReason::Shutdown);
        assert_eq!(conn.close_reason(), Some(DetachReason::Replaced));
    }

    #[test]
    fn bind_user_rejects_a_second_user() {
        let (conn, _rx) = make_connection(4);
        conn.bind_user(&UserId::from("alice")).unwrap();
        conn.bind_user(&UserId::from("alice")).unwrap();
        assert_matches!(
            conn.bind_user(&UserId::from("bob")),
            Err(ConnectionError::UserMismatch { .. })
        );
        assert_eq!(conn.user_id(), Some(UserId::from("alice")));
    }

    #[test]
    fn unanswered_pings_accumulate_until_pong() {
        let (conn, _rx) = make_connection(8);
        assert_eq!(conn.begin_beat(), 0);
        assert!(conn.send_ping());
        assert!(conn.last_ping().is_some());
        assert_eq!(conn.begin_beat(), 1);
        assert!(conn.send_ping());
        assert_eq!(conn.begin_beat(), 2);
        conn.record_pong();
        assert_eq!(conn.missed_beats(), 0);
        assert!(conn.last_pong().is_some());
        assert_eq!(conn.begin_beat(), 0);
    }
}
