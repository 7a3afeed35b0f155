//! Heartbeat ping/pong liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::connection::ClientConnection;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// More than `max_missed` consecutive pings went unanswered.
    TimedOut,
    /// The heartbeat was cancelled externally.
    Cancelled,
}

/// Ping the connection every `interval` until it stops answering.
///
/// Each tick first counts the previous ping as missed if no pong arrived,
/// then sends a new ping. Once the missed count exceeds `max_missed` the
/// loop returns [`HeartbeatResult::TimedOut`] without pinging again.
pub async fn run_heartbeat(
    connection: Arc<ClientConnection>,
    interval: Duration,
    max_missed: u32,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
            _ = ticker.tick() => {
                let missed = connection.begin_beat();
                if missed > max_missed {
                    return HeartbeatResult::TimedOut;
                }
                if !connection.send_ping() {
                    debug!(connection_id = %connection.id(), missed, "ping not queued");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::Outbound;
    use conduit_core::ids::ConnectionId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn make_connection() -> (Arc<ClientConnection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(32);
        (Arc::new(ClientConnection::new(ConnectionId::from("hb"), tx)), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_pings_time_out() {
        let (conn, _rx) = make_connection();
        let started = time::Instant::now();
        let result = run_heartbeat(
            Arc::clone(&conn),
            Duration::from_secs(10),
            2,
            CancellationToken::new(),
        )
        .await;
        assert_eq!(result, HeartbeatResult::TimedOut);
        assert_eq!(conn.missed_beats(), 3);
        // Pings at 10s, 20s, 30s; the 40s tick finds the third unanswered.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(40) && elapsed < Duration::from_secs(41));
    }

    #[tokio::test(start_paused = true)]
    async fn answered_pings_keep_the_connection() {
        let (conn, mut rx) = make_connection();
        let cancel = CancellationToken::new();
        let pings = Arc::new(AtomicUsize::new(0));
        let responder = {
            let conn = Arc::clone(&conn);
            let pings = Arc::clone(&pings);
            tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    if frame == Outbound::Ping {
                        conn.record_pong();
                        let _ = pings.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        };

        let heartbeat = tokio::spawn(run_heartbeat(
            Arc::clone(&conn),
            Duration::from_secs(10),
            1,
            cancel.clone(),
        ));
        time::sleep(Duration::from_secs(95)).await;
        cancel.cancel();
        assert_eq!(heartbeat.await.unwrap(), HeartbeatResult::Cancelled);
        assert_eq!(conn.missed_beats(), 0);
        assert_eq!(pings.load(Ordering::SeqCst), 9);
        responder.abort();
    }

    #[tokio::test]
    async fn cancel_before_first_ping() {
        let (conn, _rx) = make_connection();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_heartbeat(conn, Duration::from_secs(60), 1, cancel).await;
        assert_eq!(result, HeartbeatResult::Cancelled);
    }
}
