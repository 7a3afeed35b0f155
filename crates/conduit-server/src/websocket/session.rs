//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use conduit_runtime::session::{ConnectionSink, DetachReason};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use super::connection::{ClientConnection, Outbound};
use super::handler::respond;
use super::heartbeat::{run_heartbeat, HeartbeatResult};
use super::manager::ConnectionManager;

/// Heartbeat tuning for one session.
#[derive(Clone, Copy, Debug)]
pub struct HeartbeatPolicy {
    /// Time between pings.
    pub interval: Duration,
    /// Unanswered pings tolerated before eviction.
    pub max_missed_beats: u32,
}

/// WebSocket close code sent for each detach reason.
pub fn close_code_for(reason: DetachReason) -> u16 {
    match reason {
        DetachReason::ClientClosed | DetachReason::Replaced => close_code::NORMAL,
        DetachReason::Reclaimed | DetachReason::Shutdown => close_code::AWAY,
        DetachReason::HeartbeatTimeout => close_code::POLICY,
        DetachReason::SendFailed => close_code::AGAIN,
        DetachReason::Dropped => close_code::ERROR,
    }
}

/// Serve a registered connection until it closes.
///
/// 1. Spawns the writer, which drains the outbound queue onto the socket
/// 2. Spawns the heartbeat, which evicts the connection when pings go
///    unanswered
/// 3. Handles inbound text frames as commands, replying on the same queue
/// 4. Detaches from the session on the way out; runs keep executing
#[instrument(skip_all, fields(connection_id = %connection.id()))]
pub async fn run_ws_session(
    ws: WebSocket,
    manager: Arc<ConnectionManager>,
    connection: Arc<ClientConnection>,
    outbound: mpsc::Receiver<Outbound>,
    heartbeat: HeartbeatPolicy,
) {
    let (ws_tx, mut ws_rx) = ws.split();
    let cancel = connection.cancellation();
    info!("client connected");

    let writer = tokio::spawn(write_frames(ws_tx, outbound, Arc::clone(&connection)));
    let pinger = {
        let manager = Arc::clone(&manager);
        let connection = Arc::clone(&connection);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = run_heartbeat(
                Arc::clone(&connection),
                heartbeat.interval,
                heartbeat.max_missed_beats,
                cancel,
            )
            .await;
            if result == HeartbeatResult::TimedOut {
                manager.evict(&connection);
            }
        })
    };

    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = ws_rx.next() => frame,
        };
        let text = match frame {
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    debug!(len = data.len(), "non-UTF8 binary frame ignored");
                    continue;
                }
            },
            Some(Ok(Message::Pong(_))) => {
                connection.record_pong();
                continue;
            }
            // Answered by the transport.
            Some(Ok(Message::Ping(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                connection.close(DetachReason::ClientClosed);
                break;
            }
            Some(Err(err)) => {
                debug!(%err, "websocket read failed");
                connection.close(DetachReason::Dropped);
                break;
            }
        };

        if !respond(&manager, &connection, &text) {
            break;
        }
    }

    let reason = connection.close_reason().unwrap_or(DetachReason::Dropped);
    manager.disconnect(connection.id(), reason);
    pinger.abort();
    let _ = writer.await;
    info!(
        reason = reason.as_str(),
        duration_ms = u64::try_from(connection.age().as_millis()).unwrap_or(u64::MAX),
        dropped = connection.drop_count(),
        "client disconnected"
    );
}

/// Forward queued frames to the socket until the connection closes, then
/// send a close frame carrying the reason.
async fn write_frames(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    connection: Arc<ClientConnection>,
) {
    let cancel = connection.cancellation();
    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            frame = outbound.recv() => frame,
        };
        let message = match frame {
            Some(Outbound::Text(text)) => Message::Text(Arc::unwrap_or_clone(text).into()),
            Some(Outbound::Ping) => Message::Ping(Bytes::new()),
            None => break,
        };
        if ws_tx.send(message).await.is_err() {
            connection.close(DetachReason::Dropped);
            return;
        }
    }

    let reason = connection.close_reason().unwrap_or(DetachReason::Dropped);
    let frame = CloseFrame {
        code: close_code_for(reason),
        reason: Utf8Bytes::from_static(reason.as_str()),
    };
    let _ = ws_tx.send(Message::Close(Some(frame))).await;
}
