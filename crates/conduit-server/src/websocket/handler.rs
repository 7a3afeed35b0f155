//! Command handling for one connection.

use std::sync::Arc;

use conduit_runtime::session::{ConnectionSink, DetachReason};
use conduit_runtime::{RuntimeError, StartRun};
use tracing::{debug, instrument, warn};

use super::connection::ClientConnection;
use super::manager::ConnectionManager;
use super::protocol::{replay_cursor, ClientCommand, ServerReply};
use crate::errors::ConnectionError;

/// Parse and execute one text frame. Failures become `error` replies.
pub fn handle_text(
    manager: &ConnectionManager,
    connection: &Arc<ClientConnection>,
    text: &str,
) -> ServerReply {
    let result = ClientCommand::parse(text).and_then(|command| handle_command(manager, connection, command));
    match result {
        Ok(reply) => reply,
        Err(err) => {
            debug!(connection_id = %connection.id(), code = err.code(), %err, "command rejected");
            ServerReply::from(&err)
        }
    }
}

/// Handle one text frame and queue its reply. A reply that cannot be
/// queued closes the connection with `send_failed`, as a failed event
/// delivery does, so the client learns to reconnect and resume.
pub fn respond(manager: &ConnectionManager, connection: &Arc<ClientConnection>, text: &str) -> bool {
    let reply = handle_text(manager, connection, text);
    if connection.send_json(&reply) {
        return true;
    }
    if !connection.is_closed() {
        warn!(connection_id = %connection.id(), "reply not queued, closing connection");
        connection.close(DetachReason::SendFailed);
    }
    false
}

/// Execute one command on behalf of `connection`.
#[instrument(skip_all, fields(connection_id = %connection.id(), command = command.kind()))]
pub fn handle_command(
    manager: &ConnectionManager,
    connection: &Arc<ClientConnection>,
    command: ClientCommand,
) -> Result<ServerReply, ConnectionError> {
    match command {
        ClientCommand::StartRun {
            user_id,
            thread_id,
            request,
            run_id,
        } => {
            if connection.user_id().as_ref() != Some(&user_id) {
                let _ = manager.attach(connection, &user_id, None)?;
            }
            let mut start = StartRun::new(user_id, thread_id, request);
            start.run_id = run_id;
            start.connection_id = Some(connection.id().clone());
            let started = manager.runtime().start_run(start)?;
            Ok(ServerReply::RunStarted {
                run_id: started.run_id,
                thread_id: started.thread_id,
                stages: started.stages,
            })
        }
        ClientCommand::Attach {
            user_id,
            last_seen_sequence,
            run_id,
        } => {
            let cursor = replay_cursor(last_seen_sequence, run_id);
            let report = manager.attach(connection, &user_id, cursor.as_ref())?;
            Ok(ServerReply::Attached {
                user_id,
                replayed: report.replayed,
                replaced: report.replaced,
            })
        }
        ClientCommand::CancelRun { run_id } => {
            let user_id = connection.user_id().ok_or(ConnectionError::NotAttached)?;
            let cancelled = manager.runtime().cancel_run(&user_id, &run_id)?;
            Ok(ServerReply::RunCancelled { run_id, cancelled })
        }
        ClientCommand::Ack { run_id, sequence } => {
            let user_id = connection.user_id().ok_or(ConnectionError::NotAttached)?;
            let session = manager
                .runtime()
                .registry()
                .get(&user_id)
                .ok_or(RuntimeError::SessionNotFound(user_id))?;
            if !session.acknowledge(&run_id, sequence) {
                return Err(RuntimeError::RunNotFound(run_id).into());
            }
            Ok(ServerReply::Acked { run_id, sequence })
        }
        ClientCommand::Ping => {
            connection.record_pong();
            Ok(ServerReply::Pong)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{make_runtime, TestAgent};
    use crate::websocket::connection::Outbound;
    use assert_matches::assert_matches;
    use conduit_core::ids::{RunId, UserId};
    use conduit_core::stage::StageKind;
    use tokio::sync::{mpsc, Notify};

    fn make_manager(gate: Arc<Notify>) -> ConnectionManager {
        let (runtime, _events) = make_runtime(vec![
            TestAgent::ok("triage", StageKind::Triage),
            TestAgent::gated("usage", StageKind::Data, gate),
        ]);
        ConnectionManager::new(runtime, 64)
    }

    fn connect(manager: &ConnectionManager) -> (Arc<ClientConnection>, mpsc::Receiver<Outbound>) {
        manager.register()
    }

    const START: &str = r#"{"type":"start_run","user_id":"alice","thread_id":"t1",
        "request":{"stages":["triage","usage"]},"run_id":"r1"}"#;

    #[tokio::test]
    async fn start_run_attaches_and_replies() {
        let manager = make_manager(Arc::new(Notify::new()));
        let (conn, _rx) = connect(&manager);
        let reply = handle_text(&manager, &conn, START);
        assert_eq!(
            reply,
            ServerReply::RunStarted {
                run_id: RunId::from("r1"),
                thread_id: "t1".into(),
                stages: vec!["triage".into(), "usage".into()],
            }
        );
        assert_eq!(conn.user_id(), Some(UserId::from("alice")));
        let run = manager
            .runtime()
            .registry()
            .find_run(&UserId::from("alice"), &RunId::from("r1"))
            .unwrap();
        assert_eq!(run.context().connection_id(), Some(conn.id()));
    }

    #[tokio::test]
    async fn duplicate_run_id_is_rejected() {
        let manager = make_manager(Arc::new(Notify::new()));
        let (conn, _rx) = connect(&manager);
        let _ = handle_text(&manager, &conn, START);
        assert_matches!(
            handle_text(&manager, &conn, START),
            ServerReply::Error { code, .. } if code == "duplicate_run"
        );
    }

    #[tokio::test]
    async fn unknown_stage_is_an_engine_construction_error() {
        let manager = make_manager(Arc::new(Notify::new()));
        let (conn, _rx) = connect(&manager);
        let reply = handle_text(
            &manager,
            &conn,
            r#"{"type":"start_run","user_id":"alice","thread_id":"t","request":{"stages":["ghost"]}}"#,
        );
        assert_matches!(reply, ServerReply::Error { code, .. } if code == "engine_construction");
    }

    #[tokio::test]
    async fn cancel_requires_attachment_and_ownership() {
        let manager = make_manager(Arc::new(Notify::new()));
        let (owner, _owner_rx) = connect(&manager);
        let (stranger, _stranger_rx) = connect(&manager);
        let _ = handle_text(&manager, &owner, START);

        let cancel = r#"{"type":"cancel_run","run_id":"r1"}"#;
        assert_matches!(
            handle_text(&manager, &stranger, cancel),
            ServerReply::Error { code, .. } if code == "not_attached"
        );
        let _ = handle_text(&manager, &stranger, r#"{"type":"attach","user_id":"mallory"}"#);
        assert_matches!(
            handle_text(&manager, &stranger, cancel),
            ServerReply::Error { code, .. } if code == "run_not_found"
        );

        assert_eq!(
            handle_text(&manager, &owner, cancel),
            ServerReply::RunCancelled {
                run_id: RunId::from("r1"),
                cancelled: true,
            }
        );
    }

    #[tokio::test]
    async fn ack_prunes_and_unknown_runs_fail() {
        let gate = Arc::new(Notify::new());
        let manager = make_manager(Arc::clone(&gate));
        let (conn, _rx) = connect(&manager);
        let _ = handle_text(&manager, &conn, START);

        assert_eq!(
            handle_text(&manager, &conn, r#"{"type":"ack","run_id":"r1","sequence":1}"#),
            ServerReply::Acked {
                run_id: RunId::from("r1"),
                sequence: 1,
            }
        );
        assert_matches!(
            handle_text(&manager, &conn, r#"{"type":"ack","run_id":"nope","sequence":1}"#),
            ServerReply::Error { code, .. } if code == "run_not_found"
        );
        gate.notify_one();
    }

    #[tokio::test]
    async fn ping_counts_as_pong() {
        let manager = make_manager(Arc::new(Notify::new()));
        let (conn, _rx) = connect(&manager);
        assert!(conn.send_ping());
        assert_eq!(conn.begin_beat(), 1);
        assert_eq!(handle_text(&manager, &conn, r#"{"type":"ping"}"#), ServerReply::Pong);
        assert_eq!(conn.missed_beats(), 0);
    }

    #[tokio::test]
    async fn unqueued_reply_closes_with_send_failed() {
        let (runtime, _events) = make_runtime(vec![TestAgent::ok("triage", StageKind::Triage)]);
        let manager = ConnectionManager::new(runtime, 1);
        let (conn, _rx) = manager.register();
        assert!(conn.send(Arc::new("filler".into())));

        assert!(!respond(&manager, &conn, r#"{"type":"ping"}"#));
        assert!(conn.is_closed());
        assert_eq!(conn.close_reason(), Some(DetachReason::SendFailed));
    }

    #[tokio::test]
    async fn queued_reply_keeps_connection_open() {
        let manager = make_manager(Arc::new(Notify::new()));
        let (conn, mut rx) = connect(&manager);
        assert!(respond(&manager, &conn, r#"{"type":"ping"}"#));
        assert!(!conn.is_closed());
        assert_matches!(rx.try_recv(), Ok(Outbound::Text(text)) if text.contains("pong"));
    }

    #[tokio::test]
    async fn garbage_is_an_invalid_command() {
        let manager = make_manager(Arc::new(Notify::new()));
        let (conn, _rx) = connect(&manager);
        assert_matches!(
            handle_text(&manager, &conn, "{"),
            ServerReply::Error { code, .. } if code == "invalid_command"
        );
    }
}
