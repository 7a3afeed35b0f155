//! Event bridge: turns run lifecycle transitions into sequence-numbered
//! envelopes and hands them to the connection layer over one channel.
//!
//! Each run has its own counter behind its own lock. The envelope is sent on
//! the channel while that lock is held, so the channel carries every run's
//! envelopes in sequence order even when several stages emit concurrently.

use std::sync::Arc;

use chrono::Utc;
use conduit_core::agent::ProgressReporter;
use conduit_core::context::ExecutionContext;
use conduit_core::events::{stage_payload, EventEnvelope, EventType};
use conduit_core::ids::{RunId, UserId};
use conduit_core::stage::StageKind;
use conduit_telemetry::metrics::EVENTS_EMITTED_TOTAL;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::errors::RuntimeError;

/// An envelope tagged with the user whose session should receive it.
#[derive(Clone, Debug)]
pub struct BridgedEnvelope {
    /// Owning user.
    pub user_id: UserId,
    /// The envelope.
    pub envelope: EventEnvelope,
}

struct RunStream {
    user_id: UserId,
    next_sequence: u64,
    closed: bool,
}

/// Sequence-assigning emitter shared by all runs of one runtime.
#[derive(Clone)]
pub struct EventBridge {
    streams: Arc<DashMap<RunId, Arc<Mutex<RunStream>>>>,
    tx: mpsc::UnboundedSender<BridgedEnvelope>,
}

impl EventBridge {
    /// Bridge plus the receiving end for the connection layer.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BridgedEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                streams: Arc::new(DashMap::new()),
                tx,
            },
            rx,
        )
    }

    /// Open the stream for a run. Sequence numbers start at 1.
    pub fn open_run(&self, context: &ExecutionContext) -> Result<RunEmitter, RuntimeError> {
        let run_id = context.run_id().clone();
        let stream = match self.streams.entry(run_id.clone()) {
            Entry::Occupied(_) => {
                return Err(RuntimeError::EngineConstruction {
                    run_id,
                    reason: "event stream already open".into(),
                });
            }
            Entry::Vacant(slot) => {
                let stream = Arc::new(Mutex::new(RunStream {
                    user_id: context.user_id().clone(),
                    next_sequence: 1,
                    closed: false,
                }));
                let _ = slot.insert(Arc::clone(&stream));
                stream
            }
        };
        debug!(%run_id, "event stream opened");
        Ok(RunEmitter {
            run_id,
            stream,
            tx: self.tx.clone(),
        })
    }

    /// Emit on an open run by id.
    pub fn emit(
        &self,
        run_id: &RunId,
        event_type: EventType,
        payload: Value,
    ) -> Result<EventEnvelope, RuntimeError> {
        let stream = self
            .streams
            .get(run_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| RuntimeError::RunNotFound(run_id.clone()))?;
        send(&stream, &self.tx, run_id, event_type, payload)
    }

    /// Close a run's stream. Later emits fail with `RunNotFound`.
    pub fn close_run(&self, run_id: &RunId) -> bool {
        match self.streams.remove(run_id) {
            Some((_, stream)) => {
                stream.lock().closed = true;
                debug!(%run_id, "event stream closed");
                true
            }
            None => false,
        }
    }

    /// Number of open streams.
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }
}

fn send(
    stream: &Mutex<RunStream>,
    tx: &mpsc::UnboundedSender<BridgedEnvelope>,
    run_id: &RunId,
    event_type: EventType,
    payload: Value,
) -> Result<EventEnvelope, RuntimeError> {
    let mut stream = stream.lock();
    if stream.closed {
        return Err(RuntimeError::RunNotFound(run_id.clone()));
    }
    let envelope = EventEnvelope {
        event_type,
        run_id: run_id.clone(),
        payload,
        sequence_number: stream.next_sequence,
        timestamp: Utc::now(),
    };
    stream.next_sequence += 1;
    if tx
        .send(BridgedEnvelope {
            user_id: stream.user_id.clone(),
            envelope: envelope.clone(),
        })
        .is_err()
    {
        debug!(%run_id, "event receiver gone, envelope not forwarded");
    }
    counter!(EVENTS_EMITTED_TOTAL, "type" => event_type.as_str()).increment(1);
    trace!(%run_id, seq = envelope.sequence_number, ty = event_type.as_str(), "event emitted");
    Ok(envelope)
}

/// Emitter bound to one run's stream.
#[derive(Clone)]
pub struct RunEmitter {
    run_id: RunId,
    stream: Arc<Mutex<RunStream>>,
    tx: mpsc::UnboundedSender<BridgedEnvelope>,
}

impl RunEmitter {
    /// Run this emitter is bound to.
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Assign the next sequence number and forward.
    pub fn emit(&self, event_type: EventType, payload: Value) -> Result<EventEnvelope, RuntimeError> {
        send(&self.stream, &self.tx, &self.run_id, event_type, payload)
    }

    /// Emit a stage event whose payload carries `agent_name` and `stage_kind`.
    pub fn emit_stage(
        &self,
        event_type: EventType,
        agent_name: &str,
        stage_kind: StageKind,
        extra: Value,
    ) -> Result<EventEnvelope, RuntimeError> {
        self.emit(event_type, stage_payload(agent_name, stage_kind, extra))
    }
}

/// Progress reporter handed to one running stage.
pub struct StageProgress {
    emitter: RunEmitter,
    agent_name: String,
    stage_kind: StageKind,
}

impl StageProgress {
    /// Reporter for `agent_name`.
    pub fn new(emitter: RunEmitter, agent_name: String, stage_kind: StageKind) -> Self {
        Self {
            emitter,
            agent_name,
            stage_kind,
        }
    }

    fn report(&self, event_type: EventType, extra: Value) {
        if let Err(err) = self
            .emitter
            .emit_stage(event_type, &self.agent_name, self.stage_kind, extra)
        {
            debug!(agent = %self.agent_name, %err, "progress event dropped");
        }
    }
}

impl ProgressReporter for StageProgress {
    fn thinking(&self, message: &str) {
        self.report(EventType::AgentThinking, json!({ "message": message }));
    }

    fn partial(&self, data: Value) {
        self.report(EventType::PartialResult, json!({ "data": data }));
    }
}
