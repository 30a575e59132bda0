//! Runtime events emitted for telemetry and the hand-off audit trail.
//!
//! Events are lightweight and sent on a `broadcast` channel so emitting never
//! blocks the turn loop or the coordinator. Lagging subscribers lose events.

use crate::agents::HandoffVisibility;
use tokio::sync::broadcast;

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The caller's connection closed.
    ConnectionClosed,
    /// Recognition failed beyond its re-initialization budget.
    RecognitionFatal(String),
    /// The host requested shutdown.
    Shutdown,
}

/// What the session is doing "right now".
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    SessionStarted {
        session_id: String,
        agent: String,
        rehydrated: bool,
    },
    TurnStarted {
        turn_id: u64,
        agent: String,
        text: String,
    },
    TurnCompleted {
        turn_id: u64,
        agent: String,
        /// Enqueue-to-first-audio latency.
        latency_ms: Option<u64>,
    },
    /// Barge-in or a newer turn cut the response short.
    TurnCancelled { turn_id: u64 },
    /// The turn failed; a fallback utterance was spoken.
    TurnFailed {
        turn_id: u64,
        code: &'static str,
        message: String,
    },
    /// The queue overflowed and this turn was dropped unprocessed.
    TurnDropped { turn_id: u64 },
    InterruptionRequested { response_id: Option<u64> },
    HandoffCompleted {
        from: String,
        to: String,
        visibility: HandoffVisibility,
        reason: String,
    },
    HandoffRejected { target: String, message: String },
    AgentVisited { agent: String },
    CycleDetected {
        agents: (String, String),
        swaps: usize,
    },
    PersistenceFailed { message: String },
    SessionEnded { reason: EndReason },
}

/// Best-effort send on an optional runtime channel.
pub(crate) fn emit(tx: Option<&broadcast::Sender<RuntimeEvent>>, event: RuntimeEvent) {
    if let Some(tx) = tx {
        let _ = tx.send(event);
    }
}
