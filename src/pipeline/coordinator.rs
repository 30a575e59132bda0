//! Per-session orchestrator that owns the caller's connection.
//!
//! The coordinator wires the three session contexts together: the
//! recognition worker, the turn processor and itself. It never waits on AI
//! work; everything it does per event is a channel send or a frame write, so
//! barge-in is serviced within one loop iteration.

use crate::agents::AgentRegistry;
use crate::capabilities::{Capabilities, SpeechRecognizer};
use crate::config::ParleyConfig;
use crate::error::{ParleyError, Result, error_codes};
use crate::pipeline::interruption::{InterruptionCoordinator, PartialOutcome};
use crate::pipeline::messages::{Directive, OutboundFrame, ProcessorMessage, SpeechEvent, Turn};
use crate::pipeline::processor::TurnProcessor;
use crate::pipeline::turn_queue::{EnqueueOutcome, TurnSender, turn_queue};
use crate::recognition::{RecognitionEvent, RecognitionWorker};
use crate::runtime::{EndReason, RuntimeEvent, emit};
use crate::session::types::SessionState;
use crate::session::{DurableStore, SessionStateStore};
use crate::transport::CallConnection;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a finished session looked like.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: String,
    /// Turns the processor started.
    pub turns_processed: u64,
    /// Turns dropped by the queue overflow policy.
    pub turns_dropped: u64,
    pub handoffs: u64,
    pub final_agent: String,
    pub end_reason: EndReason,
    /// Final session state, as flushed to the store.
    pub state: SessionState,
}

/// The response whose audio is currently allowed through.
struct CurrentResponse {
    response_id: u64,
    cancel: CancellationToken,
    cancelled: bool,
}

/// Runs sessions against a shared registry and capability set.
pub struct MainCoordinator {
    registry: Arc<AgentRegistry>,
    capabilities: Capabilities,
    config: ParleyConfig,
    store: Arc<dyn DurableStore>,
    runtime_tx: Option<broadcast::Sender<RuntimeEvent>>,
    cancel: CancellationToken,
}

impl MainCoordinator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        capabilities: Capabilities,
        config: ParleyConfig,
        store: Arc<dyn DurableStore>,
    ) -> Self {
        Self {
            registry,
            capabilities,
            config,
            store,
            runtime_tx: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Attach a runtime event broadcaster for telemetry and auditing.
    pub fn with_runtime_events(mut self, tx: broadcast::Sender<RuntimeEvent>) -> Self {
        self.runtime_tx = Some(tx);
        self
    }

    /// Token that ends the session when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one session until the caller hangs up, recognition fails for
    /// good, or the cancel token fires.
    ///
    /// # Errors
    ///
    /// Returns an error only if the turn processor task itself is lost.
    /// Capability, hand-off and persistence failures are absorbed.
    pub async fn run(
        self,
        session_id: &str,
        mut connection: Box<dyn CallConnection>,
        recognizer: Box<dyn SpeechRecognizer>,
    ) -> Result<SessionSummary> {
        let runtime_tx = self.runtime_tx.clone();
        let session = self.open_session(session_id).await;

        let (directive_tx, mut directive_rx) = mpsc::unbounded_channel::<Directive>();
        let (processor_tx, mut processor_rx) = mpsc::unbounded_channel::<ProcessorMessage>();
        let (turn_tx, turn_rx) = turn_queue(self.config.turn_queue.capacity);
        let mut interruption = InterruptionCoordinator::new(directive_tx);

        let processor = TurnProcessor::new(
            Arc::clone(&self.registry),
            self.capabilities.clone(),
            &self.config,
            session,
            interruption.handle(),
            processor_tx,
            runtime_tx.clone(),
        );
        let processor_cancel = self.cancel.child_token();
        let processor_handle = tokio::spawn(processor.run(turn_rx, processor_cancel.clone()));

        let (worker, mut events) = RecognitionWorker::spawn(
            recognizer,
            self.config.recognition.clone(),
            self.cancel.child_token(),
        );

        let mut loop_state = LoopState {
            turn_tx,
            next_turn_id: 0,
            current: None,
            stale_frames: 0,
            runtime_tx: runtime_tx.clone(),
        };

        let end_reason = loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break EndReason::Shutdown,
                Some(directive) = directive_rx.recv() => {
                    if let Err(reason) = loop_state.apply_directive(directive, connection.as_mut()).await {
                        break reason;
                    }
                }
                Some(msg) = processor_rx.recv() => {
                    if let Err(reason) = loop_state.on_processor_message(msg, &mut interruption, connection.as_mut()).await {
                        break reason;
                    }
                }
                event = events.next() => match event {
                    Some(RecognitionEvent::Partial(ev)) => {
                        if interruption.on_partial_signal(&ev.text) == PartialOutcome::Suppressed {
                            debug!(partial = %ev.text, "barge-in suppressed during introduction");
                        }
                    }
                    Some(RecognitionEvent::Final(ev)) => loop_state.enqueue(ev),
                    Some(RecognitionEvent::Fatal(message)) => {
                        break EndReason::RecognitionFatal(message);
                    }
                    None => break EndReason::RecognitionFatal("recognition stopped".into()),
                },
                chunk = connection.recv_audio() => match chunk {
                    Some(chunk) => {
                        let _ = worker.feed(chunk);
                    }
                    None => break EndReason::ConnectionClosed,
                },
            }
        };

        info!(session_id, reason = ?end_reason, "session ending");
        match &end_reason {
            EndReason::RecognitionFatal(message) => {
                error!(session_id, code = error_codes::FATAL, "recognition failed: {message}");
                connection
                    .close("Sorry, we're having trouble hearing you. Please call again.")
                    .await;
            }
            EndReason::Shutdown => connection.close("session ended").await,
            EndReason::ConnectionClosed => {}
        }

        worker.shutdown().await;
        let turns_dropped = loop_state.turn_tx.dropped_count();
        if loop_state.stale_frames > 0 {
            debug!(frames = loop_state.stale_frames, "dropped audio of superseded responses");
        }
        drop(loop_state);
        if matches!(end_reason, EndReason::Shutdown) {
            processor_cancel.cancel();
        }
        let report = processor_handle
            .await
            .map_err(|e| ParleyError::Fatal(format!("turn processor task failed: {e}")))?;
        drop(processor_rx);

        let (state, flushed) = report
            .session
            .close(self.config.persistence.flush_on_session_end)
            .await;
        if let Err(e) = flushed {
            warn!(session_id, code = e.code(), "final snapshot flush failed: {e}");
            emit(
                runtime_tx.as_ref(),
                RuntimeEvent::PersistenceFailed {
                    message: e.to_string(),
                },
            );
        }
        emit(
            runtime_tx.as_ref(),
            RuntimeEvent::SessionEnded {
                reason: end_reason.clone(),
            },
        );

        Ok(SessionSummary {
            session_id: session_id.to_owned(),
            turns_processed: report.turns_processed,
            turns_dropped,
            handoffs: report.handoffs,
            final_agent: state.active_agent.clone(),
            end_reason,
            state,
        })
    }

    /// Rehydrate (or create) the session and make sure it points at a
    /// registered agent.
    async fn open_session(&self, session_id: &str) -> SessionStateStore {
        let entry = self.registry.entry_point().to_owned();
        let mut session = SessionStateStore::rehydrate(
            Arc::clone(&self.store),
            session_id,
            &entry,
            self.runtime_tx.clone(),
        )
        .await;

        let active = session.read().active_agent.clone();
        if !self.registry.contains(&active) {
            warn!(
                session_id,
                agent = %active,
                entry = %entry,
                "snapshot names an unknown agent, resuming on entry point"
            );
            session.mutate(|s| {
                s.active_agent = entry.clone();
                s.visited_agents.insert(entry.clone());
            });
        }
        if session.read().pending_handoff.is_some() {
            debug!(session_id, "discarding hand-off left pending in snapshot");
            session.mutate(|s| s.pending_handoff = None);
        }

        let rehydrated = session.was_rehydrated();
        info!(
            session_id,
            agent = %session.read().active_agent,
            rehydrated,
            "session started"
        );
        emit(
            self.runtime_tx.as_ref(),
            RuntimeEvent::SessionStarted {
                session_id: session_id.to_owned(),
                agent: session.read().active_agent.clone(),
                rehydrated,
            },
        );
        session
    }
}

/// Mutable state of the coordinator loop.
struct LoopState {
    turn_tx: TurnSender,
    next_turn_id: u64,
    current: Option<CurrentResponse>,
    stale_frames: u64,
    runtime_tx: Option<broadcast::Sender<RuntimeEvent>>,
}

impl LoopState {
    fn enqueue(&mut self, utterance: SpeechEvent) {
        self.next_turn_id += 1;
        let turn = Turn::new(self.next_turn_id, utterance);
        debug!(turn_id = turn.turn_id, text = %turn.text(), "final utterance");
        match self.turn_tx.enqueue(turn) {
            EnqueueOutcome::Enqueued => {}
            EnqueueOutcome::DroppedOldest { dropped, error } => {
                debug!(turn_id = dropped.turn_id, code = error.code(), "{error}");
                emit(
                    self.runtime_tx.as_ref(),
                    RuntimeEvent::TurnDropped {
                        turn_id: dropped.turn_id,
                    },
                );
            }
            EnqueueOutcome::Closed(turn) => {
                warn!(turn_id = turn.turn_id, "turn processor gone, utterance discarded");
            }
        }
    }

    async fn apply_directive(
        &mut self,
        directive: Directive,
        connection: &mut dyn CallConnection,
    ) -> std::result::Result<(), EndReason> {
        match directive {
            Directive::CancelActiveResponse => {
                let response_id = match self.current.as_mut() {
                    Some(current) if !current.cancelled => {
                        current.cancel.cancel();
                        current.cancelled = true;
                        info!(response_id = current.response_id, "barge-in: response cancelled");
                        Some(current.response_id)
                    }
                    _ => {
                        debug!("barge-in with no active response");
                        None
                    }
                };
                emit(
                    self.runtime_tx.as_ref(),
                    RuntimeEvent::InterruptionRequested { response_id },
                );
                Ok(())
            }
            Directive::StopAudio => send_frame(connection, OutboundFrame::Stop).await,
        }
    }

    async fn on_processor_message(
        &mut self,
        msg: ProcessorMessage,
        interruption: &mut InterruptionCoordinator,
        connection: &mut dyn CallConnection,
    ) -> std::result::Result<(), EndReason> {
        match msg {
            ProcessorMessage::ResponseStarted {
                response_id,
                cancel,
            } => {
                interruption.arm();
                self.current = Some(CurrentResponse {
                    response_id,
                    cancel,
                    cancelled: false,
                });
                Ok(())
            }
            ProcessorMessage::ResponseCancelled { response_id } => {
                match self.current.as_mut() {
                    Some(current) if current.response_id == response_id && !current.cancelled => {
                        current.cancel.cancel();
                        current.cancelled = true;
                        info!(response_id, "superseded: response cancelled");
                        send_frame(connection, OutboundFrame::Stop).await
                    }
                    _ => Ok(()),
                }
            }
            ProcessorMessage::Audio {
                response_id,
                payload,
            } => {
                let live = self
                    .current
                    .as_ref()
                    .is_some_and(|c| c.response_id == response_id && !c.cancelled);
                if live {
                    send_frame(
                        connection,
                        OutboundFrame::Audio {
                            response_id,
                            payload,
                        },
                    )
                    .await
                } else {
                    self.stale_frames += 1;
                    Ok(())
                }
            }
            ProcessorMessage::ResponseFinished { response_id } => {
                if self
                    .current
                    .as_ref()
                    .is_some_and(|c| c.response_id == response_id)
                {
                    self.current = None;
                }
                Ok(())
            }
        }
    }
}

async fn send_frame(
    connection: &mut dyn CallConnection,
    frame: OutboundFrame,
) -> std::result::Result<(), EndReason> {
    let kind = frame.kind();
    connection.send(frame).await.map_err(|e| {
        warn!(kind, "outbound write failed, treating connection as closed: {e}");
        EndReason::ConnectionClosed
    })
}
