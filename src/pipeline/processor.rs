//! The turn processor: serializes all AI work for a session.
//!
//! Single consumer of the turn queue and single writer of session state. At
//! most one response task runs at a time; a new turn cancels the previous
//! response (bounded by the cancel grace) before its own response starts.

use crate::agents::template::render;
use crate::agents::{AgentDescriptor, AgentRegistry, HandoffVisibility};
use crate::capabilities::{Capabilities, ChatMessage, ToolSchema};
use crate::config::{ParleyConfig, ProcessorConfig};
use crate::error::ParleyError;
use crate::handoff::{HandoffRequest, HandoffResolver};
use crate::pipeline::interruption::InterruptionHandle;
use crate::pipeline::messages::{ProcessorMessage, Turn};
use crate::pipeline::response::{OutcomeKind, ResponseHandle, ResponseOutcome, ResponsePlan};
use crate::pipeline::turn_queue::TurnReceiver;
use crate::runtime::{RuntimeEvent, emit};
use crate::session::SessionStateStore;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the processor hands back when it stops.
pub struct ProcessorReport {
    pub session: SessionStateStore,
    /// Turns dequeued and started.
    pub turns_processed: u64,
    pub turns_completed: u64,
    pub turns_cancelled: u64,
    pub turns_failed: u64,
    pub handoffs: u64,
}

/// Why a response is running.
enum Role {
    /// Answering `turn` as `agent`.
    Reply { turn: Turn, agent: String },
    /// An announced agent introducing itself, optionally followed by an
    /// answer to the turn that triggered the hand-off.
    Introduction { agent: String, follow_up: Option<Turn> },
    /// Apologizing for a failed turn.
    Fallback { agent: String },
}

struct Active {
    handle: ResponseHandle,
    role: Role,
    /// Earliest audio of the turn this response belongs to.
    first_audio_at: Option<Instant>,
}

pub struct TurnProcessor {
    registry: Arc<AgentRegistry>,
    capabilities: Capabilities,
    config: ProcessorConfig,
    announcement_prompt: String,
    session: SessionStateStore,
    resolver: HandoffResolver,
    interruption: InterruptionHandle,
    outbound: mpsc::UnboundedSender<ProcessorMessage>,
    runtime_tx: Option<broadcast::Sender<RuntimeEvent>>,
    next_response_id: u64,
    turns_processed: u64,
    turns_completed: u64,
    turns_cancelled: u64,
    turns_failed: u64,
    handoffs: u64,
}

impl TurnProcessor {
    pub fn new(
        registry: Arc<AgentRegistry>,
        capabilities: Capabilities,
        config: &ParleyConfig,
        session: SessionStateStore,
        interruption: InterruptionHandle,
        outbound: mpsc::UnboundedSender<ProcessorMessage>,
        runtime_tx: Option<broadcast::Sender<RuntimeEvent>>,
    ) -> Self {
        let resolver = HandoffResolver::new(
            Arc::clone(&registry),
            config.handoff.clone(),
            runtime_tx.clone(),
        );
        Self {
            registry,
            capabilities,
            config: config.processor.clone(),
            announcement_prompt: config.handoff.announcement_prompt.clone(),
            session,
            resolver,
            interruption,
            outbound,
            runtime_tx,
            next_response_id: 0,
            turns_processed: 0,
            turns_completed: 0,
            turns_cancelled: 0,
            turns_failed: 0,
            handoffs: 0,
        }
    }

    /// Process turns until the queue closes or `shutdown` fires.
    pub async fn run(
        mut self,
        mut queue: TurnReceiver,
        shutdown: CancellationToken,
    ) -> ProcessorReport {
        let mut active: Option<Active> = None;

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                outcome = wait_active(&mut active) => {
                    if let Some(done) = active.take() {
                        active = self.finish(done.role, done.first_audio_at, outcome, true);
                    }
                }
                turn = queue.dequeue() => match turn {
                    Some(turn) => {
                        if let Some(prev) = active.take() {
                            self.supersede(prev, false).await;
                        }
                        active = Some(self.start_turn(turn));
                    }
                    None => break,
                },
            }
        }

        if let Some(prev) = active.take() {
            self.supersede(prev, true).await;
        }
        info!(
            session_id = %self.session.read().session_id,
            turns = self.turns_processed,
            handoffs = self.handoffs,
            "turn processor stopped"
        );
        ProcessorReport {
            session: self.session,
            turns_processed: self.turns_processed,
            turns_completed: self.turns_completed,
            turns_cancelled: self.turns_cancelled,
            turns_failed: self.turns_failed,
            handoffs: self.handoffs,
        }
    }

    fn start_turn(&mut self, turn: Turn) -> Active {
        self.turns_processed += 1;
        let agent = self.current_agent();
        let text = turn.text().to_owned();
        self.session.mutate(|s| {
            s.interruption_flag = false;
            s.history_mut(&agent.name).push(ChatMessage::user(text.clone()));
        });
        info!(turn_id = turn.turn_id, agent = %agent.name, "turn started");
        emit(
            self.runtime_tx.as_ref(),
            RuntimeEvent::TurnStarted {
                turn_id: turn.turn_id,
                agent: agent.name.clone(),
                text,
            },
        );
        self.spawn_reply(turn, None)
    }

    /// Retire the running response because a newer turn arrived or the
    /// session is ending.
    ///
    /// Replies are cancelled within the grace period. An introduction is
    /// uninterruptible, so unless `cancel_introductions` is set it is allowed
    /// to finish first.
    async fn supersede(&mut self, mut prev: Active, cancel_introductions: bool) {
        let response_id = prev.handle.response_id();
        let outcome = if !cancel_introductions && matches!(prev.role, Role::Introduction { .. }) {
            debug!(response_id, "letting introduction finish before the next turn");
            Some(prev.handle.join().await)
        } else {
            debug!(response_id, "cancelling previous response");
            let _ = self
                .outbound
                .send(ProcessorMessage::ResponseCancelled { response_id });
            prev.handle.cancel_and_wait(self.config.cancel_grace()).await
        };
        let outcome = outcome.unwrap_or(ResponseOutcome {
            response_id,
            kind: OutcomeKind::Cancelled,
            messages: Vec::new(),
            first_audio_at: None,
        });
        let _ = self.finish(prev.role, prev.first_audio_at, outcome, false);
    }

    /// Fold a finished response into session state. With `chain` set, the
    /// follow-up work (introduction, hand-off reply, fallback) is started and
    /// returned.
    fn finish(
        &mut self,
        role: Role,
        first_audio_at: Option<Instant>,
        outcome: ResponseOutcome,
        chain: bool,
    ) -> Option<Active> {
        let first_audio_at = first_audio_at.or(outcome.first_audio_at);
        match role {
            Role::Reply { turn, agent } => {
                self.append_history(&agent, outcome.messages);
                match outcome.kind {
                    OutcomeKind::Completed => {
                        self.complete_turn(&turn, &agent, first_audio_at);
                        None
                    }
                    OutcomeKind::Cancelled => {
                        self.cancel_turn(&turn);
                        None
                    }
                    OutcomeKind::Failed(e) => {
                        self.fail_turn(&turn, &e);
                        None
                    }
                    OutcomeKind::Handoff(request) => {
                        self.hand_off(turn, request, first_audio_at, chain)
                    }
                }
            }
            Role::Introduction { agent, follow_up } => {
                self.interruption.allow();
                self.append_history(&agent, outcome.messages);
                let turn = follow_up?;
                match outcome.kind {
                    OutcomeKind::Completed | OutcomeKind::Handoff(_) if chain => {
                        Some(self.spawn_reply(turn, first_audio_at))
                    }
                    OutcomeKind::Failed(e) => {
                        self.fail_turn(&turn, &e);
                        None
                    }
                    _ => {
                        self.cancel_turn(&turn);
                        None
                    }
                }
            }
            Role::Fallback { agent } => {
                self.append_history(&agent, outcome.messages);
                self.session.persist_async();
                None
            }
        }
    }

    fn hand_off(
        &mut self,
        turn: Turn,
        request: HandoffRequest,
        first_audio_at: Option<Instant>,
        chain: bool,
    ) -> Option<Active> {
        self.session.mutate(|s| s.pending_handoff = Some(request));
        let outcome = match self.resolver.resolve(&mut self.session) {
            Ok(outcome) => outcome,
            Err(e) => {
                let agent = self.current_agent();
                self.fail_turn(&turn, &e);
                if !chain {
                    return None;
                }
                let plan = ResponsePlan::speak(Arc::clone(&agent), self.config.fallback_utterance.clone());
                return Some(self.spawn(
                    Role::Fallback {
                        agent: agent.name.clone(),
                    },
                    plan,
                    first_audio_at,
                ));
            }
        };
        self.handoffs += 1;

        if outcome.immediate && !outcome.share_context {
            let text = turn.text().to_owned();
            self.session
                .mutate(|s| s.history_mut(&outcome.to).push(ChatMessage::user(text)));
        }
        self.session.persist_async();

        if !chain {
            self.cancel_turn(&turn);
            return None;
        }

        let follow_up = if outcome.immediate {
            Some(turn)
        } else {
            self.complete_turn(&turn, &outcome.from, first_audio_at);
            None
        };
        match (outcome.visibility, follow_up) {
            (HandoffVisibility::Announced, follow_up) => {
                self.interruption.suppress();
                Some(self.spawn_introduction(follow_up, first_audio_at))
            }
            (HandoffVisibility::Discrete, Some(turn)) => Some(self.spawn_reply(turn, first_audio_at)),
            (HandoffVisibility::Discrete, None) => None,
        }
    }

    fn spawn_reply(&mut self, turn: Turn, first_audio_at: Option<Instant>) -> Active {
        let agent = self.current_agent();
        let state = self.session.read();
        let instructions = render(&agent.prompt_template, &state.template_vars());
        let history = state.history(&agent.name).to_vec();
        let tools = self.tool_schemas(&agent);
        let plan = ResponsePlan::generate(Arc::clone(&agent), instructions, history, tools);
        self.spawn(
            Role::Reply {
                turn,
                agent: agent.name.clone(),
            },
            plan,
            first_audio_at,
        )
    }

    fn spawn_introduction(&mut self, follow_up: Option<Turn>, first_audio_at: Option<Instant>) -> Active {
        let agent = self.current_agent();
        let state = self.session.read();
        let vars = state.template_vars();
        let plan = match &agent.introduction {
            Some(template) => ResponsePlan::speak(Arc::clone(&agent), render(template, &vars)),
            None => {
                let mut history = state.history(&agent.name).to_vec();
                history.push(ChatMessage::user(self.announcement_prompt.clone()));
                ResponsePlan::generate(
                    Arc::clone(&agent),
                    render(&agent.prompt_template, &vars),
                    history,
                    Vec::new(),
                )
            }
        };
        debug!(agent = %agent.name, "introducing agent, barge-in suppressed");
        self.spawn(
            Role::Introduction {
                agent: agent.name.clone(),
                follow_up,
            },
            plan,
            first_audio_at,
        )
    }

    fn spawn(&mut self, role: Role, plan: ResponsePlan, first_audio_at: Option<Instant>) -> Active {
        self.next_response_id += 1;
        let handle = ResponseHandle::spawn(
            self.next_response_id,
            plan,
            self.capabilities.clone(),
            self.config.clone(),
            self.outbound.clone(),
        );
        Active {
            handle,
            role,
            first_audio_at,
        }
    }

    /// Descriptor of the active agent, falling back to the entry point if the
    /// state names an agent the registry does not know.
    fn current_agent(&mut self) -> Arc<AgentDescriptor> {
        let name = self.session.read().active_agent.clone();
        if let Some(agent) = self.registry.get(&name) {
            return Arc::clone(agent);
        }
        let entry = self.registry.entry_point().to_owned();
        warn!(agent = %name, entry = %entry, "active agent is not registered, returning to entry point");
        self.session.mutate(|s| {
            s.active_agent = entry.clone();
            s.visited_agents.insert(entry.clone());
        });
        match self.registry.get(&entry) {
            Some(agent) => Arc::clone(agent),
            None => Arc::new(AgentDescriptor::new(entry, String::new())),
        }
    }

    /// Schemas advertised to `agent`'s generator: its hand-off triggers plus
    /// whichever business tools the invoker describes.
    fn tool_schemas(&self, agent: &AgentDescriptor) -> Vec<ToolSchema> {
        agent
            .tool_names
            .iter()
            .filter_map(|name| {
                if let Some(trigger) = agent.trigger_for(name) {
                    return Some(trigger.schema());
                }
                let schema = self
                    .capabilities
                    .tools
                    .as_ref()
                    .and_then(|tools| tools.schema(name));
                if schema.is_none() {
                    debug!(agent = %agent.name, tool = %name, "tool has no schema, not advertised");
                }
                schema
            })
            .collect()
    }

    fn append_history(&mut self, agent: &str, messages: Vec<ChatMessage>) {
        if messages.is_empty() {
            return;
        }
        self.session
            .mutate(|s| s.history_mut(agent).extend(messages));
    }

    fn complete_turn(&mut self, turn: &Turn, agent: &str, first_audio_at: Option<Instant>) {
        self.turns_completed += 1;
        let latency_ms = first_audio_at
            .map(|t| t.saturating_duration_since(turn.enqueued_at).as_millis() as u64);
        self.session.mutate(|s| {
            s.turns_completed += 1;
            if let Some(ms) = latency_ms {
                s.record_latency(ms);
            }
        });
        self.session.persist_async();
        info!(turn_id = turn.turn_id, agent, latency_ms, "turn completed");
        emit(
            self.runtime_tx.as_ref(),
            RuntimeEvent::TurnCompleted {
                turn_id: turn.turn_id,
                agent: agent.to_owned(),
                latency_ms,
            },
        );
    }

    fn cancel_turn(&mut self, turn: &Turn) {
        self.turns_cancelled += 1;
        self.session.mutate(|s| s.interruption_flag = true);
        self.session.persist_async();
        info!(turn_id = turn.turn_id, "turn cancelled");
        emit(
            self.runtime_tx.as_ref(),
            RuntimeEvent::TurnCancelled {
                turn_id: turn.turn_id,
            },
        );
    }

    fn fail_turn(&mut self, turn: &Turn, error: &ParleyError) {
        self.turns_failed += 1;
        self.session.persist_async();
        warn!(turn_id = turn.turn_id, code = error.code(), "turn failed: {error}");
        emit(
            self.runtime_tx.as_ref(),
            RuntimeEvent::TurnFailed {
                turn_id: turn.turn_id,
                code: error.code(),
                message: error.to_string(),
            },
        );
    }
}

/// Resolve when the active response finishes; pend forever when idle.
async fn wait_active(active: &mut Option<Active>) -> ResponseOutcome {
    match active {
        Some(a) => a.handle.join().await,
        None => std::future::pending().await,
    }
}
