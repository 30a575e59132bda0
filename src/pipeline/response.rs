//! The cancellable unit of AI work for one response.
//!
//! A response generates text (possibly across several tool rounds), chunks it
//! into sentences, synthesizes each chunk and forwards the audio to the main
//! coordinator tagged with its response id. Every suspension point races the
//! response's [`CancellationToken`], so barge-in takes effect at the next
//! await.

use crate::agents::AgentDescriptor;
use crate::capabilities::{
    Capabilities, ChatMessage, GenerationEvent, GenerationRequest, ToolInvocation, ToolSchema,
};
use crate::config::ProcessorConfig;
use crate::error::{ParleyError, Result, error_codes};
use crate::handoff::HandoffRequest;
use crate::pipeline::chunker::SentenceChunker;
use crate::pipeline::messages::ProcessorMessage;
use futures_util::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a response task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    Running,
    Cancelled,
    Completed,
    Failed,
}

impl ResponseState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// How a response ended.
#[derive(Debug)]
pub enum OutcomeKind {
    Completed,
    /// The agent invoked a hand-off trigger.
    Handoff(HandoffRequest),
    Cancelled,
    /// The response failed; the fallback utterance was attempted.
    Failed(ParleyError),
}

impl OutcomeKind {
    pub fn state(&self) -> ResponseState {
        match self {
            Self::Completed | Self::Handoff(_) => ResponseState::Completed,
            Self::Cancelled => ResponseState::Cancelled,
            Self::Failed(_) => ResponseState::Failed,
        }
    }
}

/// Result of a finished response task.
#[derive(Debug)]
pub struct ResponseOutcome {
    pub response_id: u64,
    pub kind: OutcomeKind,
    /// Messages produced by the response, in order, for the agent's history.
    pub messages: Vec<ChatMessage>,
    pub first_audio_at: Option<Instant>,
}

/// What a response should do.
#[derive(Debug, Clone)]
pub struct ResponsePlan {
    pub agent: Arc<AgentDescriptor>,
    /// Rendered agent instructions.
    pub instructions: String,
    /// Conversation up to and including the message being answered.
    pub history: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
    /// Speak this text verbatim instead of generating.
    pub fixed_text: Option<String>,
}

impl ResponsePlan {
    /// A generated reply.
    pub fn generate(
        agent: Arc<AgentDescriptor>,
        instructions: String,
        history: Vec<ChatMessage>,
        tools: Vec<ToolSchema>,
    ) -> Self {
        Self {
            agent,
            instructions,
            history,
            tools,
            fixed_text: None,
        }
    }

    /// A fixed utterance in `agent`'s voice.
    pub fn speak(agent: Arc<AgentDescriptor>, text: impl Into<String>) -> Self {
        Self {
            agent,
            instructions: String::new(),
            history: Vec::new(),
            tools: Vec::new(),
            fixed_text: Some(text.into()),
        }
    }
}

/// Handle to a spawned response task.
pub struct ResponseHandle {
    response_id: u64,
    cancel: CancellationToken,
    state_tx: Arc<watch::Sender<ResponseState>>,
    task: JoinHandle<ResponseOutcome>,
    outbound: mpsc::UnboundedSender<ProcessorMessage>,
}

impl ResponseHandle {
    /// Spawn a response and register its cancellation token with the
    /// coordinator.
    pub fn spawn(
        response_id: u64,
        plan: ResponsePlan,
        capabilities: Capabilities,
        config: ProcessorConfig,
        outbound: mpsc::UnboundedSender<ProcessorMessage>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (state_tx, _) = watch::channel(ResponseState::Running);
        let state_tx = Arc::new(state_tx);
        let _ = outbound.send(ProcessorMessage::ResponseStarted {
            response_id,
            cancel: cancel.clone(),
        });

        let run = ResponseRun {
            response_id,
            plan,
            capabilities,
            config,
            cancel: cancel.clone(),
            outbound: outbound.clone(),
            messages: Vec::new(),
            text: String::new(),
            chunker: SentenceChunker::new(),
            audio_frames: 0,
            first_audio_at: None,
        };
        let task_state = Arc::clone(&state_tx);
        let task_outbound = outbound.clone();
        let task = tokio::spawn(async move {
            let outcome = run.run().await;
            task_state.send_replace(outcome.kind.state());
            let _ = task_outbound.send(ProcessorMessage::ResponseFinished { response_id });
            outcome
        });

        Self {
            response_id,
            cancel,
            state_tx,
            task,
            outbound,
        }
    }

    pub fn response_id(&self) -> u64 {
        self.response_id
    }

    pub fn state(&self) -> ResponseState {
        *self.state_tx.borrow()
    }

    /// Watch the state, e.g. to await a terminal state in tests.
    pub fn subscribe(&self) -> watch::Receiver<ResponseState> {
        self.state_tx.subscribe()
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the task to finish. Cancel-safe; must not be called again
    /// once it has returned.
    pub async fn join(&mut self) -> ResponseOutcome {
        match (&mut self.task).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.state_tx.send_replace(ResponseState::Failed);
                let _ = self.outbound.send(ProcessorMessage::ResponseFinished {
                    response_id: self.response_id,
                });
                ResponseOutcome {
                    response_id: self.response_id,
                    kind: OutcomeKind::Failed(ParleyError::Fatal(format!(
                        "response task ended abnormally: {e}"
                    ))),
                    messages: Vec::new(),
                    first_audio_at: None,
                }
            }
        }
    }

    /// Cancel and wait up to `grace` for acknowledgement.
    ///
    /// Returns `None` when the task had to be abandoned; it is aborted and
    /// marked cancelled.
    pub async fn cancel_and_wait(mut self, grace: Duration) -> Option<ResponseOutcome> {
        self.cancel.cancel();
        if let Ok(outcome) = tokio::time::timeout(grace, self.join()).await {
            return Some(outcome);
        }
        warn!(
            response_id = self.response_id,
            grace_ms = grace.as_millis() as u64,
            "response did not acknowledge cancellation in time, abandoning"
        );
        self.task.abort();
        self.state_tx.send_replace(ResponseState::Cancelled);
        let _ = self.outbound.send(ProcessorMessage::ResponseFinished {
            response_id: self.response_id,
        });
        None
    }
}

struct ResponseRun {
    response_id: u64,
    plan: ResponsePlan,
    capabilities: Capabilities,
    config: ProcessorConfig,
    cancel: CancellationToken,
    outbound: mpsc::UnboundedSender<ProcessorMessage>,
    messages: Vec<ChatMessage>,
    /// Assistant text of the current generation round.
    text: String,
    chunker: SentenceChunker,
    audio_frames: u64,
    first_audio_at: Option<Instant>,
}

impl ResponseRun {
    async fn run(mut self) -> ResponseOutcome {
        let result = match self.plan.fixed_text.take() {
            Some(text) => self.speak_fixed(text).await.map(|()| None),
            None => self.converse().await,
        };

        let kind = match result {
            Ok(None) => OutcomeKind::Completed,
            Ok(Some(request)) => OutcomeKind::Handoff(request),
            Err(e) if e.is_cancellation() => {
                self.seal_text();
                debug!(response_id = self.response_id, "response cancelled");
                OutcomeKind::Cancelled
            }
            Err(e) => {
                self.seal_text();
                warn!(
                    response_id = self.response_id,
                    agent = %self.plan.agent.name,
                    code = e.code(),
                    "response failed, speaking fallback: {e}"
                );
                self.speak_fallback().await;
                OutcomeKind::Failed(e)
            }
        };

        ResponseOutcome {
            response_id: self.response_id,
            kind,
            messages: self.messages,
            first_audio_at: self.first_audio_at,
        }
    }

    async fn speak_fixed(&mut self, text: String) -> Result<()> {
        self.text.push_str(&text);
        self.speak(&text).await?;
        self.seal_text();
        Ok(())
    }

    async fn speak_fallback(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let fallback = self.config.fallback_utterance.clone();
        match self.speak(&fallback).await {
            Ok(()) => self.messages.push(ChatMessage::assistant(fallback)),
            Err(e) => warn!(
                response_id = self.response_id,
                "fallback utterance could not be spoken: {e}"
            ),
        }
    }

    /// Generate until the agent answers without tools, hands off, or the
    /// tool round budget runs out.
    async fn converse(&mut self) -> Result<Option<HandoffRequest>> {
        let mut rounds = 0;
        loop {
            let calls = self.generate_round().await?;
            if calls.is_empty() {
                return Ok(None);
            }
            if rounds >= self.config.max_tool_rounds {
                return Err(ParleyError::Configuration(format!(
                    "agent '{}' exceeded {} tool rounds",
                    self.plan.agent.name, self.config.max_tool_rounds
                )));
            }
            rounds += 1;

            for call in calls {
                if let Some(trigger) = self.plan.agent.trigger_for(&call.name) {
                    let request = HandoffRequest::from_trigger(trigger, &call);
                    info!(
                        response_id = self.response_id,
                        from = %self.plan.agent.name,
                        to = %request.target_agent,
                        tool = %call.name,
                        "hand-off requested"
                    );
                    let ack = serde_json::json!({
                        "status": "transferring",
                        "target": request.target_agent,
                    });
                    let call_id = call.call_id.clone();
                    self.messages.push(ChatMessage::assistant_tool_call(call));
                    self.messages
                        .push(ChatMessage::tool_result(call_id, ack.to_string()));
                    return Ok(Some(request));
                }
                let result = self.invoke_tool(&call).await?;
                let call_id = call.call_id.clone();
                self.messages.push(ChatMessage::assistant_tool_call(call));
                self.messages
                    .push(ChatMessage::tool_result(call_id, result.to_string()));
            }
        }
    }

    /// One generation call, retried when it fails before any audio went out.
    async fn generate_round(&mut self) -> Result<Vec<ToolInvocation>> {
        let mut messages = self.plan.history.clone();
        messages.extend(self.messages.iter().cloned());
        let request = GenerationRequest {
            instructions: self.plan.instructions.clone(),
            messages,
            tools: self.plan.tools.clone(),
            model: self.plan.agent.model_config.clone(),
        };

        let mut attempt = 0;
        loop {
            let frames_before = self.audio_frames;
            match self.stream_round(request.clone()).await {
                Ok(calls) => return Ok(calls),
                Err(e)
                    if e.is_retryable()
                        && self.audio_frames == frames_before
                        && attempt < self.config.max_transient_retries =>
                {
                    attempt += 1;
                    self.text.clear();
                    self.chunker = SentenceChunker::new();
                    backoff(&self.cancel, &self.config, attempt, "generation", &e).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn stream_round(&mut self, request: GenerationRequest) -> Result<Vec<ToolInvocation>> {
        let limit = self.config.capability_timeout();
        let generator = Arc::clone(&self.capabilities.generator);
        let mut stream = bounded(
            &self.cancel,
            limit,
            "generation",
            generator.generate(request),
        )
        .await?;

        let mut calls = Vec::new();
        loop {
            let next = bounded(&self.cancel, limit, "generation stream", async {
                stream.next().await.transpose()
            })
            .await?;
            match next {
                None | Some(GenerationEvent::Done) => break,
                Some(GenerationEvent::TextDelta(delta)) => {
                    self.text.push_str(&delta);
                    for chunk in self.chunker.push(&delta) {
                        self.speak(&chunk.text).await?;
                    }
                }
                Some(GenerationEvent::ToolCall(call)) => calls.push(call),
            }
        }
        if let Some(chunk) = self.chunker.finish() {
            self.speak(&chunk.text).await?;
        }
        self.seal_text();
        Ok(calls)
    }

    async fn invoke_tool(&self, call: &ToolInvocation) -> Result<serde_json::Value> {
        if !self.plan.agent.tool_names.contains(&call.name) {
            return Err(ParleyError::Configuration(format!(
                "agent '{}' has no tool '{}'",
                self.plan.agent.name, call.name
            )));
        }
        let Some(invoker) = self.capabilities.tools.as_ref() else {
            return Err(ParleyError::Configuration(format!(
                "tool '{}' requested but no tool invoker is configured",
                call.name
            )));
        };
        let invoker = invoker.as_ref();
        debug!(response_id = self.response_id, tool = %call.name, "invoking tool");
        with_retry(&self.cancel, &self.config, "tool call", move || invoker.invoke(call)).await
    }

    /// Synthesize `text` and forward its audio.
    async fn speak(&mut self, text: &str) -> Result<()> {
        let synthesizer = Arc::clone(&self.capabilities.synthesizer);
        let voice = self.plan.agent.voice_config.clone();
        let mut audio = {
            let synthesizer = synthesizer.as_ref();
            let voice = &voice;
            with_retry(&self.cancel, &self.config, "synthesis", move || {
                synthesizer.synthesize(text, voice)
            })
            .await?
        };

        let limit = self.config.capability_timeout();
        loop {
            let next = bounded(&self.cancel, limit, "synthesis stream", async {
                audio.next().await.transpose()
            })
            .await?;
            let Some(payload) = next else { break };
            if payload.is_empty() {
                continue;
            }
            if self.first_audio_at.is_none() {
                self.first_audio_at = Some(Instant::now());
            }
            self.audio_frames += 1;
            self.outbound
                .send(ProcessorMessage::Audio {
                    response_id: self.response_id,
                    payload,
                })
                .map_err(|_| ParleyError::Channel("coordinator is gone".into()))?;
        }
        Ok(())
    }

    /// Move the current round's text into the message list.
    fn seal_text(&mut self) {
        let text = std::mem::take(&mut self.text);
        if !text.trim().is_empty() {
            self.messages.push(ChatMessage::assistant(text));
        }
    }
}

/// Race `fut` against cancellation and a per-call timeout.
async fn bounded<T>(
    cancel: &CancellationToken,
    limit: Duration,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ParleyError::Cancelled(format!("{what} cancelled"))),
        result = tokio::time::timeout(limit, fut) => match result {
            Ok(r) => r,
            Err(_) => Err(ParleyError::TransientCapability(format!(
                "{what} timed out after {}ms",
                limit.as_millis()
            ))),
        },
    }
}

/// [`bounded`], retrying transient failures with backoff.
async fn with_retry<T, F, Fut>(
    cancel: &CancellationToken,
    config: &ProcessorConfig,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match bounded(cancel, config.capability_timeout(), what, op()).await {
            Err(e) if e.is_retryable() && attempt < config.max_transient_retries => {
                attempt += 1;
                backoff(cancel, config, attempt, what, &e).await?;
            }
            other => return other,
        }
    }
}

async fn backoff(
    cancel: &CancellationToken,
    config: &ProcessorConfig,
    attempt: u32,
    what: &str,
    cause: &ParleyError,
) -> Result<()> {
    let delay = config.retry_delay(attempt);
    warn!(
        code = error_codes::TRANSIENT_CAPABILITY,
        attempt,
        delay_ms = delay.as_millis() as u64,
        "{what} failed, retrying: {cause}"
    );
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ParleyError::Cancelled(format!("{what} retry cancelled"))),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}
