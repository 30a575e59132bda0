//! Shared fakes and session harness for integration tests.
//!
//! Capabilities are scripted so each test controls exactly what the caller
//! says, what the agent answers and how long every step takes.

use async_trait::async_trait;
use bytes::Bytes;
use parley::agents::{HandoffTrigger, VoiceConfig};
use parley::capabilities::{
    AudioStream, Capabilities, GenerationEvent, GenerationRequest, GenerationStream,
    SpeechRecognizer, SpeechSynthesizer, TextGenerator, ToolInvocation,
};
use parley::pipeline::messages::{AudioChunk, OutboundFrame, SpeechEvent};
use parley::session::DurableStore;
use parley::transport::{ChannelPeer, channel_connection};
use parley::{
    AgentDescriptor, AgentRegistry, HandoffVisibility, MainCoordinator, ParleyConfig,
    ParleyError, RuntimeEvent, SessionState, SessionSummary,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub(crate) const WAIT: Duration = Duration::from_secs(3);

// ─── Generation ─────────────────────────────────────────────────────────────

/// One scripted generation call.
#[derive(Debug, Clone)]
pub(crate) struct Round {
    events: Vec<GenerationEvent>,
    delay: Duration,
}

impl Round {
    /// A complete answer in one delta.
    pub(crate) fn text(text: &str) -> Self {
        Self {
            events: vec![GenerationEvent::TextDelta(text.to_owned())],
            delay: Duration::ZERO,
        }
    }

    /// An answer streamed delta by delta, `delay` apart.
    pub(crate) fn slow(deltas: &[&str], delay: Duration) -> Self {
        Self {
            events: deltas
                .iter()
                .map(|d| GenerationEvent::TextDelta((*d).to_owned()))
                .collect(),
            delay,
        }
    }

    /// The agent calls `tool` with a reason.
    pub(crate) fn tool_call(tool: &str, reason: &str) -> Self {
        Self {
            events: vec![GenerationEvent::ToolCall(ToolInvocation {
                call_id: format!("call-{tool}"),
                name: tool.to_owned(),
                arguments: serde_json::json!({ "reason": reason }),
            })],
            delay: Duration::ZERO,
        }
    }
}

/// Decrements the live-stream counter when a generation stream is dropped.
struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Replays scripted rounds and tracks how many streams are alive at once.
#[derive(Default)]
pub(crate) struct ScriptedGenerator {
    rounds: Mutex<VecDeque<Round>>,
    instructions: Mutex<Vec<String>>,
    live: Arc<AtomicUsize>,
    max_live: AtomicUsize,
}

impl ScriptedGenerator {
    pub(crate) fn new(rounds: Vec<Round>) -> Arc<Self> {
        Arc::new(Self {
            rounds: Mutex::new(rounds.into()),
            ..Default::default()
        })
    }

    /// Instructions of every generation call, in order.
    pub(crate) fn instructions(&self) -> Vec<String> {
        self.instructions.lock().unwrap().clone()
    }

    /// Most generation streams ever alive at the same time.
    pub(crate) fn max_concurrent(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, request: GenerationRequest) -> parley::Result<GenerationStream> {
        self.instructions.lock().unwrap().push(request.instructions);
        let round = self
            .rounds
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Round::text("Okay."));

        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(now, Ordering::SeqCst);
        let guard = LiveGuard(Arc::clone(&self.live));

        Ok(Box::pin(async_stream::stream! {
            let _guard = guard;
            for event in round.events {
                if !round.delay.is_zero() {
                    tokio::time::sleep(round.delay).await;
                }
                yield Ok::<_, ParleyError>(event);
            }
        }))
    }
}

// ─── Synthesis ──────────────────────────────────────────────────────────────

/// Emits one frame per word, `frame_delay` apart.
#[derive(Default)]
pub(crate) struct WordSynthesizer {
    frame_delay: Duration,
    spoken: Mutex<Vec<String>>,
}

impl WordSynthesizer {
    pub(crate) fn new(frame_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            frame_delay,
            spoken: Mutex::new(Vec::new()),
        })
    }

    /// Every text handed to synthesis, in order.
    pub(crate) fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for WordSynthesizer {
    async fn synthesize(&self, text: &str, _voice: &VoiceConfig) -> parley::Result<AudioStream> {
        self.spoken.lock().unwrap().push(text.to_owned());
        let words: Vec<Bytes> = text
            .split_whitespace()
            .map(|w| Bytes::from(w.as_bytes().to_vec()))
            .collect();
        let delay = self.frame_delay;
        Ok(Box::pin(async_stream::stream! {
            for word in words {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok::<_, ParleyError>(word);
            }
        }))
    }
}

// ─── Recognition ────────────────────────────────────────────────────────────

/// Releases whatever the test queued each time audio arrives.
struct ScriptedRecognizer {
    pending: Arc<Mutex<VecDeque<SpeechEvent>>>,
    broken: Arc<AtomicBool>,
}

#[async_trait]
impl SpeechRecognizer for ScriptedRecognizer {
    async fn accept(&mut self, _chunk: &AudioChunk) -> parley::Result<Vec<SpeechEvent>> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(ParleyError::TransientCapability("engine crashed".into()));
        }
        Ok(self.pending.lock().unwrap().drain(..).collect())
    }

    async fn reset(&mut self) -> parley::Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(ParleyError::TransientCapability("engine will not restart".into()));
        }
        Ok(())
    }
}

/// The far end of a session: speaks through the scripted recognizer and
/// listens to outbound frames.
pub(crate) struct Caller {
    peer: ChannelPeer,
    pending: Arc<Mutex<VecDeque<SpeechEvent>>>,
    broken: Arc<AtomicBool>,
}

impl Caller {
    async fn speak(&self, event: SpeechEvent) {
        self.pending.lock().unwrap().push_back(event);
        self.peer
            .send_audio(AudioChunk::new(vec![0u8; 320], 16_000))
            .await;
    }

    /// Interim hypothesis.
    pub(crate) async fn partial(&self, text: &str) {
        self.speak(SpeechEvent::partial(text)).await;
    }

    /// Finalized utterance.
    pub(crate) async fn say(&self, text: &str) {
        self.speak(SpeechEvent::final_text(text)).await;
    }

    /// Make the recognizer fail on every chunk and every reset.
    pub(crate) async fn break_recognizer(&self) {
        self.broken.store(true, Ordering::SeqCst);
        self.peer
            .send_audio(AudioChunk::new(vec![0u8; 320], 16_000))
            .await;
    }

    pub(crate) async fn next_frame(&mut self) -> OutboundFrame {
        tokio::time::timeout(WAIT, self.peer.frames_rx.recv())
            .await
            .expect("no outbound frame")
            .expect("connection dropped")
    }

    /// Next audio frame as `(response_id, word)`, skipping stop frames.
    pub(crate) async fn next_audio(&mut self) -> (u64, String) {
        loop {
            if let OutboundFrame::Audio {
                response_id,
                payload,
            } = self.next_frame().await
            {
                return (response_id, String::from_utf8(payload.to_vec()).unwrap());
            }
        }
    }

    /// Collect `n` audio frames and join their words.
    pub(crate) async fn hear_words(&mut self, n: usize) -> String {
        let mut words = Vec::with_capacity(n);
        for _ in 0..n {
            words.push(self.next_audio().await.1);
        }
        words.join(" ")
    }

    /// Frames that arrive within `window`.
    pub(crate) async fn frames_within(&mut self, window: Duration) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(frame)) =
            tokio::time::timeout_at(deadline, self.peer.frames_rx.recv()).await
        {
            frames.push(frame);
        }
        frames
    }

    pub(crate) fn close_reason(&self) -> Option<String> {
        self.peer.close_reason()
    }

    pub(crate) fn hang_up(&mut self) {
        self.peer.hang_up();
    }
}

// ─── Session harness ────────────────────────────────────────────────────────

/// A session running on its own task.
pub(crate) struct Running {
    pub(crate) caller: Caller,
    pub(crate) cancel: CancellationToken,
    events: broadcast::Receiver<RuntimeEvent>,
    /// Every runtime event observed so far.
    pub(crate) seen: Vec<RuntimeEvent>,
    task: JoinHandle<parley::Result<SessionSummary>>,
}

impl Running {
    /// Wait for the first event matching `pred`.
    pub(crate) async fn wait_for(&mut self, pred: impl Fn(&RuntimeEvent) -> bool) -> RuntimeEvent {
        let found = tokio::time::timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Ok(event) => {
                        self.seen.push(event.clone());
                        if pred(&event) {
                            return event;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await;
        found.unwrap_or_else(|_| panic!("event not observed; saw {:#?}", self.seen))
    }

    /// Drain buffered events into `seen` without waiting.
    pub(crate) fn drain(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.seen.push(event);
        }
    }

    /// Hang up and wait for the session to wind down.
    pub(crate) async fn hang_up(mut self) -> Finished {
        self.caller.hang_up();
        self.join().await
    }

    /// Wait for the session to end on its own.
    pub(crate) async fn join(mut self) -> Finished {
        let summary = tokio::time::timeout(WAIT, &mut self.task)
            .await
            .expect("session did not end")
            .expect("session task panicked")
            .expect("session failed");
        self.drain();
        Finished {
            summary,
            events: self.seen,
            caller: self.caller,
        }
    }
}

/// A session that has ended.
pub(crate) struct Finished {
    pub(crate) summary: SessionSummary,
    pub(crate) events: Vec<RuntimeEvent>,
    pub(crate) caller: Caller,
}

impl Finished {
    pub(crate) fn saw(&self, pred: impl Fn(&RuntimeEvent) -> bool) -> bool {
        self.events.iter().any(pred)
    }
}

/// Config with short backoffs so failure paths run quickly.
pub(crate) fn test_config() -> ParleyConfig {
    let mut config = ParleyConfig::default();
    config.recognition.reinit_backoff_ms = 5;
    config.processor.retry_backoff_ms = 5;
    config
}

pub(crate) fn capabilities(
    generator: &Arc<ScriptedGenerator>,
    synthesizer: &Arc<WordSynthesizer>,
) -> Capabilities {
    Capabilities::new(generator.clone(), synthesizer.clone())
}

pub(crate) fn start(
    registry: Arc<AgentRegistry>,
    capabilities: Capabilities,
    config: ParleyConfig,
    store: Arc<dyn DurableStore>,
    session_id: &str,
) -> Running {
    let (events_tx, events) = broadcast::channel(256);
    let coordinator =
        MainCoordinator::new(registry, capabilities, config, store).with_runtime_events(events_tx);
    let cancel = coordinator.cancel_token();
    let (connection, peer) = channel_connection(16);
    let pending = Arc::new(Mutex::new(VecDeque::new()));
    let broken = Arc::new(AtomicBool::new(false));
    let recognizer = ScriptedRecognizer {
        pending: Arc::clone(&pending),
        broken: Arc::clone(&broken),
    };
    let session_id = session_id.to_owned();
    let task = tokio::spawn(async move {
        coordinator
            .run(&session_id, Box::new(connection), Box::new(recognizer))
            .await
    });
    Running {
        caller: Caller {
            peer,
            pending,
            broken,
        },
        cancel,
        events,
        seen: Vec::new(),
        task,
    }
}

// ─── Registries ─────────────────────────────────────────────────────────────

pub(crate) fn billing_trigger(visibility: HandoffVisibility, immediate: bool) -> HandoffTrigger {
    HandoffTrigger {
        tool_name: "transfer_to_billing".into(),
        target: "Billing".into(),
        visibility,
        share_context: true,
        immediate,
        description: None,
    }
}

/// Concierge (entry point) that can hand off to Billing.
pub(crate) fn concierge_and_billing(trigger: HandoffTrigger) -> Arc<AgentRegistry> {
    Arc::new(
        AgentRegistry::from_descriptors(vec![
            AgentDescriptor::new("Concierge", "You are {{agent}}.")
                .entry_point()
                .with_trigger(trigger),
            AgentDescriptor::new("Billing", "You are {{agent}}. Reason: {{handoff_reason}}.")
                .with_introduction("Billing here, picking up from {{previous_agent}} now."),
        ])
        .expect("registry"),
    )
}

/// Snapshot of an existing conversation.
pub(crate) fn snapshot(session_id: &str, active: &str) -> SessionState {
    let mut state = SessionState::new(session_id, "Concierge");
    state.active_agent = active.to_owned();
    state.visited_agents.insert(active.to_owned());
    state
}
