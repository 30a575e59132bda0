//! Message types passed between the session's execution contexts.

use bytes::Bytes;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// A chunk of raw inbound audio (16-bit little-endian mono PCM).
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Raw PCM bytes.
    pub pcm: Bytes,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Timestamp when this chunk was received.
    pub received_at: Instant,
}

impl AudioChunk {
    /// Wrap raw PCM bytes received now.
    pub fn new(pcm: impl Into<Bytes>, sample_rate: u32) -> Self {
        Self {
            pcm: pcm.into(),
            sample_rate,
            received_at: Instant::now(),
        }
    }

    /// Number of 16-bit samples in the chunk.
    pub fn sample_count(&self) -> usize {
        self.pcm.len() / 2
    }
}

/// Whether a recognition event is interim, final, or an engine error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechEventKind {
    Partial,
    Final,
    Error,
}

/// A single recognition result. Produced once by recognition, consumed once.
#[derive(Debug, Clone)]
pub struct SpeechEvent {
    pub kind: SpeechEventKind,
    /// Transcript text (or the error description for `Error`).
    pub text: String,
    /// Engine confidence in `[0, 1]`.
    pub confidence: f32,
    /// BCP-47 language tag reported by the engine.
    pub language: String,
    pub timestamp: Instant,
}

impl SpeechEvent {
    /// Interim hypothesis.
    pub fn partial(text: impl Into<String>) -> Self {
        Self::new(SpeechEventKind::Partial, text)
    }

    /// Finalized utterance.
    pub fn final_text(text: impl Into<String>) -> Self {
        Self::new(SpeechEventKind::Final, text)
    }

    /// Engine failure.
    pub fn error(text: impl Into<String>) -> Self {
        Self::new(SpeechEventKind::Error, text)
    }

    fn new(kind: SpeechEventKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            confidence: 1.0,
            language: "en".to_owned(),
            timestamp: Instant::now(),
        }
    }

    /// Override the confidence.
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    /// Override the language tag.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }
}

/// One finalized utterance on its way to the processor.
///
/// Immutable; ownership moves from the queue to the processor.
#[derive(Debug, Clone)]
pub struct Turn {
    pub utterance: SpeechEvent,
    pub turn_id: u64,
    pub enqueued_at: Instant,
}

impl Turn {
    /// Create a turn from a final recognition event.
    pub fn new(turn_id: u64, utterance: SpeechEvent) -> Self {
        Self {
            utterance,
            turn_id,
            enqueued_at: Instant::now(),
        }
    }

    /// The user's words.
    pub fn text(&self) -> &str {
        &self.utterance.text
    }
}

/// A frame written to the outbound audio sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Synthesized audio belonging to one response.
    Audio { response_id: u64, payload: Bytes },
    /// Abort all queued audio immediately. Carries no payload.
    Stop,
}

impl OutboundFrame {
    /// Short marker naming the frame kind on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Audio { .. } => "audio",
            Self::Stop => "stop",
        }
    }

    /// Frame payload (empty for `Stop`).
    pub fn payload(&self) -> Bytes {
        match self {
            Self::Audio { payload, .. } => payload.clone(),
            Self::Stop => Bytes::new(),
        }
    }
}

/// Directives produced by the interruption coordinator for the main
/// coordinator to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Cancel the active response, if any.
    CancelActiveResponse,
    /// Send a stop frame to the outbound sink.
    StopAudio,
}

/// Messages from the turn processor (and its response tasks) to the main
/// coordinator.
#[derive(Debug)]
pub enum ProcessorMessage {
    /// A response task started. The coordinator keeps its cancellation token
    /// so barge-in can cancel it without going through the processor.
    ResponseStarted {
        response_id: u64,
        cancel: CancellationToken,
    },
    /// The processor cancelled a response because a newer turn superseded
    /// it. Sent before the next response starts.
    ResponseCancelled { response_id: u64 },
    /// Synthesized audio for a response.
    Audio { response_id: u64, payload: Bytes },
    /// A response task reached a terminal state.
    ResponseFinished { response_id: u64 },
}

/// A piece of generated text ready for synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentenceChunk {
    pub text: String,
    /// Whether this is the last chunk of the response.
    pub is_final: bool,
}
