//! Audio recognition worker.
//!
//! Owns the speech recognizer on its own task. Inbound audio is handed over
//! through a bounded channel with `try_send` so [`RecognitionWorker::feed`]
//! never waits on the engine. Events go out on an unbounded channel so the
//! worker never waits on the coordinator either.

use crate::capabilities::SpeechRecognizer;
use crate::config::RecognitionConfig;
use crate::error::error_codes;
use crate::pipeline::messages::{AudioChunk, SpeechEvent, SpeechEventKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Events marshaled from the worker into the coordinator's context.
#[derive(Debug, Clone)]
pub enum RecognitionEvent {
    /// Interim hypothesis long enough to count as speech.
    Partial(SpeechEvent),
    /// Finalized utterance.
    Final(SpeechEvent),
    /// The engine failed beyond its re-initialization budget. Always the last
    /// event.
    Fatal(String),
}

/// Lazy, non-restartable sequence of recognition events.
pub type RecognitionEvents = UnboundedReceiverStream<RecognitionEvent>;

/// Why an inbound chunk was rejected before reaching the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedRejection {
    Empty,
    OddLength,
    WrongSampleRate,
    BufferFull,
    Stopped,
}

/// Handle to the recognition task.
pub struct RecognitionWorker {
    audio_tx: mpsc::Sender<AudioChunk>,
    sample_rate: u32,
    rejected: Arc<AtomicU64>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RecognitionWorker {
    /// Spawn the worker around `engine`.
    ///
    /// The returned stream yields events until the worker stops; after a
    /// [`RecognitionEvent::Fatal`] nothing else is produced.
    pub fn spawn(
        engine: Box<dyn SpeechRecognizer>,
        config: RecognitionConfig,
        cancel: CancellationToken,
    ) -> (Self, RecognitionEvents) {
        let (audio_tx, audio_rx) = mpsc::channel(config.inbound_buffer.max(1));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let sample_rate = config.sample_rate;
        let task = tokio::spawn(run_recognition(
            engine,
            config,
            audio_rx,
            event_tx,
            cancel.clone(),
        ));
        (
            Self {
                audio_tx,
                sample_rate,
                rejected: Arc::new(AtomicU64::new(0)),
                cancel,
                task,
            },
            UnboundedReceiverStream::new(event_rx),
        )
    }

    /// Hand a chunk to the worker without waiting.
    ///
    /// Malformed chunks and chunks arriving while the buffer is full are
    /// logged and dropped; the caller never sees an error.
    pub fn feed(&self, chunk: AudioChunk) -> Option<FeedRejection> {
        let rejection = if chunk.pcm.is_empty() {
            Some(FeedRejection::Empty)
        } else if chunk.pcm.len() % 2 != 0 {
            Some(FeedRejection::OddLength)
        } else if chunk.sample_rate != self.sample_rate {
            Some(FeedRejection::WrongSampleRate)
        } else {
            match self.audio_tx.try_send(chunk) {
                Ok(()) => None,
                Err(TrySendError::Full(_)) => Some(FeedRejection::BufferFull),
                Err(TrySendError::Closed(_)) => Some(FeedRejection::Stopped),
            }
        };
        if let Some(reason) = rejection {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            match reason {
                FeedRejection::BufferFull => warn!(
                    code = error_codes::OVERFLOW,
                    "recognition buffer full, dropping audio chunk"
                ),
                FeedRejection::Stopped => debug!("recognition stopped, dropping audio chunk"),
                other => warn!(reason = ?other, "dropping malformed audio chunk"),
            }
        }
        rejection
    }

    /// Chunks dropped by [`feed`](Self::feed).
    pub fn rejected_chunks(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Stop the worker and wait for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        drop(self.audio_tx);
        if let Err(e) = self.task.await {
            warn!("recognition task ended abnormally: {e}");
        }
    }
}

async fn run_recognition(
    mut engine: Box<dyn SpeechRecognizer>,
    config: RecognitionConfig,
    mut audio_rx: mpsc::Receiver<AudioChunk>,
    event_tx: mpsc::UnboundedSender<RecognitionEvent>,
    cancel: CancellationToken,
) {
    // Consecutive failures since the engine last produced a good result.
    let mut failures: u32 = 0;

    loop {
        let chunk = tokio::select! {
            () = cancel.cancelled() => break,
            chunk = audio_rx.recv() => match chunk {
                Some(c) => c,
                None => break,
            },
        };

        let failure = match engine.accept(&chunk).await {
            Ok(events) => {
                let mut engine_error = None;
                for event in events {
                    if event.kind == SpeechEventKind::Error {
                        engine_error = Some(event.text);
                        break;
                    }
                    if let Some(out) = classify(event, config.min_partial_chars)
                        && event_tx.send(out).is_err()
                    {
                        return;
                    }
                }
                engine_error
            }
            Err(e) => Some(e.to_string()),
        };

        let Some(message) = failure else {
            failures = 0;
            continue;
        };

        failures += 1;
        if !reinitialize(engine.as_mut(), &config, failures, &message, &cancel).await {
            error!(
                code = error_codes::FATAL,
                attempts = config.max_reinit_attempts,
                "recognition failed permanently: {message}"
            );
            let _ = event_tx.send(RecognitionEvent::Fatal(message));
            return;
        }
    }
    debug!("recognition worker stopped");
}

/// Reset the engine after failure number `failures`. Returns false once the
/// budget is exhausted or the worker is cancelled.
async fn reinitialize(
    engine: &mut dyn SpeechRecognizer,
    config: &RecognitionConfig,
    failures: u32,
    message: &str,
    cancel: &CancellationToken,
) -> bool {
    let mut attempt = failures;
    while attempt <= config.max_reinit_attempts {
        let delay = config.reinit_delay(attempt);
        warn!(
            code = error_codes::TRANSIENT_CAPABILITY,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "recognizer failed, re-initializing: {message}"
        );
        tokio::select! {
            () = cancel.cancelled() => return false,
            () = tokio::time::sleep(delay) => {}
        }
        match engine.reset().await {
            Ok(()) => {
                info!(attempt, "recognizer re-initialized");
                return true;
            }
            Err(e) => {
                warn!(attempt, "recognizer reset failed: {e}");
                attempt += 1;
            }
        }
    }
    false
}

/// Map an engine event to what the coordinator should see.
fn classify(event: SpeechEvent, min_partial_chars: usize) -> Option<RecognitionEvent> {
    match event.kind {
        SpeechEventKind::Partial => {
            if event.text.trim().chars().count() >= min_partial_chars {
                Some(RecognitionEvent::Partial(event))
            } else {
                debug!(partial = %event.text, "partial below threshold ignored");
                None
            }
        }
        SpeechEventKind::Final => {
            if event.text.trim().is_empty() {
                None
            } else {
                Some(RecognitionEvent::Final(event))
            }
        }
        SpeechEventKind::Error => None,
    }
}
