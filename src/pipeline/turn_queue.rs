//! Bounded, ordered hand-off of final utterances to the turn processor.
//!
//! The queue never blocks the producer. When it is at capacity the oldest
//! unprocessed turn is dropped so the latest utterance wins. Retained turns
//! are delivered strictly in FIFO order to a single consumer.

use crate::error::ParleyError;
use crate::pipeline::messages::Turn;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::warn;

/// Result of [`TurnSender::enqueue`].
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// The turn was buffered without displacing anything.
    Enqueued,
    /// The queue was full; the oldest buffered turn was dropped.
    DroppedOldest { dropped: Turn, error: ParleyError },
    /// The consumer is gone; the turn was discarded.
    Closed(Turn),
}

struct Shared {
    pending: Mutex<VecDeque<Turn>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Turn>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Create a queue buffering at most `capacity` turns (clamped to at least 1).
pub fn turn_queue(capacity: usize) -> (TurnSender, TurnReceiver) {
    let shared = Arc::new(Shared {
        pending: Mutex::new(VecDeque::new()),
        notify: Notify::new(),
        capacity: capacity.max(1),
        closed: AtomicBool::new(false),
        dropped: AtomicU64::new(0),
    });
    (
        TurnSender {
            shared: Arc::clone(&shared),
        },
        TurnReceiver { shared },
    )
}

/// Producer half, held by the main coordinator.
pub struct TurnSender {
    shared: Arc<Shared>,
}

impl TurnSender {
    /// Buffer a turn without blocking.
    pub fn enqueue(&self, turn: Turn) -> EnqueueOutcome {
        if self.shared.closed.load(Ordering::Acquire) {
            return EnqueueOutcome::Closed(turn);
        }
        let outcome = {
            let mut pending = self.shared.lock();
            let dropped = if pending.len() >= self.shared.capacity {
                pending.pop_front()
            } else {
                None
            };
            pending.push_back(turn);
            dropped
        };
        self.shared.notify.notify_one();

        match outcome {
            Some(dropped) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                let error = ParleyError::Overflow(format!(
                    "turn {} dropped, queue holds {} unprocessed turn(s)",
                    dropped.turn_id, self.shared.capacity
                ));
                warn!(
                    code = error.code(),
                    dropped_turn = dropped.turn_id,
                    "turn queue at capacity, dropping oldest unprocessed turn"
                );
                EnqueueOutcome::DroppedOldest { dropped, error }
            }
            None => EnqueueOutcome::Enqueued,
        }
    }

    /// Turns currently buffered.
    pub fn len(&self) -> usize {
        self.shared.lock().len()
    }

    /// Whether no turns are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total turns dropped by the overflow policy.
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for TurnSender {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }
}

/// Consumer half, held by the turn processor. Not cloneable: one consumer
/// per session.
pub struct TurnReceiver {
    shared: Arc<Shared>,
}

impl TurnReceiver {
    /// Wait for the next turn.
    ///
    /// Returns `None` once the sender is dropped and the buffer is drained.
    pub async fn dequeue(&mut self) -> Option<Turn> {
        loop {
            if let Some(turn) = self.shared.lock().pop_front() {
                return Some(turn);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            self.shared.notify.notified().await;
        }
    }

    /// Take the next turn if one is buffered.
    pub fn try_dequeue(&mut self) -> Option<Turn> {
        self.shared.lock().pop_front()
    }
}

impl Drop for TurnReceiver {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}
