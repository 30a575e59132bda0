//! Authoritative in-process session state with coalesced background mirroring.
//!
//! Reads and writes are synchronous and owned by the turn processor.
//! [`SessionStateStore::persist_async`] drops the latest snapshot into a
//! single-slot `watch` channel; one flusher task writes whatever is newest
//! when it gets to it, so a burst of requests collapses into at most one
//! flush in flight plus one pending.

use super::store::DurableStore;
use super::types::SessionState;
use crate::error::{ParleyError, Result, error_codes};
use crate::runtime::{RuntimeEvent, emit};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Slot = Option<Arc<SessionState>>;

/// Counters shared with the flusher task.
#[derive(Debug, Default)]
struct FlushStats {
    completed: AtomicU64,
    failed: AtomicU64,
    retry_pending: AtomicBool,
}

/// Single-writer session state plus its durable mirror.
pub struct SessionStateStore {
    state: SessionState,
    store: Arc<dyn DurableStore>,
    slot_tx: Option<watch::Sender<Slot>>,
    flusher: Option<JoinHandle<()>>,
    stats: Arc<FlushStats>,
    rehydrated: bool,
}

impl SessionStateStore {
    /// Load the last durable snapshot for `session_id`, or start fresh on
    /// `entry_agent` if there is none (or the store is unreachable).
    pub async fn rehydrate(
        store: Arc<dyn DurableStore>,
        session_id: &str,
        entry_agent: &str,
        runtime_tx: Option<broadcast::Sender<RuntimeEvent>>,
    ) -> Self {
        let (state, rehydrated) = match store.load(session_id).await {
            Ok(Some(state)) => {
                info!(
                    session_id,
                    agent = %state.active_agent,
                    turns = state.turns_completed,
                    "rehydrated session snapshot"
                );
                (state, true)
            }
            Ok(None) => (SessionState::new(session_id, entry_agent), false),
            Err(e) => {
                warn!(session_id, code = e.code(), "snapshot unavailable, starting fresh: {e}");
                emit(
                    runtime_tx.as_ref(),
                    RuntimeEvent::PersistenceFailed {
                        message: e.to_string(),
                    },
                );
                (SessionState::new(session_id, entry_agent), false)
            }
        };
        Self::with_state(store, state, rehydrated, runtime_tx)
    }

    /// Wrap an existing state without touching the store.
    pub fn with_state(
        store: Arc<dyn DurableStore>,
        state: SessionState,
        rehydrated: bool,
        runtime_tx: Option<broadcast::Sender<RuntimeEvent>>,
    ) -> Self {
        let (slot_tx, slot_rx) = watch::channel::<Slot>(None);
        let stats = Arc::new(FlushStats::default());
        let flusher = tokio::spawn(run_flusher(
            slot_rx,
            Arc::clone(&store),
            Arc::clone(&stats),
            runtime_tx,
        ));
        Self {
            state,
            store,
            slot_tx: Some(slot_tx),
            flusher: Some(flusher),
            stats,
            rehydrated,
        }
    }

    /// Whether the state came from a durable snapshot.
    pub fn was_rehydrated(&self) -> bool {
        self.rehydrated
    }

    pub fn read(&self) -> &SessionState {
        &self.state
    }

    /// Apply `f` to the state.
    ///
    /// If the previous flush failed, a new one is scheduled so the durable
    /// copy catches up.
    pub fn mutate<R>(&mut self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let out = f(&mut self.state);
        self.state.touch();
        if self.stats.retry_pending.load(Ordering::Acquire) {
            debug!(session_id = %self.state.session_id, "retrying failed snapshot flush");
            self.persist_async();
        }
        out
    }

    /// Schedule a background flush of the current state. Never suspends.
    ///
    /// A still-pending (not yet started) flush is superseded.
    pub fn persist_async(&self) {
        if let Some(tx) = &self.slot_tx {
            tx.send_replace(Some(Arc::new(self.state.clone())));
        }
    }

    /// Flushes that completed successfully.
    pub fn flushes_completed(&self) -> u64 {
        self.stats.completed.load(Ordering::Relaxed)
    }

    /// Flushes that failed.
    pub fn flushes_failed(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }

    /// Stop the flusher and return the final state.
    ///
    /// When `flush` is true the final state is written synchronously after
    /// the flusher drains.
    ///
    /// # Errors
    ///
    /// Returns [`ParleyError::Persistence`] if the final write fails.
    pub async fn close(mut self, flush: bool) -> (SessionState, Result<()>) {
        drop(self.slot_tx.take());
        if let Some(flusher) = self.flusher.take()
            && let Err(e) = flusher.await
        {
            warn!("snapshot flusher ended abnormally: {e}");
        }
        let result = if flush {
            self.store.save(&self.state).await.map_err(|e| match e {
                ParleyError::Persistence(_) => e,
                other => ParleyError::Persistence(other.to_string()),
            })
        } else {
            Ok(())
        };
        (self.state, result)
    }
}

async fn run_flusher(
    mut rx: watch::Receiver<Slot>,
    store: Arc<dyn DurableStore>,
    stats: Arc<FlushStats>,
    runtime_tx: Option<broadcast::Sender<RuntimeEvent>>,
) {
    while rx.changed().await.is_ok() {
        let Some(snapshot) = rx.borrow_and_update().clone() else {
            continue;
        };
        match store.save(&snapshot).await {
            Ok(()) => {
                stats.retry_pending.store(false, Ordering::Release);
                stats.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.retry_pending.store(true, Ordering::Release);
                stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    session_id = %snapshot.session_id,
                    code = error_codes::PERSISTENCE,
                    "snapshot flush failed, will retry on next mutation: {e}"
                );
                emit(
                    runtime_tx.as_ref(),
                    RuntimeEvent::PersistenceFailed {
                        message: e.to_string(),
                    },
                );
            }
        }
    }
}
