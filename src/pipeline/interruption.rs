//! Barge-in gating.
//!
//! Converts partial recognition signals into a cancel + stop-audio directive
//! pair for the main coordinator. The gate is `Allowed` by default and
//! `Suppressed` while an agent introduction plays; the turn processor flips it
//! through an [`InterruptionHandle`].

use crate::pipeline::messages::Directive;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Whether partial speech may interrupt the assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionState {
    Allowed,
    Suppressed,
}

/// What [`InterruptionCoordinator::on_partial_signal`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialOutcome {
    /// The gate is suppressed; nothing happened.
    Suppressed,
    /// Cancel and stop-audio directives were enqueued.
    Interrupted,
    /// This response was already interrupted; nothing new was enqueued.
    AlreadyInterrupted,
}

/// Cloneable toggle for the interruption gate.
#[derive(Debug, Clone)]
pub struct InterruptionHandle {
    tx: Arc<watch::Sender<InterruptionState>>,
}

impl InterruptionHandle {
    /// Ignore partial signals until [`allow`](Self::allow) is called.
    pub fn suppress(&self) {
        if self.tx.send_replace(InterruptionState::Suppressed) != InterruptionState::Suppressed {
            debug!("barge-in suppressed");
        }
    }

    /// Resume honoring partial signals.
    pub fn allow(&self) {
        if self.tx.send_replace(InterruptionState::Allowed) != InterruptionState::Allowed {
            debug!("barge-in allowed");
        }
    }

    /// Current gate state.
    pub fn state(&self) -> InterruptionState {
        *self.tx.borrow()
    }
}

/// Lives in the main coordinator's context.
pub struct InterruptionCoordinator {
    state_rx: watch::Receiver<InterruptionState>,
    handle: InterruptionHandle,
    directive_tx: mpsc::UnboundedSender<Directive>,
    interrupted: bool,
}

impl InterruptionCoordinator {
    /// Create a coordinator that enqueues directives on `directive_tx`.
    pub fn new(directive_tx: mpsc::UnboundedSender<Directive>) -> Self {
        let (tx, state_rx) = watch::channel(InterruptionState::Allowed);
        Self {
            state_rx,
            handle: InterruptionHandle { tx: Arc::new(tx) },
            directive_tx,
            interrupted: false,
        }
    }

    /// Handle for the turn processor to toggle the gate.
    pub fn handle(&self) -> InterruptionHandle {
        self.handle.clone()
    }

    /// Current gate state.
    pub fn state(&self) -> InterruptionState {
        *self.state_rx.borrow()
    }

    /// Re-arm after a new response starts so the next partial interrupts it.
    pub fn arm(&mut self) {
        self.interrupted = false;
    }

    /// A partial hypothesis above the noise threshold arrived.
    pub fn on_partial_signal(&mut self, text: &str) -> PartialOutcome {
        if self.state() == InterruptionState::Suppressed {
            debug!(partial = text, "partial ignored while barge-in is suppressed");
            return PartialOutcome::Suppressed;
        }
        if self.interrupted {
            return PartialOutcome::AlreadyInterrupted;
        }
        self.interrupted = true;
        debug!(partial = text, "barge-in: requesting cancellation and stop-audio");
        // The receiver lives in the same coordinator; a closed channel only
        // happens during shutdown.
        let _ = self.directive_tx.send(Directive::CancelActiveResponse);
        let _ = self.directive_tx.send(Directive::StopAudio);
        PartialOutcome::Interrupted
    }

    /// Suppress via the coordinator itself.
    pub fn suppress(&self) {
        self.handle.suppress();
    }

    /// Allow via the coordinator itself.
    pub fn allow(&self) {
        self.handle.allow();
    }
}
