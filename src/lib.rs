//! Parley: real-time turn coordination for voice conversations.
//!
//! Coordinates continuous speech recognition, cancellable response
//! generation and playback, mid-response interruption ("barge-in") and
//! hand-off of the conversation between agents, while keeping one consistent
//! view of session state.
//!
//! # Architecture
//!
//! Each session runs three contexts connected by channels:
//! - **Recognition**: turns inbound audio into partial/final transcripts
//!   ([`recognition::RecognitionWorker`])
//! - **Turn processing**: answers one turn at a time, owns session state and
//!   resolves hand-offs ([`pipeline::processor::TurnProcessor`])
//! - **Coordination**: owns the caller's connection, applies barge-in and
//!   frames outbound audio ([`MainCoordinator`])
//!
//! Recognition, synthesis, generation, tools, transport and durable storage
//! are consumed through the traits in [`capabilities`], [`transport`] and
//! [`session::store`].

pub mod agents;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod handoff;
pub mod pipeline;
pub mod recognition;
pub mod runtime;
pub mod session;
pub mod transport;

pub use agents::{AgentDescriptor, AgentRegistry, HandoffTrigger, HandoffVisibility};
pub use capabilities::Capabilities;
pub use config::ParleyConfig;
pub use error::{ParleyError, Result};
pub use pipeline::coordinator::{MainCoordinator, SessionSummary};
pub use runtime::{EndReason, RuntimeEvent};
pub use session::{FsDurableStore, MemoryDurableStore, SessionState};
