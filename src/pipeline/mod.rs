//! The per-session turn pipeline.
//!
//! - `coordinator`: owns the connection and routes events between contexts
//! - `interruption`: barge-in gate
//! - `turn_queue`: bounded hand-off of final utterances
//! - `processor`: serial turn loop, single writer of session state
//! - `response`: one cancellable generation + synthesis task
//! - `chunker`: sentence splitting of streamed text

pub mod chunker;
pub mod coordinator;
pub mod interruption;
pub mod messages;
pub mod processor;
pub mod response;
pub mod turn_queue;
