//! Session state, its single-writer store and durable snapshot backends.

pub mod fs_store;
pub mod state_store;
pub mod store;
pub mod types;

pub use fs_store::FsDurableStore;
pub use state_store::SessionStateStore;
pub use store::{DurableStore, MemoryDurableStore};
pub use types::{CycleWarning, HandoffRecord, SessionState};

/// Fresh random session identifier for callers that do not bring their own.
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
