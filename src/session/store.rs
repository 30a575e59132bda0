//! Durable session storage trait and in-memory implementation.
//!
//! # Examples
//!
//! ```
//! use parley::session::store::MemoryDurableStore;
//!
//! let store = MemoryDurableStore::new();
//! let store2 = store.clone();
//! assert!(format!("{store2:?}").contains("MemoryDurableStore"));
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::types::SessionState;
use crate::error::Result;

/// Key-value persistence for session snapshots, keyed by session id.
///
/// Writes are best-effort; reads are point-in-time and used only for
/// rehydration at session start.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Load the last snapshot for `session_id`, or `None` if there is none.
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>>;

    /// Save (overwrite) a snapshot.
    async fn save(&self, state: &SessionState) -> Result<()>;

    /// Delete a snapshot. Returns `Ok(())` even if it did not exist.
    async fn delete(&self, session_id: &str) -> Result<()>;
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Debug, Clone, Default)]
pub struct MemoryDurableStore {
    snapshots: Arc<RwLock<HashMap<String, SessionState>>>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots.
    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    /// Whether the store holds no snapshots.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>> {
        Ok(self.snapshots.read().await.get(session_id).cloned())
    }

    async fn save(&self, state: &SessionState) -> Result<()> {
        self.snapshots
            .write()
            .await
            .insert(state.session_id.clone(), state.clone());
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        self.snapshots.write().await.remove(session_id);
        Ok(())
    }
}
