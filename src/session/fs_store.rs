//! Filesystem-backed durable store.
//!
//! Each snapshot is stored as `{data_dir}/{session_id}.json`. Writes are
//! atomic (temp file + fsync + rename) so a crash never leaves a torn file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::store::DurableStore;
use super::types::SessionState;
use crate::error::{ParleyError, Result};

/// Filesystem snapshot store.
#[derive(Debug, Clone)]
pub struct FsDurableStore {
    data_dir: PathBuf,
}

impl FsDurableStore {
    /// Create a store rooted at `data_dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`ParleyError::Persistence`] if the directory cannot be created.
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir).map_err(|e| {
            ParleyError::Persistence(format!(
                "failed to create snapshot directory {}: {e}",
                data_dir.display()
            ))
        })?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn snapshot_path(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.data_dir.join(format!("{session_id}.json")))
    }

    fn write_atomic(&self, state: &SessionState) -> Result<()> {
        let path = self.snapshot_path(&state.session_id)?;
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| ParleyError::Persistence(format!("failed to serialize snapshot: {e}")))?;

        let tmp_path = self.data_dir.join(format!(".{}.tmp", state.session_id));
        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| {
            ParleyError::Persistence(format!(
                "failed to write temp file {}: {e}",
                tmp_path.display()
            ))
        })?;

        if let Ok(file) = std::fs::File::open(&tmp_path) {
            let _ = file.sync_all();
        }

        std::fs::rename(&tmp_path, &path).map_err(|e| {
            ParleyError::Persistence(format!(
                "failed to rename temp file to {}: {e}",
                path.display()
            ))
        })
    }
}

/// Session ids become file names; keep them to a safe character set.
fn validate_session_id(session_id: &str) -> Result<()> {
    let ok = !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
    if ok {
        Ok(())
    } else {
        Err(ParleyError::Persistence(format!(
            "invalid session id for filesystem store: {session_id:?}"
        )))
    }
}

#[async_trait]
impl DurableStore for FsDurableStore {
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>> {
        let path = self.snapshot_path(session_id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ParleyError::Persistence(format!(
                    "failed to read snapshot {}: {e}",
                    path.display()
                )));
            }
        };
        serde_json::from_str(&content).map(Some).map_err(|e| {
            ParleyError::Persistence(format!(
                "failed to parse snapshot {}: {e}",
                path.display()
            ))
        })
    }

    async fn save(&self, state: &SessionState) -> Result<()> {
        let this = self.clone();
        let state = state.clone();
        tokio::task::spawn_blocking(move || this.write_atomic(&state))
            .await
            .map_err(|e| ParleyError::Persistence(format!("snapshot writer panicked: {e}")))?
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        let path = self.snapshot_path(session_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ParleyError::Persistence(format!(
                "failed to delete snapshot {}: {e}",
                path.display()
            ))),
        }
    }
}
