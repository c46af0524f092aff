use crate::PersistentState;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Write-through persistence for `(current_term, voted_for, log)`.
///
/// Saves land in a temp file which is flushed and then renamed over the real
/// one, so a crash mid-write leaves either the old state or the new state on
/// disk, never a torn file.
pub struct StateStore {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl StateStore {
    pub fn new(data_dir: &Path, node_id: &str) -> Self {
        let path = data_dir.join(format!("node_{}_state.json", node_id));
        let tmp_path = data_dir.join(format!("node_{}_state.json.tmp", node_id));
        Self { path, tmp_path }
    }

    /// Load the persisted state, or `None` on first boot. An unreadable or
    /// corrupt file is an error; starting fresh over it would forfeit votes
    /// and log entries this node already promised to keep.
    pub fn load(&self) -> Result<Option<PersistentState>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => {
                let state: PersistentState = serde_json::from_slice(&bytes)
                    .with_context(|| format!("corrupt state file {}", self.path.display()))?;
                Ok(Some(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(e).with_context(|| format!("failed to read {}", self.path.display()))
            }
        }
    }

    /// Durably save the state. The new state is not observable under the
    /// final path until the rename lands.
    pub async fn save(&self, state: &PersistentState) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let bytes = serde_json::to_vec_pretty(state)?;
        let mut file = fs::File::create(&self.tmp_path)
            .await
            .with_context(|| format!("failed to create {}", self.tmp_path.display()))?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&self.tmp_path, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}
