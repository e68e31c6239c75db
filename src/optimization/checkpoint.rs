//! Best-state snapshot with atomic save and rollback (spec.md §4.8, C8).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::domain::optimization::Checkpoint;

pub struct CheckpointStore {
    /// Directory holding `checkpoint.json` for one `(coin, strategy)` session.
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn checkpoint_path(&self) -> PathBuf {
        self.dir.join("checkpoint.json")
    }

    /// Write-temp-then-rename so a crash mid-write never leaves a partial
    /// checkpoint file (spec.md §4.8).
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .context("creating checkpoint directory")?;
        let bytes = serde_json::to_vec_pretty(checkpoint).context("serializing checkpoint")?;
        let final_path = self.checkpoint_path();
        let tmp_path = final_path.with_extension("json.tmp");
        fs::write(&tmp_path, &bytes)
            .await
            .context("writing checkpoint temp file")?;
        fs::rename(&tmp_path, &final_path)
            .await
            .context("renaming checkpoint temp file into place")?;
        Ok(())
    }

    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        let path = self.checkpoint_path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).await.context("reading checkpoint file")?;
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes).context("parsing checkpoint file")?;
        Ok(Some(checkpoint))
    }

    /// Restores `working_source_path` to the checkpointed source bytes
    /// (also write-temp-then-rename) and returns the stored param overrides.
    /// Invariant: after this call, the working tree is byte-identical to the
    /// checkpoint's snapshot.
    pub async fn rollback(&self, working_source_path: &Path) -> Result<Checkpoint> {
        let checkpoint = self
            .load()
            .await?
            .context("no checkpoint to roll back to")?;

        let tmp_path = working_source_path.with_extension("rs.tmp");
        fs::write(&tmp_path, &checkpoint.strategy_source_bytes)
            .await
            .context("writing rollback source temp file")?;
        fs::rename(&tmp_path, working_source_path)
            .await
            .context("renaming rollback source temp file into place")?;
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::domain::optimization::MetricsSnapshot;

    fn sample(iter: u32) -> Checkpoint {
        Checkpoint {
            strategy_source_bytes: format!("// iter {iter}").into_bytes(),
            param_overrides: HashMap::from([("atr_mult".to_string(), 2.5)]),
            metrics: MetricsSnapshot { pnl: 100.0, trades: 30, profit_factor: Some(1.8) },
            iter,
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().to_path_buf());
        store.save(&sample(5)).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.iter, 5);
        assert_eq!(loaded.param_overrides["atr_mult"], 2.5);
    }

    #[tokio::test]
    async fn rollback_restores_working_source_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().to_path_buf());
        store.save(&sample(7)).await.unwrap();

        let working = dir.path().join("strategy.rs");
        fs::write(&working, b"// modified by the external modifier").await.unwrap();

        let restored = store.rollback(&working).await.unwrap();
        let bytes = fs::read(&working).await.unwrap();
        assert_eq!(bytes, restored.strategy_source_bytes);
        assert_eq!(restored.param_overrides["atr_mult"], 2.5);
    }

    #[tokio::test]
    async fn load_without_a_saved_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().to_path_buf());
        assert!(store.load().await.unwrap().is_none());
    }
}
