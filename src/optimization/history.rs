//! Durable store for the append-only parameter history (spec.md §4.9, C9).

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::fs;

use crate::domain::optimization::{MetricsSnapshot, ParameterHistory};

pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub async fn load(&self) -> Result<ParameterHistory> {
        if !self.path.exists() {
            return Ok(ParameterHistory::default());
        }
        let bytes = fs::read(&self.path).await.context("reading parameter history")?;
        serde_json::from_slice(&bytes).context("parsing parameter history")
    }

    pub async fn save(&self, history: &ParameterHistory) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.context("creating history directory")?;
        }
        let bytes = serde_json::to_vec_pretty(history).context("serializing parameter history")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).await.context("writing history temp file")?;
        fs::rename(&tmp, &self.path).await.context("renaming history temp file into place")?;
        Ok(())
    }
}

/// Repair-tolerant parse of an `iter{N}-metadata.json` blob written by the
/// external modifier (spec.md §4.11 step 8): absence or malformed JSON is
/// treated as non-fatal, yielding `None` rather than failing the iteration.
pub fn parse_iteration_metadata(raw: &str) -> Option<MetricsSnapshot> {
    serde_json::from_str(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::optimization::{IterationRecord, Verdict};

    #[tokio::test]
    async fn save_then_load_round_trips_iterations() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.json"));

        let mut history = ParameterHistory::default();
        history.append_iteration(IterationRecord {
            iter: 1,
            phase: "refine".into(),
            before: None,
            after: None,
            change: None,
            verdict: Verdict::Neutral,
            note: None,
            score: 10.0,
        });
        store.save(&history).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.iterations.len(), 1);
    }

    #[tokio::test]
    async fn load_without_a_file_yields_default_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("missing.json"));
        let history = store.load().await.unwrap();
        assert!(history.iterations.is_empty());
    }

    #[test]
    fn malformed_metadata_is_treated_as_absent() {
        assert!(parse_iteration_metadata("{not valid json").is_none());
    }

    #[test]
    fn well_formed_metadata_parses() {
        let raw = r#"{"pnl": 12.5, "trades": 4, "profit_factor": 1.3}"#;
        let parsed = parse_iteration_metadata(raw).unwrap();
        assert_eq!(parsed.trades, 4);
    }
}
