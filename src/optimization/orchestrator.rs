//! Per-iteration optimization algorithm (spec.md §4.11, C11).
//!
//! Ties together the phase machine (C10), checkpoint store (C8), parameter
//! history (C9), and scoring (C7). Building and running the backtest itself
//! belongs to the calling binary (`src/bin/optimize.rs`), which owns the
//! strategy source and the actual `run_backtest` call; this module owns the
//! accept/reject/rollback/history bookkeeping that follows.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use tracing::{info, warn};

use crate::config::OptimizationConfig;
use crate::domain::errors::OrchestratorError;
use crate::domain::optimization::{
    Checkpoint, IterationRecord, MetricsSnapshot, ParamChange, ParameterHistory, Verdict,
};
use crate::optimization::checkpoint::CheckpointStore;
use crate::optimization::history::HistoryStore;
use crate::optimization::phase::{Event, Phase, PhaseMachine};
use crate::scoring::compare_scores;

pub struct Orchestrator {
    pub phase_machine: PhaseMachine,
    pub history: ParameterHistory,
    checkpoint_store: CheckpointStore,
    history_store: HistoryStore,
    best_score: f64,
    retry_counters: HashMap<&'static str, u32>,
}

impl Orchestrator {
    pub fn new(
        initial_phase: Phase,
        config: OptimizationConfig,
        checkpoint_store: CheckpointStore,
        history_store: HistoryStore,
        history: ParameterHistory,
    ) -> Self {
        let best_score = history
            .iterations
            .iter()
            .map(|i| i.score)
            .fold(f64::MIN, f64::max);
        Self {
            phase_machine: PhaseMachine::new(initial_phase, config),
            history,
            checkpoint_store,
            history_store,
            best_score: if best_score.is_finite() { best_score } else { 0.0 },
            retry_counters: HashMap::new(),
        }
    }

    /// Classifies `error` and applies the bounded-retry/backoff policy of
    /// spec.md §4.11. Returns `Ok(delay)` if the caller should back off and
    /// retry, `Err` if the failure is unrecoverable or a retry budget (3
    /// attempts per kind) is exhausted.
    pub fn handle_error(&mut self, raw_message: &str) -> Result<std::time::Duration, OrchestratorError> {
        let classified = OrchestratorError::classify(raw_message);
        if !classified.is_recoverable() {
            return Err(classified);
        }
        let kind = match &classified {
            OrchestratorError::CompileError { .. } => "compile_error",
            OrchestratorError::Timeout { .. } => "timeout",
            OrchestratorError::Network { .. } => "network",
            OrchestratorError::Transient { .. } => "transient",
            OrchestratorError::Fatal { .. } => unreachable!(),
        };
        let attempts = self.retry_counters.entry(kind).or_insert(0);
        *attempts += 1;
        if *attempts > 3 {
            return Err(classified);
        }
        self.phase_machine.handle(match classified {
            OrchestratorError::CompileError { .. } => Event::CompileError,
            _ => Event::TransientError,
        });
        let backoff_secs = 2u64.pow((*attempts).min(6)).min(60);
        Ok(std::time::Duration::from_secs(backoff_secs))
    }

    /// Step 5-8 of spec.md §4.11: scores the iteration, checkpoints on
    /// improvement, rolls back on rejection, and appends the iteration
    /// record to history. `working_source_path` is the file the external
    /// modifier may have rewritten in a restructure-phase iteration.
    pub async fn record_iteration(
        &mut self,
        iter: u32,
        change: Option<ParamChange>,
        strategy_source_bytes: Vec<u8>,
        param_overrides: HashMap<String, f64>,
        metrics: MetricsSnapshot,
        score: f64,
        min_trades: u32,
        working_source_path: &Path,
    ) -> Result<Verdict> {
        let verdict = compare_scores(score, self.best_score);
        self.phase_machine.handle(Event::Verdict(verdict));

        let mut note = None;
        if score > self.best_score && metrics.trades >= min_trades {
            self.best_score = score;
            let checkpoint = Checkpoint {
                strategy_source_bytes,
                param_overrides,
                metrics: metrics.clone(),
                iter,
            };
            self.checkpoint_store.save(&checkpoint).await?;
            self.phase_machine.handle(Event::CheckpointSaved);
            info!(iter, score, "optimizer: checkpoint saved on new best score");
        } else if verdict == Verdict::Degraded {
            let restored = self.checkpoint_store.rollback(working_source_path).await;
            match restored {
                Ok(checkpoint) => {
                    warn!(iter, score, best = self.best_score, "optimizer: rejected, rolled back to best checkpoint");
                    note = Some(format!("rolled back to iter {}", checkpoint.iter));
                }
                Err(e) => {
                    warn!(iter, error = %e, "optimizer: rejected but no checkpoint to roll back to");
                }
            }
        }

        self.history.append_iteration(IterationRecord {
            iter,
            phase: phase_label(self.phase_machine.phase).to_string(),
            before: None,
            after: Some(MetricsSnapshot { pnl: metrics.pnl, trades: metrics.trades, profit_factor: metrics.profit_factor }),
            change,
            verdict,
            note,
            score,
        });
        self.history.age_pending_hypotheses(iter, 10);
        self.history_store.save(&self.history).await?;

        Ok(verdict)
    }

    pub fn is_done(&self) -> bool {
        self.phase_machine.is_done()
    }
}

fn phase_label(phase: Phase) -> &'static str {
    match phase {
        Phase::Refine => "refine",
        Phase::Research => "research",
        Phase::Restructure => "restructure",
        Phase::Done => "done",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn orchestrator() -> (Orchestrator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint_store = CheckpointStore::new(dir.path().join("checkpoints"));
        let history_store = HistoryStore::new(dir.path().join("history.json"));
        let orch = Orchestrator::new(
            Phase::Refine,
            OptimizationConfig::default(),
            checkpoint_store,
            history_store,
            ParameterHistory::default(),
        );
        (orch, dir)
    }

    fn metrics(pnl: f64, trades: u32, pf: f64) -> MetricsSnapshot {
        MetricsSnapshot { pnl, trades, profit_factor: Some(pf) }
    }

    #[tokio::test]
    async fn rollback_on_reject_restores_checkpointed_bytes() {
        let (mut orch, dir) = orchestrator().await;
        let working = dir.path().join("strategy.rs");
        tokio::fs::write(&working, b"// iter k source").await.unwrap();

        // Iteration k: score 70, treated as best so far, checkpointed.
        orch.record_iteration(
            1,
            None,
            b"// iter k source".to_vec(),
            HashMap::from([("atr_mult".to_string(), 2.0)]),
            metrics(500.0, 30, 2.0),
            70.0,
            20,
            &working,
        )
        .await
        .unwrap();

        // Iteration k+1: score 55 is a reject (< 70*0.85), working tree is
        // mutated by a (simulated) bad modifier change before rollback.
        tokio::fs::write(&working, b"// iter k+1 bad source").await.unwrap();
        let verdict = orch
            .record_iteration(
                2,
                None,
                b"// iter k+1 bad source".to_vec(),
                HashMap::from([("atr_mult".to_string(), 9.0)]),
                metrics(-50.0, 5, 0.5),
                55.0,
                20,
                &working,
            )
            .await
            .unwrap();

        assert_eq!(verdict, Verdict::Degraded);
        let bytes = tokio::fs::read(&working).await.unwrap();
        assert_eq!(bytes, b"// iter k source");

        let checkpoint = orch.checkpoint_store.load().await.unwrap().unwrap();
        assert_eq!(checkpoint.param_overrides["atr_mult"], 2.0);
    }

    #[test]
    fn compile_error_is_retried_up_to_three_times() {
        let dir_fut = async { orchestrator().await };
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (mut orch, _dir) = rt.block_on(dir_fut);

        for _ in 0..3 {
            assert!(orch.handle_error("error[E0308]: mismatched types").is_ok());
        }
        assert!(orch.handle_error("error[E0308]: mismatched types").is_err());
    }

    #[test]
    fn fatal_errors_are_never_retried() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (mut orch, _dir) = rt.block_on(orchestrator());
        assert!(orch.handle_error("panic: index out of bounds").is_err());
    }
}
