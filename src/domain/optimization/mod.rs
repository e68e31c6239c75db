//! Optimization-loop data model (spec.md §3).

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Improved,
    Degraded,
    Neutral,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub pnl: f64,
    pub trades: u32,
    pub profit_factor: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamChange {
    pub param: String,
    pub from: f64,
    pub to: f64,
    pub scale: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iter: u32,
    pub phase: String,
    pub before: Option<MetricsSnapshot>,
    pub after: Option<MetricsSnapshot>,
    pub change: Option<ParamChange>,
    pub verdict: Verdict,
    pub note: Option<String>,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeverWorked {
    pub param: String,
    pub value: f64,
    pub reason: String,
    pub iter: u32,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingHypothesis {
    pub iter: u32,
    pub rank: u32,
    pub hypothesis: String,
    pub condition: Option<String>,
    pub expired: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApproachVerdict {
    Active,
    Promising,
    Exhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproachRecord {
    pub id: String,
    pub name: String,
    pub indicators: Vec<String>,
    pub start_iter: u32,
    pub end_iter: Option<u32>,
    pub best_score: f64,
    pub best_metrics: Option<MetricsSnapshot>,
    pub verdict: ApproachVerdict,
    pub reason: Option<String>,
}

/// Explored axes ledger: for each optimizable parameter, the set of values
/// already evaluated at 4-decimal precision (spec.md §3, §4.9).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExploredSpace {
    ranges: HashMap<String, HashSet<i64>>,
}

impl ExploredSpace {
    fn quantize(value: f64) -> i64 {
        (value * 10_000.0).round() as i64
    }

    pub fn record(&mut self, param: &str, value: f64) {
        self.ranges
            .entry(param.to_string())
            .or_default()
            .insert(Self::quantize(value));
    }

    pub fn has_been_tried(&self, param: &str, value: f64) -> bool {
        self.ranges
            .get(param)
            .is_some_and(|set| set.contains(&Self::quantize(value)))
    }

    pub fn values_for(&self, param: &str) -> Vec<f64> {
        self.ranges
            .get(param)
            .map(|set| set.iter().map(|q| *q as f64 / 10_000.0).collect())
            .unwrap_or_default()
    }
}

/// The append-only ledger of spec.md §4.9. All mutation is performed by the
/// orchestrator; the external modifier never writes it directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterHistory {
    pub iterations: Vec<IterationRecord>,
    pub explored_ranges: ExploredSpace,
    pub never_worked: Vec<NeverWorked>,
    pub pending_hypotheses: Vec<PendingHypothesis>,
    pub approaches: Vec<ApproachRecord>,
    pub current_phase: String,
}

impl ParameterHistory {
    pub fn append_iteration(&mut self, record: IterationRecord) {
        if let Some(change) = &record.change {
            self.explored_ranges.record(&change.param, change.to);
        }
        self.iterations.push(record);
    }

    /// Fills the `after` field of the previous iteration once new backtest
    /// metrics are known (spec.md §4.9).
    pub fn backfill_last_iteration(&mut self, metrics: MetricsSnapshot) {
        if let Some(last) = self.iterations.last_mut() {
            last.after = Some(metrics);
        }
    }

    pub fn age_pending_hypotheses(&mut self, current_iter: u32, max_age: u32) {
        for hyp in &mut self.pending_hypotheses {
            if current_iter.saturating_sub(hyp.iter) > max_age {
                hyp.expired = true;
            }
        }
    }
}

/// The best-scoring `(source, params, metrics)` snapshot (spec.md §3, §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub strategy_source_bytes: Vec<u8>,
    pub param_overrides: HashMap<String, f64>,
    pub metrics: MetricsSnapshot,
    pub iter: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explored_space_quantizes_to_four_decimals() {
        let mut space = ExploredSpace::default();
        space.record("rsi_len", 14.00001);
        assert!(space.has_been_tried("rsi_len", 14.0));
        assert!(!space.has_been_tried("rsi_len", 14.1));
    }

    #[test]
    fn backfill_updates_only_the_last_iteration() {
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
        history.backfill_last_iteration(MetricsSnapshot {
            pnl: 5.0,
            trades: 3,
            profit_factor: Some(1.2),
        });
        assert_eq!(history.iterations[0].after.as_ref().unwrap().trades, 3);
    }

    #[test]
    fn pending_hypotheses_expire_past_max_age() {
        let mut history = ParameterHistory::default();
        history.pending_hypotheses.push(PendingHypothesis {
            iter: 1,
            rank: 1,
            hypothesis: "try wider ATR stop".into(),
            condition: None,
            expired: false,
        });
        history.age_pending_hypotheses(10, 5);
        assert!(history.pending_hypotheses[0].expired);
    }
}
