//! Composite score and accept/reject/neutral verdict (spec.md §4.7, C7).

use serde::{Deserialize, Serialize};

use crate::backtest::Metrics;
use crate::domain::optimization::Verdict;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub pf: f64,
    pub avg_r: f64,
    pub wr: f64,
    pub dd: f64,
    pub complexity: f64,
    pub sample: f64,
}

impl Default for ScoreWeights {
    /// Default weights sum to 100, per spec.md §4.7.
    fn default() -> Self {
        Self {
            pf: 30.0,
            avg_r: 20.0,
            wr: 15.0,
            dd: 20.0,
            complexity: 5.0,
            sample: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub pf: f64,
    pub avg_r: f64,
    pub wr: f64,
    pub dd: f64,
    pub complexity: f64,
    pub sample: f64,
    pub weighted: f64,
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Computes the `[0,1]`-normalized component scores and the weighted total,
/// per the axis table of spec.md §4.7.
pub fn score(metrics: &Metrics, param_count: u32, active_filter_count: u32, weights: &ScoreWeights) -> ScoreComponents {
    let pf = clamp01(metrics.profit_factor.unwrap_or(0.0) / 2.0);
    let avg_r = clamp01(metrics.avg_r.unwrap_or(0.0) / 0.5);
    let wr = clamp01(metrics.win_rate.unwrap_or(0.0) / 40.0);
    let dd = (1.0 - metrics.max_drawdown_pct / 15.0).max(0.0);
    let filters = param_count + active_filter_count;
    let complexity = clamp01(1.0 - (filters as f64 - 5.0) / 15.0);
    let sample = clamp01(metrics.num_trades as f64 / 150.0);

    let weighted = pf * weights.pf
        + avg_r * weights.avg_r
        + wr * weights.wr
        + dd * weights.dd
        + complexity * weights.complexity
        + sample * weights.sample;

    ScoreComponents { pf, avg_r, wr, dd, complexity, sample, weighted }
}

/// `accept` iff `new > old * 1.02`; `reject` iff `new < old * 0.85`; else
/// `neutral`. If `old <= 0`, `accept` iff `new > 0` (spec.md §4.7).
pub fn compare_scores(new: f64, old: f64) -> Verdict {
    if old <= 0.0 {
        return if new > 0.0 { Verdict::Improved } else { Verdict::Neutral };
    }
    if new > old * 1.02 {
        Verdict::Improved
    } else if new < old * 0.85 {
        Verdict::Degraded
    } else {
        Verdict::Neutral
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(pf: f64, avg_r: f64, wr: f64, dd: f64, trades: u32) -> Metrics {
        Metrics {
            total_pnl: 0.0,
            num_trades: trades,
            profit_factor: Some(pf),
            max_drawdown_pct: dd,
            win_rate: Some(wr),
            avg_r: Some(avg_r),
        }
    }

    #[test]
    fn component_scores_saturate_at_one() {
        let m = metrics(5.0, 2.0, 90.0, 0.0, 500);
        let s = score(&m, 3, 2, &ScoreWeights::default());
        assert_eq!(s.pf, 1.0);
        assert_eq!(s.avg_r, 1.0);
        assert_eq!(s.wr, 1.0);
        assert_eq!(s.sample, 1.0);
    }

    #[test]
    fn drawdown_score_floors_at_zero_beyond_fifteen_pct() {
        let m = metrics(1.0, 0.1, 20.0, 50.0, 10);
        let s = score(&m, 2, 1, &ScoreWeights::default());
        assert_eq!(s.dd, 0.0);
    }

    #[test]
    fn compare_scores_accept_reject_neutral_bands() {
        assert_eq!(compare_scores(103.0, 100.0), Verdict::Improved);
        assert_eq!(compare_scores(84.0, 100.0), Verdict::Degraded);
        assert_eq!(compare_scores(95.0, 100.0), Verdict::Neutral);
        assert_eq!(compare_scores(1.0, 0.0), Verdict::Improved);
        assert_eq!(compare_scores(-1.0, 0.0), Verdict::Neutral);
    }
}
