//! Aggregate backtest metrics (spec.md §4.6, §3).

use serde::{Deserialize, Serialize};

use crate::backtest::engine::{CompletedTrade, ExitReason};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metrics {
    pub total_pnl: f64,
    pub num_trades: u32,
    pub profit_factor: Option<f64>,
    pub max_drawdown_pct: f64,
    pub win_rate: Option<f64>,
    pub avg_r: Option<f64>,
}

/// Computes the aggregate `Metrics` over a completed-trade sequence,
/// including the equity-curve max drawdown (spec.md §4.6).
pub fn compute_metrics(trades: &[CompletedTrade], starting_equity: f64) -> Metrics {
    if trades.is_empty() {
        return Metrics::default();
    }

    let total_pnl: f64 = trades.iter().map(|t| t.pnl).sum();
    let gross_profit: f64 = trades.iter().filter(|t| t.pnl > 0.0).map(|t| t.pnl).sum();
    let gross_loss: f64 = trades.iter().filter(|t| t.pnl < 0.0).map(|t| t.pnl.abs()).sum();
    let profit_factor = if gross_loss > 0.0 {
        Some(gross_profit / gross_loss)
    } else if gross_profit > 0.0 {
        None // undefined: no losing trades to divide by
    } else {
        Some(0.0)
    };

    let wins = trades.iter().filter(|t| t.pnl > 0.0).count();
    let win_rate = Some(wins as f64 / trades.len() as f64 * 100.0);

    let r_values: Vec<f64> = trades.iter().filter_map(|t| t.r_multiple).collect();
    let avg_r = if r_values.is_empty() {
        None
    } else {
        Some(r_values.iter().sum::<f64>() / r_values.len() as f64)
    };

    let mut equity = starting_equity;
    let mut peak = starting_equity;
    let mut max_dd_pct: f64 = 0.0;
    for t in trades {
        equity += t.pnl;
        peak = peak.max(equity);
        if peak > 0.0 {
            let dd = (peak - equity) / peak * 100.0;
            max_dd_pct = max_dd_pct.max(dd);
        }
    }

    Metrics {
        total_pnl,
        num_trades: trades.len() as u32,
        profit_factor,
        max_drawdown_pct: max_dd_pct,
        win_rate,
        avg_r,
    }
}

pub fn trades_by_exit_reason(trades: &[CompletedTrade], reason: ExitReason) -> Vec<&CompletedTrade> {
    trades.iter().filter(|t| t.exit_reason == reason).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trading::Direction;
    use chrono::{DateTime, Utc};

    fn trade(pnl: f64, r: Option<f64>) -> CompletedTrade {
        CompletedTrade {
            entry_ts: DateTime::<Utc>::UNIX_EPOCH,
            exit_ts: DateTime::<Utc>::UNIX_EPOCH,
            direction: Direction::Long,
            entry_px: 100.0,
            exit_px: 100.0 + pnl,
            pnl,
            r_multiple: r,
            exit_reason: ExitReason::StopLoss,
        }
    }

    #[test]
    fn profit_factor_is_gross_profit_over_gross_loss() {
        let trades = vec![trade(10.0, Some(1.0)), trade(-5.0, Some(-0.5))];
        let m = compute_metrics(&trades, 1000.0);
        assert_eq!(m.profit_factor, Some(2.0));
        assert_eq!(m.num_trades, 2);
    }

    #[test]
    fn drawdown_tracks_peak_to_trough() {
        let trades = vec![trade(100.0, None), trade(-50.0, None), trade(-30.0, None)];
        let m = compute_metrics(&trades, 1000.0);
        // equity: 1000 -> 1100 (peak) -> 1050 -> 1020; dd = (1100-1020)/1100*100
        assert!((m.max_drawdown_pct - 7.2727).abs() < 1e-3);
    }

    #[test]
    fn empty_trades_yield_default_metrics() {
        let m = compute_metrics(&[], 1000.0);
        assert_eq!(m.num_trades, 0);
        assert_eq!(m.total_pnl, 0.0);
    }
}
