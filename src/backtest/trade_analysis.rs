//! Breakdown reporting over a completed-trade set (spec.md §4.6, §3).

use std::collections::HashMap;

use chrono::{Datelike, Timelike, Weekday};
use serde::{Deserialize, Serialize};

use crate::backtest::engine::{CompletedTrade, ExitReason};
use crate::backtest::metrics::{compute_metrics, Metrics};
use crate::domain::trading::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Session {
    Asia,
    London,
    NewYork,
    OffPeak,
}

impl Session {
    /// Session for a UTC hour, per the ranges of spec.md §4.6:
    /// Asia 23-8, London 8-13, New York 13-20, Off-peak 20-23.
    fn for_hour(hour: u32) -> Session {
        if hour >= 23 || hour < 8 {
            Session::Asia
        } else if hour < 13 {
            Session::London
        } else if hour < 20 {
            Session::NewYork
        } else {
            Session::OffPeak
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkForwardSplit {
    pub train_metrics: Metrics,
    pub test_metrics: Metrics,
    pub train_test_pf_ratio: Option<f64>,
    pub per_hour_consistency: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSimulation {
    pub label: String,
    pub metrics: Metrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeAnalysis {
    pub by_direction: HashMap<String, Metrics>,
    pub by_exit_type: HashMap<String, Metrics>,
    pub by_utc_hour: HashMap<u32, Metrics>,
    pub by_weekday: HashMap<String, Metrics>,
    pub by_session: HashMap<String, Metrics>,
    pub best_3: Vec<CompletedTrade>,
    pub worst_3: Vec<CompletedTrade>,
    pub filter_simulations: Vec<FilterSimulation>,
    pub walk_forward: Option<WalkForwardSplit>,
}

fn metrics_for<'a>(trades: impl Iterator<Item = &'a CompletedTrade>, starting_equity: f64) -> Metrics {
    let subset: Vec<CompletedTrade> = trades.cloned().collect();
    compute_metrics(&subset, starting_equity)
}

fn direction_key(d: Direction) -> String {
    d.to_string()
}

fn exit_key(e: ExitReason) -> String {
    match e {
        ExitReason::StopLoss => "stop_loss",
        ExitReason::TakeProfit => "take_profit",
        ExitReason::StrategyExit => "strategy_exit",
        ExitReason::Timeout => "timeout",
        ExitReason::EndOfData => "end_of_data",
    }
    .to_string()
}

fn weekday_key(w: Weekday) -> String {
    w.to_string()
}

fn session_key(s: Session) -> String {
    match s {
        Session::Asia => "asia",
        Session::London => "london",
        Session::NewYork => "new_york",
        Session::OffPeak => "off_peak",
    }
    .to_string()
}

/// Builds the full breakdown report of spec.md §4.6 over `trades`.
pub fn analyze_trades(trades: &[CompletedTrade], starting_equity: f64) -> TradeAnalysis {
    let mut by_direction: HashMap<String, Vec<&CompletedTrade>> = HashMap::new();
    let mut by_exit_type: HashMap<String, Vec<&CompletedTrade>> = HashMap::new();
    let mut by_utc_hour: HashMap<u32, Vec<&CompletedTrade>> = HashMap::new();
    let mut by_weekday: HashMap<String, Vec<&CompletedTrade>> = HashMap::new();
    let mut by_session: HashMap<String, Vec<&CompletedTrade>> = HashMap::new();

    for t in trades {
        by_direction.entry(direction_key(t.direction)).or_default().push(t);
        by_exit_type.entry(exit_key(t.exit_reason)).or_default().push(t);
        let hour = t.entry_ts.hour();
        by_utc_hour.entry(hour).or_default().push(t);
        by_weekday.entry(weekday_key(t.entry_ts.weekday())).or_default().push(t);
        by_session.entry(session_key(Session::for_hour(hour))).or_default().push(t);
    }

    let to_metrics_map = |grouped: HashMap<String, Vec<&CompletedTrade>>| -> HashMap<String, Metrics> {
        grouped
            .into_iter()
            .map(|(k, v)| (k, metrics_for(v.into_iter(), starting_equity)))
            .collect()
    };

    let mut sorted_by_pnl: Vec<&CompletedTrade> = trades.iter().collect();
    sorted_by_pnl.sort_by(|a, b| b.pnl.partial_cmp(&a.pnl).unwrap_or(std::cmp::Ordering::Equal));
    let best_3: Vec<CompletedTrade> = sorted_by_pnl.iter().take(3).map(|t| (*t).clone()).collect();
    let worst_3: Vec<CompletedTrade> = sorted_by_pnl
        .iter()
        .rev()
        .take(3)
        .map(|t| (*t).clone())
        .collect();

    let filter_simulations = build_filter_simulations(trades, starting_equity);
    let walk_forward = build_walk_forward(trades, starting_equity);

    TradeAnalysis {
        by_direction: to_metrics_map(by_direction),
        by_exit_type: to_metrics_map(by_exit_type),
        by_utc_hour: by_utc_hour
            .into_iter()
            .map(|(k, v)| (k, metrics_for(v.into_iter(), starting_equity)))
            .collect(),
        by_weekday: to_metrics_map(by_weekday),
        by_session: to_metrics_map(by_session),
        best_3,
        worst_3,
        filter_simulations,
        walk_forward,
    }
}

/// "What if we excluded X" simulations: long-only, short-only, and excluding
/// the single worst session, so the optimizer can weigh cheap structural
/// filters against a full parameter search.
fn build_filter_simulations(trades: &[CompletedTrade], starting_equity: f64) -> Vec<FilterSimulation> {
    let mut sims = Vec::new();

    let longs: Vec<CompletedTrade> = trades.iter().filter(|t| t.direction == Direction::Long).cloned().collect();
    sims.push(FilterSimulation {
        label: "long_only".into(),
        metrics: compute_metrics(&longs, starting_equity),
    });

    let shorts: Vec<CompletedTrade> = trades.iter().filter(|t| t.direction == Direction::Short).cloned().collect();
    sims.push(FilterSimulation {
        label: "short_only".into(),
        metrics: compute_metrics(&shorts, starting_equity),
    });

    let mut by_session: HashMap<Session, f64> = HashMap::new();
    for t in trades {
        *by_session.entry(Session::for_hour(t.entry_ts.hour())).or_insert(0.0) += t.pnl;
    }
    if let Some((&worst, _)) = by_session.iter().min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal)) {
        let excl: Vec<CompletedTrade> = trades
            .iter()
            .filter(|t| Session::for_hour(t.entry_ts.hour()) != worst)
            .cloned()
            .collect();
        sims.push(FilterSimulation {
            label: format!("exclude_{}", session_key(worst)),
            metrics: compute_metrics(&excl, starting_equity),
        });
    }

    sims
}

/// 70/30 chronological split with train/test profit-factor ratio and an
/// hour-of-day consistency score (spec.md §4.6).
fn build_walk_forward(trades: &[CompletedTrade], starting_equity: f64) -> Option<WalkForwardSplit> {
    if trades.len() < 4 {
        return None;
    }
    let split_at = (trades.len() as f64 * 0.7).round() as usize;
    let (train, test) = trades.split_at(split_at.clamp(1, trades.len() - 1));

    let train_metrics = compute_metrics(train, starting_equity);
    let test_metrics = compute_metrics(test, starting_equity);

    let train_test_pf_ratio = match (train_metrics.profit_factor, test_metrics.profit_factor) {
        (Some(tr), Some(te)) if tr > 0.0 => Some(te / tr),
        _ => None,
    };

    let per_hour_consistency = hour_consistency(train, test);

    Some(WalkForwardSplit {
        train_metrics,
        test_metrics,
        train_test_pf_ratio,
        per_hour_consistency,
    })
}

/// Fraction of hours profitable in `train` that remain profitable in `test`,
/// over the set of hours observed in `train`.
fn hour_consistency(train: &[CompletedTrade], test: &[CompletedTrade]) -> f64 {
    let mut train_hours: HashMap<u32, f64> = HashMap::new();
    for t in train {
        *train_hours.entry(t.entry_ts.hour()).or_insert(0.0) += t.pnl;
    }
    let profitable_train: Vec<u32> = train_hours.iter().filter(|&(_, &pnl)| pnl > 0.0).map(|(&h, _)| h).collect();
    if profitable_train.is_empty() {
        return 0.0;
    }

    let mut test_hours: HashMap<u32, f64> = HashMap::new();
    for t in test {
        *test_hours.entry(t.entry_ts.hour()).or_insert(0.0) += t.pnl;
    }

    let consistent = profitable_train
        .iter()
        .filter(|h| test_hours.get(h).copied().unwrap_or(0.0) > 0.0)
        .count();
    consistent as f64 / profitable_train.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn trade(hour: u32, pnl: f64, direction: Direction, reason: ExitReason) -> CompletedTrade {
        let ts = Utc.with_ymd_and_hms(2026, 1, 5, hour, 0, 0).unwrap();
        CompletedTrade {
            entry_ts: ts,
            exit_ts: ts,
            direction,
            entry_px: 100.0,
            exit_px: 100.0 + pnl,
            pnl,
            r_multiple: Some(pnl / 10.0),
            exit_reason: reason,
        }
    }

    #[test]
    fn session_buckets_match_hour_ranges() {
        assert_eq!(Session::for_hour(2), Session::Asia);
        assert_eq!(Session::for_hour(23), Session::Asia);
        assert_eq!(Session::for_hour(9), Session::London);
        assert_eq!(Session::for_hour(15), Session::NewYork);
        assert_eq!(Session::for_hour(21), Session::OffPeak);
    }

    #[test]
    fn analysis_splits_by_direction_and_exit_type() {
        let trades = vec![
            trade(9, 10.0, Direction::Long, ExitReason::TakeProfit),
            trade(15, -5.0, Direction::Short, ExitReason::StopLoss),
        ];
        let analysis = analyze_trades(&trades, 1000.0);
        assert_eq!(analysis.by_direction["long"].num_trades, 1);
        assert_eq!(analysis.by_exit_type["stop_loss"].num_trades, 1);
        assert_eq!(analysis.by_session["london"].num_trades, 1);
        assert_eq!(analysis.by_session["new_york"].num_trades, 1);
    }

    #[test]
    fn walk_forward_requires_minimum_trade_count() {
        let trades = vec![trade(9, 1.0, Direction::Long, ExitReason::TakeProfit)];
        assert!(analyze_trades(&trades, 1000.0).walk_forward.is_none());
    }
}
