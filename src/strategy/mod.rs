//! Bar-indexed strategy contract (spec.md §4.5, C5).

pub mod donchian_adx;
pub mod ema_pullback;
pub mod keltner_rsi2;

use std::collections::HashMap;

use crate::domain::candle::{Candle, Interval};
use crate::domain::trading::{Direction, Signal, StrategyParam};

/// Finds, scanning from newest to oldest, the largest `j` such that
/// `hCandles[j].t + H <= primary_t` and `values[j]` is not `NaN`. This is the
/// higher-timeframe bar-completion rule of spec.md §4.5: a bar is usable
/// only once its close is known to have preceded the primary timestamp.
pub fn completed_higher_timeframe_value(
    h_candles: &[Candle],
    values: &[f64],
    higher_interval: Interval,
    primary_t: i64,
) -> Option<f64> {
    let h_ms = higher_interval.millis().unwrap_or(30 * 24 * 3_600_000);
    for j in (0..h_candles.len()).rev() {
        if h_candles[j].t + h_ms <= primary_t {
            let v = values[j];
            if !v.is_nan() {
                return Some(v);
            }
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct ExitDecision {
    pub exit: bool,
    pub comment: Option<String>,
}

/// `ctx` passed to every strategy callback (spec.md §4.5).
pub struct AnalysisContext<'a> {
    pub candles: &'a [Candle],
    pub index: usize,
    pub higher_timeframes: &'a HashMap<Interval, Vec<Candle>>,
    pub position_direction: Option<Direction>,
    pub position_entry_price: Option<f64>,
    pub position_entry_bar_index: Option<usize>,
    pub daily_pnl: f64,
    pub trades_today: u32,
    pub bars_since_exit: u32,
    pub consecutive_losses: u32,
}

impl<'a> AnalysisContext<'a> {
    pub fn current_candle(&self) -> &Candle {
        &self.candles[self.index]
    }
}

/// The contract every strategy implementation satisfies. Strategies are
/// single-threaded, bar-indexed, and must never look ahead of `ctx.index`.
pub trait Strategy: Send {
    fn name(&self) -> &str;
    fn params(&self) -> HashMap<String, StrategyParam>;
    fn required_timeframes(&self) -> Vec<Interval>;

    /// Optional precomputation hook over the full owned candle set.
    fn init(&mut self, _primary: &[Candle], _higher: &HashMap<Interval, Vec<Candle>>) {}

    /// Invoked for each fully closed bar index. Must return `None` below the
    /// strategy's warmup index (spec.md §4.5 "Warmup guard").
    fn on_candle(&mut self, ctx: &AnalysisContext) -> Option<Signal>;

    /// Invoked each bar when a position is open.
    fn should_exit(&mut self, ctx: &AnalysisContext) -> Option<ExitDecision>;

    /// The current trailing-stop level, if the strategy provides one (C14).
    fn get_exit_level(&mut self, _ctx: &AnalysisContext) -> Option<f64> {
        None
    }

    /// The smallest primary bar index at which this strategy's indicators
    /// are defined.
    fn warmup_bars(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(t: i64) -> Candle {
        Candle { t, o: 1.0, h: 1.0, l: 1.0, c: 1.0, v: 1.0, n: 1 }
    }

    #[test]
    fn completed_value_excludes_bars_not_yet_closed() {
        // Primary t = 1_700_000_000_000 (15m). Daily candles aggregated from
        // primary; only a fully-elapsed 1d bar may be used (spec.md §8 scenario 5).
        let day_ms = 86_400_000;
        let primary_t = 1_700_000_000_000i64;
        let h_candles = vec![candle(primary_t - 2 * day_ms), candle(primary_t - day_ms / 2)];
        let values = vec![10.0, 20.0];

        let naive_last = values.last().copied();
        let correct = completed_higher_timeframe_value(&h_candles, &values, Interval::D1, primary_t);

        // The naive "last value" (20.0, from a bar not yet closed relative to
        // primary_t) must differ from the correct completed-bar value (10.0).
        assert_eq!(naive_last, Some(20.0));
        assert_eq!(correct, Some(10.0));
    }

    #[test]
    fn completed_value_skips_nan_entries() {
        let day_ms = 86_400_000;
        let primary_t = 10 * day_ms;
        let h_candles = vec![candle(0), candle(day_ms), candle(2 * day_ms)];
        let values = vec![1.0, f64::NAN, 3.0];
        let v = completed_higher_timeframe_value(&h_candles, &values, Interval::D1, primary_t);
        assert_eq!(v, Some(3.0));
    }

    #[test]
    fn completed_value_is_none_when_nothing_qualifies() {
        let day_ms = 86_400_000;
        let h_candles = vec![candle(0)];
        let values = vec![1.0];
        let v = completed_higher_timeframe_value(&h_candles, &values, Interval::D1, day_ms / 2);
        assert_eq!(v, None);
    }
}
