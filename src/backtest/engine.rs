//! Bar-by-bar backtest loop (spec.md §4.6, C6).

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::candle::{aggregate_ohlc, Candle, Interval};
use crate::domain::trading::{Direction, Signal};
use crate::strategy::{AnalysisContext, Strategy};

#[derive(Debug, Clone, Copy)]
pub struct BacktestConfig {
    pub risk_per_trade_usd: f64,
    pub max_trades_per_day: u32,
    pub max_daily_loss_usd: f64,
    pub cooldown_bars: u32,
    pub starting_equity: f64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            risk_per_trade_usd: 50.0,
            max_trades_per_day: 10,
            max_daily_loss_usd: 500.0,
            cooldown_bars: 2,
            starting_equity: 10_000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    StrategyExit,
    Timeout,
    EndOfData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedTrade {
    pub entry_ts: DateTime<Utc>,
    pub exit_ts: DateTime<Utc>,
    pub direction: Direction,
    pub entry_px: f64,
    pub exit_px: f64,
    pub pnl: f64,
    pub r_multiple: Option<f64>,
    pub exit_reason: ExitReason,
}

struct OpenPosition {
    direction: Direction,
    entry_price: f64,
    entry_bar_index: usize,
    entry_ts: DateTime<Utc>,
    size: f64,
    stop_loss: f64,
    take_profit: Option<f64>,
    initial_risk_per_unit: f64,
}

/// Groups `primary` into `target`-interval buckets via `aggregate_ohlc`, one
/// bucket per `floor(t / target.millis())` — spec.md §4.6 step 1.
pub fn aggregate_to_interval(primary: &[Candle], target: Interval) -> Vec<Candle> {
    let bucket_ms = match target.millis() {
        Some(ms) => ms,
        None => return Vec::new(),
    };
    let mut buckets: Vec<(i64, Vec<Candle>)> = Vec::new();
    for &candle in primary {
        let bucket_start = candle.t - candle.t.rem_euclid(bucket_ms);
        match buckets.last_mut() {
            Some((b, bars)) if *b == bucket_start => bars.push(candle),
            _ => buckets.push((bucket_start, vec![candle])),
        }
    }
    buckets
        .into_iter()
        .filter_map(|(_, bars)| aggregate_ohlc(&bars))
        .collect()
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn epoch_day(ms: i64) -> i64 {
    ms.div_euclid(86_400_000)
}

/// Runs `strategy` over the full `primary` candle series and returns every
/// completed trade, in bar order (spec.md §4.6).
pub fn run_backtest(
    strategy: &mut dyn Strategy,
    primary: &[Candle],
    config: &BacktestConfig,
) -> Vec<CompletedTrade> {
    let mut higher_timeframes: HashMap<Interval, Vec<Candle>> = HashMap::new();
    for tf in strategy.required_timeframes() {
        if tf.is_higher_than(Interval::M1) {
            higher_timeframes.insert(tf, aggregate_to_interval(primary, tf));
        }
    }
    strategy.init(primary, &higher_timeframes);

    let mut trades = Vec::new();
    let mut position: Option<OpenPosition> = None;
    let mut daily_pnl = 0.0;
    let mut trades_today: u32 = 0;
    let mut bars_since_exit: u32 = u32::MAX / 2;
    let mut consecutive_losses: u32 = 0;
    let mut current_day = primary.first().map(|c| epoch_day(c.t));

    for i in 0..primary.len() {
        let candle = primary[i];
        let day = epoch_day(candle.t);
        if Some(day) != current_day {
            current_day = Some(day);
            daily_pnl = 0.0;
            trades_today = 0;
        }

        let ctx = AnalysisContext {
            candles: primary,
            index: i,
            higher_timeframes: &higher_timeframes,
            position_direction: position.as_ref().map(|p| p.direction),
            position_entry_price: position.as_ref().map(|p| p.entry_price),
            position_entry_bar_index: position.as_ref().map(|p| p.entry_bar_index),
            daily_pnl,
            trades_today,
            bars_since_exit,
            consecutive_losses,
        };

        if let Some(pos) = &position {
            let (hit, exit_px, reason) = intrabar_exit(pos, &candle);
            let exit_decision = if !hit { strategy.should_exit(&ctx) } else { None };
            let new_stop = if !hit { strategy.get_exit_level(&ctx) } else { None };

            if hit {
                close_position(&mut trades, &mut position, exit_px, candle.t, reason, &mut daily_pnl, &mut consecutive_losses);
                bars_since_exit = 0;
            } else if let Some(decision) = exit_decision {
                if decision.exit {
                    close_position(&mut trades, &mut position, candle.c, candle.t, ExitReason::StrategyExit, &mut daily_pnl, &mut consecutive_losses);
                    bars_since_exit = 0;
                }
            } else if let Some(level) = new_stop {
                if let Some(pos) = &mut position {
                    let epsilon = pos.entry_price.abs() * 1e-6;
                    let better = match pos.direction {
                        Direction::Long => level > pos.stop_loss + epsilon,
                        Direction::Short => level < pos.stop_loss - epsilon,
                    };
                    if better {
                        pos.stop_loss = level;
                    }
                }
            }
        } else {
            bars_since_exit = bars_since_exit.saturating_add(1);
            let can_trade = trades_today < config.max_trades_per_day
                && daily_pnl > -config.max_daily_loss_usd
                && bars_since_exit >= config.cooldown_bars;

            if can_trade {
                if let Some(signal) = strategy.on_candle(&ctx) {
                    if signal.validate(candle.c).is_ok() {
                        if let Some(opened) = open_position(&signal, &candle, i, config) {
                            position = Some(opened);
                            trades_today += 1;
                        }
                    }
                }
            }
        }
    }

    if let Some(pos) = position.take() {
        let last = primary.last().expect("position open implies at least one bar");
        let pnl = realized_pnl(&pos, last.c);
        trades.push(CompletedTrade {
            entry_ts: pos.entry_ts,
            exit_ts: millis_to_datetime(last.t),
            direction: pos.direction,
            entry_px: pos.entry_price,
            exit_px: last.c,
            pnl,
            r_multiple: r_multiple(&pos, pnl),
            exit_reason: ExitReason::EndOfData,
        });
    }

    trades
}

fn intrabar_exit(pos: &OpenPosition, candle: &Candle) -> (bool, f64, ExitReason) {
    match pos.direction {
        Direction::Long => {
            if candle.l <= pos.stop_loss {
                return (true, pos.stop_loss, ExitReason::StopLoss);
            }
            if let Some(tp) = pos.take_profit {
                if candle.h >= tp {
                    return (true, tp, ExitReason::TakeProfit);
                }
            }
        }
        Direction::Short => {
            if candle.h >= pos.stop_loss {
                return (true, pos.stop_loss, ExitReason::StopLoss);
            }
            if let Some(tp) = pos.take_profit {
                if candle.l <= tp {
                    return (true, tp, ExitReason::TakeProfit);
                }
            }
        }
    }
    (false, 0.0, ExitReason::EndOfData)
}

fn realized_pnl(pos: &OpenPosition, exit_px: f64) -> f64 {
    match pos.direction {
        Direction::Long => (exit_px - pos.entry_price) * pos.size,
        Direction::Short => (pos.entry_price - exit_px) * pos.size,
    }
}

fn r_multiple(pos: &OpenPosition, pnl: f64) -> Option<f64> {
    if pos.initial_risk_per_unit <= 0.0 {
        return None;
    }
    let risk_usd = pos.initial_risk_per_unit * pos.size;
    if risk_usd <= 0.0 {
        return None;
    }
    Some(pnl / risk_usd)
}

fn close_position(
    trades: &mut Vec<CompletedTrade>,
    position: &mut Option<OpenPosition>,
    exit_px: f64,
    exit_ms: i64,
    reason: ExitReason,
    daily_pnl: &mut f64,
    consecutive_losses: &mut u32,
) {
    if let Some(pos) = position.take() {
        let pnl = realized_pnl(&pos, exit_px);
        *daily_pnl += pnl;
        if pnl < 0.0 {
            *consecutive_losses += 1;
        } else {
            *consecutive_losses = 0;
        }
        trades.push(CompletedTrade {
            entry_ts: pos.entry_ts,
            exit_ts: millis_to_datetime(exit_ms),
            direction: pos.direction,
            entry_px: pos.entry_price,
            exit_px,
            pnl,
            r_multiple: r_multiple(&pos, pnl),
            exit_reason: reason,
        });
    }
}

/// Sizes and opens a position from a validated `Signal` (spec.md §4.6 step 3,
/// §4.12 step 7 risk-mode sizing).
fn open_position(
    signal: &Signal,
    candle: &Candle,
    bar_index: usize,
    config: &BacktestConfig,
) -> Option<OpenPosition> {
    let entry_price = match signal.entry_price {
        Some(limit_price) => {
            // A limit order fills within the same bar only if touched.
            let touched = match signal.direction {
                Direction::Long => candle.l <= limit_price,
                Direction::Short => candle.h >= limit_price,
            };
            if !touched {
                return None;
            }
            limit_price
        }
        None => candle.c,
    };

    let risk_per_unit = (entry_price - signal.stop_loss).abs();
    if risk_per_unit <= 0.0 {
        return None;
    }
    let size = config.risk_per_trade_usd / risk_per_unit;
    if size <= 0.0 {
        return None;
    }

    let take_profit = signal.take_profits.first().map(|tp| tp.price);

    Some(OpenPosition {
        direction: signal.direction,
        entry_price,
        entry_bar_index: bar_index,
        entry_ts: millis_to_datetime(candle.t),
        size,
        stop_loss: signal.stop_loss,
        take_profit,
        initial_risk_per_unit: risk_per_unit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trading::{StrategyParam, TakeProfit};
    use crate::strategy::ExitDecision;
    use std::collections::HashMap as Map;

    fn candle(t: i64, o: f64, h: f64, l: f64, c: f64) -> Candle {
        Candle { t, o, h, l, c, v: 100.0, n: 1 }
    }

    struct AlwaysLongThenStop {
        entered: bool,
    }

    impl Strategy for AlwaysLongThenStop {
        fn name(&self) -> &str {
            "test_always_long"
        }
        fn params(&self) -> Map<String, StrategyParam> {
            Map::new()
        }
        fn required_timeframes(&self) -> Vec<Interval> {
            vec![]
        }
        fn on_candle(&mut self, ctx: &AnalysisContext) -> Option<Signal> {
            if self.entered {
                return None;
            }
            self.entered = true;
            let c = ctx.current_candle();
            Some(Signal {
                direction: Direction::Long,
                entry_price: None,
                stop_loss: c.c - 5.0,
                take_profits: vec![TakeProfit { price: c.c + 20.0, pct_of_position: 1.0 }],
                comment: "test entry".into(),
            })
        }
        fn should_exit(&mut self, _ctx: &AnalysisContext) -> Option<ExitDecision> {
            None
        }
        fn warmup_bars(&self) -> usize {
            0
        }
    }

    #[test]
    fn stop_loss_closes_position_at_stop_price() {
        let candles = vec![
            candle(0, 100.0, 101.0, 99.0, 100.0),
            candle(60_000, 100.0, 101.0, 94.0, 95.0), // wicks through stop at 95
        ];
        let mut strategy = AlwaysLongThenStop { entered: false };
        let trades = run_backtest(&mut strategy, &candles, &BacktestConfig::default());
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, ExitReason::StopLoss);
        assert_eq!(trades[0].exit_px, 95.0);
        assert!(trades[0].pnl < 0.0);
    }

    #[test]
    fn open_position_at_end_of_data_is_closed_at_last_close() {
        let candles = vec![
            candle(0, 100.0, 101.0, 99.0, 100.0),
            candle(60_000, 100.0, 105.0, 99.0, 104.0),
        ];
        let mut strategy = AlwaysLongThenStop { entered: false };
        let trades = run_backtest(&mut strategy, &candles, &BacktestConfig::default());
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, ExitReason::EndOfData);
        assert_eq!(trades[0].exit_px, 104.0);
    }

    #[test]
    fn aggregate_to_interval_buckets_by_floor_division() {
        let candles = vec![
            candle(0, 1.0, 2.0, 0.5, 1.5),
            candle(60_000 * 30, 1.5, 3.0, 1.0, 2.0),
            candle(60_000 * 61, 2.0, 2.5, 1.8, 2.2),
        ];
        let hourly = aggregate_to_interval(&candles, Interval::H1);
        assert_eq!(hourly.len(), 2);
        assert_eq!(hourly[0].h, 3.0);
        assert_eq!(hourly[0].c, 2.0);
    }

    #[test]
    fn daily_trade_cap_blocks_further_entries_same_day() {
        struct AlwaysSignal;
        impl Strategy for AlwaysSignal {
            fn name(&self) -> &str {
                "always_signal"
            }
            fn params(&self) -> Map<String, StrategyParam> {
                Map::new()
            }
            fn required_timeframes(&self) -> Vec<Interval> {
                vec![]
            }
            fn on_candle(&mut self, ctx: &AnalysisContext) -> Option<Signal> {
                let c = ctx.current_candle();
                Some(Signal {
                    direction: Direction::Long,
                    entry_price: None,
                    stop_loss: c.c - 1.0,
                    take_profits: vec![],
                    comment: "always".into(),
                })
            }
            fn should_exit(&mut self, _ctx: &AnalysisContext) -> Option<ExitDecision> {
                Some(ExitDecision { exit: true, comment: None })
            }
            fn warmup_bars(&self) -> usize {
                0
            }
        }
        let candles: Vec<Candle> = (0..5).map(|i| candle(i * 60_000, 10.0, 11.0, 9.0, 10.0)).collect();
        let mut strategy = AlwaysSignal;
        let config = BacktestConfig { max_trades_per_day: 2, cooldown_bars: 0, ..BacktestConfig::default() };
        let trades = run_backtest(&mut strategy, &candles, &config);
        assert!(trades.len() <= 2);
    }
}
