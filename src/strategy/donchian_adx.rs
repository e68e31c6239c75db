//! Donchian-ADX breakout: daily EMA50 regime filter, 1h ATR stop, Donchian
//! fast/slow breakout entries, ADX consolidation gate, ATR trailing stop,
//! timeout exit (spec.md §4.5, reference implementation).
//!
//! The indicator choice is illustrative, not mandated; only the interface
//! contract and the bar-completion rule are spec requirements.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::candle::{Candle, Interval};
use crate::domain::trading::{Direction, Signal, StrategyParam, TakeProfit};
use crate::indicators;
use crate::strategy::{completed_higher_timeframe_value, AnalysisContext, ExitDecision, Strategy};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DonchianAdxParams {
    pub donchian_fast: usize,
    pub donchian_slow: usize,
    pub adx_period: usize,
    pub adx_max_for_entry: f64,
    pub atr_period: usize,
    pub atr_stop_mult: f64,
    pub atr_trail_mult: f64,
    pub daily_ema_period: usize,
    pub timeout_bars: u32,
}

impl Default for DonchianAdxParams {
    fn default() -> Self {
        Self {
            donchian_fast: 20,
            donchian_slow: 55,
            adx_period: 14,
            adx_max_for_entry: 20.0,
            atr_period: 14,
            atr_stop_mult: 2.0,
            atr_trail_mult: 3.0,
            daily_ema_period: 50,
            timeout_bars: 200,
        }
    }
}

impl DonchianAdxParams {
    /// Applies one optimizer-proposed `paramOverrides` entry by field name
    /// (spec.md §4.11 step 7). Returns `false` for an unknown name so the
    /// caller can log it rather than silently drop the override.
    pub fn apply_override(&mut self, name: &str, value: f64) -> bool {
        match name {
            "donchian_fast" => self.donchian_fast = value.round().max(1.0) as usize,
            "donchian_slow" => self.donchian_slow = value.round().max(1.0) as usize,
            "adx_period" => self.adx_period = value.round().max(1.0) as usize,
            "adx_max_for_entry" => self.adx_max_for_entry = value,
            "atr_period" => self.atr_period = value.round().max(1.0) as usize,
            "atr_stop_mult" => self.atr_stop_mult = value,
            "atr_trail_mult" => self.atr_trail_mult = value,
            "daily_ema_period" => self.daily_ema_period = value.round().max(1.0) as usize,
            "timeout_bars" => self.timeout_bars = value.round().max(0.0) as u32,
            _ => return false,
        }
        true
    }
}

pub struct DonchianAdxStrategy {
    params: DonchianAdxParams,
    donchian_fast: Vec<f64>,
    donchian_fast_low: Vec<f64>,
    donchian_slow: Vec<f64>,
    adx: Vec<f64>,
    atr: Vec<f64>,
    daily_ema: Vec<f64>,
    warmup: usize,
}

impl DonchianAdxStrategy {
    pub fn new(params: DonchianAdxParams) -> Self {
        let warmup = params
            .donchian_slow
            .max(params.adx_period * 2)
            .max(params.atr_period);
        Self {
            params,
            donchian_fast: Vec::new(),
            donchian_fast_low: Vec::new(),
            donchian_slow: Vec::new(),
            adx: Vec::new(),
            atr: Vec::new(),
            daily_ema: Vec::new(),
            warmup,
        }
    }
}

impl Strategy for DonchianAdxStrategy {
    fn name(&self) -> &str {
        "donchian_adx_breakout"
    }

    fn params(&self) -> HashMap<String, StrategyParam> {
        let mut m = HashMap::new();
        m.insert(
            "donchian_fast".to_string(),
            StrategyParam {
                value: self.params.donchian_fast as f64,
                min: 5.0,
                max: 60.0,
                step: 1.0,
                optimizable: true,
                description: "Fast Donchian breakout lookback".into(),
            },
        );
        m.insert(
            "atr_stop_mult".to_string(),
            StrategyParam {
                value: self.params.atr_stop_mult,
                min: 1.0,
                max: 5.0,
                step: 0.1,
                optimizable: true,
                description: "Initial stop distance in ATRs".into(),
            },
        );
        m.insert(
            "adx_max_for_entry".to_string(),
            StrategyParam {
                value: self.params.adx_max_for_entry,
                min: 10.0,
                max: 40.0,
                step: 1.0,
                optimizable: true,
                description: "Max ADX treated as consolidation gate".into(),
            },
        );
        m
    }

    fn required_timeframes(&self) -> Vec<Interval> {
        vec![Interval::H1, Interval::D1]
    }

    fn init(&mut self, primary: &[Candle], higher: &HashMap<Interval, Vec<Candle>>) {
        let d = indicators::donchian(primary, self.params.donchian_fast);
        self.donchian_fast = d.upper;
        self.donchian_fast_low = d.lower;
        self.donchian_slow = indicators::donchian(primary, self.params.donchian_slow).upper;
        let adx_out = indicators::adx(primary, self.params.adx_period);
        self.adx = adx_out.adx;
        self.atr = indicators::atr(primary, self.params.atr_period);

        if let Some(daily) = higher.get(&Interval::D1) {
            let closes: Vec<f64> = daily.iter().map(|c| c.c).collect();
            self.daily_ema = indicators::ema(&closes, self.params.daily_ema_period);
        }
    }

    fn on_candle(&mut self, ctx: &AnalysisContext) -> Option<Signal> {
        let i = ctx.index;
        if i < self.warmup_bars() || ctx.position_direction.is_some() {
            return None;
        }

        let atr_v = *self.atr.get(i)?;
        let adx_v = *self.adx.get(i)?;
        if atr_v.is_nan() || adx_v.is_nan() || adx_v > self.params.adx_max_for_entry {
            return None;
        }

        let daily_candles = ctx.higher_timeframes.get(&Interval::D1)?;
        let regime = completed_higher_timeframe_value(
            daily_candles,
            &self.daily_ema,
            Interval::D1,
            ctx.current_candle().t,
        )?;

        let current = ctx.current_candle();
        let upper = *self.donchian_slow.get(i)?;
        let lower = *self.donchian_fast_low.get(i)?;
        if upper.is_nan() || lower.is_nan() {
            return None;
        }

        if current.c > upper && current.c > regime {
            let stop = current.c - self.params.atr_stop_mult * atr_v;
            return Some(Signal {
                direction: Direction::Long,
                entry_price: None,
                stop_loss: stop,
                take_profits: vec![TakeProfit { price: current.c + 4.0 * atr_v, pct_of_position: 1.0 }],
                comment: "donchian breakout above daily regime".into(),
            });
        }
        if current.c < lower && current.c < regime {
            let stop = current.c + self.params.atr_stop_mult * atr_v;
            return Some(Signal {
                direction: Direction::Short,
                entry_price: None,
                stop_loss: stop,
                take_profits: vec![TakeProfit { price: current.c - 4.0 * atr_v, pct_of_position: 1.0 }],
                comment: "donchian breakdown below daily regime".into(),
            });
        }
        None
    }

    fn should_exit(&mut self, ctx: &AnalysisContext) -> Option<ExitDecision> {
        let entry_idx = ctx.position_entry_bar_index?;
        if (ctx.index - entry_idx) as u32 >= self.params.timeout_bars {
            return Some(ExitDecision {
                exit: true,
                comment: Some("timeout exit".into()),
            });
        }
        None
    }

    fn get_exit_level(&mut self, ctx: &AnalysisContext) -> Option<f64> {
        let atr_v = *self.atr.get(ctx.index)?;
        if atr_v.is_nan() {
            return None;
        }
        let current = ctx.current_candle();
        match ctx.position_direction? {
            Direction::Long => Some(current.c - self.params.atr_trail_mult * atr_v),
            Direction::Short => Some(current.c + self.params.atr_trail_mult * atr_v),
        }
    }

    fn warmup_bars(&self) -> usize {
        self.warmup
    }
}
