//! EMA-pullback continuation: 4h EMA regime filter, 1h ATR stop, entries on
//! a pullback into the primary-timeframe EMA followed by a recovery close
//! (spec.md §4.5).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::candle::{Candle, Interval};
use crate::domain::trading::{Direction, Signal, StrategyParam, TakeProfit};
use crate::indicators;
use crate::strategy::{completed_higher_timeframe_value, AnalysisContext, ExitDecision, Strategy};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EmaPullbackParams {
    pub regime_ema_period: usize,
    pub primary_ema_period: usize,
    pub atr_period: usize,
    pub atr_stop_mult: f64,
    pub reward_risk_ratio: f64,
    pub pullback_tolerance_pct: f64,
    pub timeout_bars: u32,
}

impl Default for EmaPullbackParams {
    fn default() -> Self {
        Self {
            regime_ema_period: 21,
            primary_ema_period: 21,
            atr_period: 14,
            atr_stop_mult: 1.5,
            reward_risk_ratio: 2.0,
            pullback_tolerance_pct: 0.3,
            timeout_bars: 96,
        }
    }
}

impl EmaPullbackParams {
    /// Applies one optimizer-proposed `paramOverrides` entry by field name
    /// (spec.md §4.11 step 7).
    pub fn apply_override(&mut self, name: &str, value: f64) -> bool {
        match name {
            "regime_ema_period" => self.regime_ema_period = value.round().max(1.0) as usize,
            "primary_ema_period" => self.primary_ema_period = value.round().max(1.0) as usize,
            "atr_period" => self.atr_period = value.round().max(1.0) as usize,
            "atr_stop_mult" => self.atr_stop_mult = value,
            "reward_risk_ratio" => self.reward_risk_ratio = value,
            "pullback_tolerance_pct" => self.pullback_tolerance_pct = value,
            "timeout_bars" => self.timeout_bars = value.round().max(0.0) as u32,
            _ => return false,
        }
        true
    }
}

pub struct EmaPullbackStrategy {
    params: EmaPullbackParams,
    primary_ema: Vec<f64>,
    atr: Vec<f64>,
    regime_ema: Vec<f64>,
    warmup: usize,
}

impl EmaPullbackStrategy {
    pub fn new(params: EmaPullbackParams) -> Self {
        let warmup = params.primary_ema_period.max(params.atr_period);
        Self {
            params,
            primary_ema: Vec::new(),
            atr: Vec::new(),
            regime_ema: Vec::new(),
            warmup,
        }
    }

    fn near_ema(&self, price: f64, ema_v: f64) -> bool {
        let tolerance = ema_v.abs() * self.params.pullback_tolerance_pct / 100.0;
        (price - ema_v).abs() <= tolerance
    }
}

impl Strategy for EmaPullbackStrategy {
    fn name(&self) -> &str {
        "ema_pullback_continuation"
    }

    fn params(&self) -> HashMap<String, StrategyParam> {
        let mut m = HashMap::new();
        m.insert(
            "primary_ema_period".to_string(),
            StrategyParam {
                value: self.params.primary_ema_period as f64,
                min: 8.0,
                max: 55.0,
                step: 1.0,
                optimizable: true,
                description: "Primary-timeframe EMA used for pullback entries".into(),
            },
        );
        m.insert(
            "atr_stop_mult".to_string(),
            StrategyParam {
                value: self.params.atr_stop_mult,
                min: 0.5,
                max: 4.0,
                step: 0.1,
                optimizable: true,
                description: "Initial stop distance in ATRs".into(),
            },
        );
        m.insert(
            "reward_risk_ratio".to_string(),
            StrategyParam {
                value: self.params.reward_risk_ratio,
                min: 1.0,
                max: 5.0,
                step: 0.1,
                optimizable: true,
                description: "Take-profit distance as a multiple of stop distance".into(),
            },
        );
        m
    }

    fn required_timeframes(&self) -> Vec<Interval> {
        vec![Interval::H1, Interval::H4]
    }

    fn init(&mut self, primary: &[Candle], higher: &HashMap<Interval, Vec<Candle>>) {
        let closes: Vec<f64> = primary.iter().map(|c| c.c).collect();
        self.primary_ema = indicators::ema(&closes, self.params.primary_ema_period);
        self.atr = indicators::atr(primary, self.params.atr_period);

        if let Some(regime) = higher.get(&Interval::H4) {
            let regime_closes: Vec<f64> = regime.iter().map(|c| c.c).collect();
            self.regime_ema = indicators::ema(&regime_closes, self.params.regime_ema_period);
        }
    }

    fn on_candle(&mut self, ctx: &AnalysisContext) -> Option<Signal> {
        let i = ctx.index;
        if i < self.warmup_bars() + 1 || ctx.position_direction.is_some() {
            return None;
        }

        let ema_v = *self.primary_ema.get(i)?;
        let atr_v = *self.atr.get(i)?;
        let prev_ema = *self.primary_ema.get(i - 1)?;
        if ema_v.is_nan() || atr_v.is_nan() || prev_ema.is_nan() {
            return None;
        }

        let regime_candles = ctx.higher_timeframes.get(&Interval::H4)?;
        let regime_v = completed_higher_timeframe_value(
            regime_candles,
            &self.regime_ema,
            Interval::H4,
            ctx.current_candle().t,
        )?;

        let prev = &ctx.candles[i - 1];
        let current = ctx.current_candle();
        let stop_dist = self.params.atr_stop_mult * atr_v;

        // Uptrend regime: wait for a pullback into the primary EMA, then a
        // recovery close above both the EMA and the prior bar's high.
        if current.c > regime_v {
            let pulled_back = prev.l <= prev_ema || self.near_ema(prev.c, prev_ema);
            if pulled_back && current.c > ema_v && current.c > prev.h {
                return Some(Signal {
                    direction: Direction::Long,
                    entry_price: None,
                    stop_loss: current.c - stop_dist,
                    take_profits: vec![TakeProfit {
                        price: current.c + stop_dist * self.params.reward_risk_ratio,
                        pct_of_position: 1.0,
                    }],
                    comment: "pullback into EMA, recovery above regime".into(),
                });
            }
        }

        if current.c < regime_v {
            let pulled_back = prev.h >= prev_ema || self.near_ema(prev.c, prev_ema);
            if pulled_back && current.c < ema_v && current.c < prev.l {
                return Some(Signal {
                    direction: Direction::Short,
                    entry_price: None,
                    stop_loss: current.c + stop_dist,
                    take_profits: vec![TakeProfit {
                        price: current.c - stop_dist * self.params.reward_risk_ratio,
                        pct_of_position: 1.0,
                    }],
                    comment: "pullback into EMA, breakdown below regime".into(),
                });
            }
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

    fn warmup_bars(&self) -> usize {
        self.warmup
    }
}
