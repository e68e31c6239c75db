//! Keltner-RSI2 mean reversion: Keltner Channel upper/lower extremes gated
//! by a short-period RSI, volume filter on the short side, take-profit at
//! the channel midline, ATR stop, timeout exit (spec.md §4.5).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::candle::{Candle, Interval};
use crate::domain::trading::{Direction, Signal, StrategyParam, TakeProfit};
use crate::indicators;
use crate::strategy::{AnalysisContext, ExitDecision, Strategy};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KeltnerRsi2Params {
    pub ema_period: usize,
    pub atr_period: usize,
    pub atr_mult: f64,
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub volume_sma_period: usize,
    pub short_volume_min_ratio: f64,
    pub timeout_bars: u32,
}

impl Default for KeltnerRsi2Params {
    fn default() -> Self {
        Self {
            ema_period: 20,
            atr_period: 10,
            atr_mult: 2.0,
            rsi_period: 2,
            rsi_oversold: 10.0,
            rsi_overbought: 90.0,
            volume_sma_period: 20,
            short_volume_min_ratio: 1.2,
            timeout_bars: 48,
        }
    }
}

impl KeltnerRsi2Params {
    /// Applies one optimizer-proposed `paramOverrides` entry by field name
    /// (spec.md §4.11 step 7).
    pub fn apply_override(&mut self, name: &str, value: f64) -> bool {
        match name {
            "ema_period" => self.ema_period = value.round().max(1.0) as usize,
            "atr_period" => self.atr_period = value.round().max(1.0) as usize,
            "atr_mult" => self.atr_mult = value,
            "rsi_period" => self.rsi_period = value.round().max(1.0) as usize,
            "rsi_oversold" => self.rsi_oversold = value,
            "rsi_overbought" => self.rsi_overbought = value,
            "volume_sma_period" => self.volume_sma_period = value.round().max(1.0) as usize,
            "short_volume_min_ratio" => self.short_volume_min_ratio = value,
            "timeout_bars" => self.timeout_bars = value.round().max(0.0) as u32,
            _ => return false,
        }
        true
    }
}

pub struct KeltnerRsi2Strategy {
    params: KeltnerRsi2Params,
    kc_upper: Vec<f64>,
    kc_mid: Vec<f64>,
    kc_lower: Vec<f64>,
    rsi: Vec<f64>,
    atr: Vec<f64>,
    volume_sma: Vec<f64>,
    warmup: usize,
}

impl KeltnerRsi2Strategy {
    pub fn new(params: KeltnerRsi2Params) -> Self {
        let warmup = params
            .ema_period
            .max(params.atr_period)
            .max(params.volume_sma_period)
            + params.rsi_period;
        Self {
            params,
            kc_upper: Vec::new(),
            kc_mid: Vec::new(),
            kc_lower: Vec::new(),
            rsi: Vec::new(),
            atr: Vec::new(),
            volume_sma: Vec::new(),
            warmup,
        }
    }
}

impl Strategy for KeltnerRsi2Strategy {
    fn name(&self) -> &str {
        "keltner_rsi2_reversion"
    }

    fn params(&self) -> HashMap<String, StrategyParam> {
        let mut m = HashMap::new();
        m.insert(
            "atr_mult".to_string(),
            StrategyParam {
                value: self.params.atr_mult,
                min: 1.0,
                max: 4.0,
                step: 0.1,
                optimizable: true,
                description: "Keltner channel width in ATRs".into(),
            },
        );
        m.insert(
            "rsi_oversold".to_string(),
            StrategyParam {
                value: self.params.rsi_oversold,
                min: 2.0,
                max: 25.0,
                step: 1.0,
                optimizable: true,
                description: "RSI2 long entry threshold".into(),
            },
        );
        m.insert(
            "short_volume_min_ratio".to_string(),
            StrategyParam {
                value: self.params.short_volume_min_ratio,
                min: 0.8,
                max: 3.0,
                step: 0.1,
                optimizable: true,
                description: "Minimum volume/SMA ratio required for shorts".into(),
            },
        );
        m
    }

    fn required_timeframes(&self) -> Vec<Interval> {
        vec![Interval::H1]
    }

    fn init(&mut self, primary: &[Candle], _higher: &HashMap<Interval, Vec<Candle>>) {
        let kc = indicators::keltner(primary, self.params.ema_period, self.params.atr_period, self.params.atr_mult);
        self.kc_upper = kc.upper;
        self.kc_mid = kc.mid;
        self.kc_lower = kc.lower;

        let closes: Vec<f64> = primary.iter().map(|c| c.c).collect();
        self.rsi = indicators::rsi(&closes, self.params.rsi_period);
        self.atr = indicators::atr(primary, self.params.atr_period);

        let volumes: Vec<f64> = primary.iter().map(|c| c.v).collect();
        self.volume_sma = indicators::sma(&volumes, self.params.volume_sma_period);
    }

    fn on_candle(&mut self, ctx: &AnalysisContext) -> Option<Signal> {
        let i = ctx.index;
        if i < self.warmup_bars() || ctx.position_direction.is_some() {
            return None;
        }

        let upper = *self.kc_upper.get(i)?;
        let lower = *self.kc_lower.get(i)?;
        let mid = *self.kc_mid.get(i)?;
        let rsi_v = *self.rsi.get(i)?;
        let atr_v = *self.atr.get(i)?;
        if [upper, lower, mid, rsi_v, atr_v].iter().any(|v| v.is_nan()) {
            return None;
        }

        let current = ctx.current_candle();

        if current.c < lower && rsi_v <= self.params.rsi_oversold {
            return Some(Signal {
                direction: Direction::Long,
                entry_price: None,
                stop_loss: current.c - self.params.atr_mult * atr_v,
                take_profits: vec![TakeProfit { price: mid, pct_of_position: 1.0 }],
                comment: "keltner lower band + RSI2 oversold".into(),
            });
        }

        if current.c > upper && rsi_v >= self.params.rsi_overbought {
            let vol_sma = *self.volume_sma.get(i)?;
            if vol_sma <= 0.0 || current.v / vol_sma < self.params.short_volume_min_ratio {
                return None;
            }
            return Some(Signal {
                direction: Direction::Short,
                entry_price: None,
                stop_loss: current.c + self.params.atr_mult * atr_v,
                take_profits: vec![TakeProfit { price: mid, pct_of_position: 1.0 }],
                comment: "keltner upper band + RSI2 overbought, volume confirmed".into(),
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

    fn warmup_bars(&self) -> usize {
        self.warmup
    }
}
