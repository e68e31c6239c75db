//! Admission guardrail gate (spec.md §4.12, C12).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;

use crate::config::{RiskConfig, SizingMode};
use crate::domain::errors::RiskViolation;
use crate::domain::ports::Dedup;
use crate::domain::repositories::SignalRepository;
use crate::domain::trading::{Signal, StoredSignal, StrategyParam};

/// Everything the gate needs about the account/runner state at evaluation
/// time, gathered by the caller (position book, daily counters, strategy
/// param table).
pub struct GateContext<'a> {
    pub coin: &'a str,
    pub strategy: &'a str,
    pub auto_trading_enabled: bool,
    pub trades_today: u32,
    pub daily_pnl: f64,
    pub open_positions: usize,
    pub position_open_for_coin: bool,
    pub bars_since_exit: u32,
    pub current_price: Option<f64>,
    pub size_decimals: u32,
    pub requested_leverage: f64,
    pub requested_overrides: &'a HashMap<String, f64>,
    pub strategy_params: &'a HashMap<String, StrategyParam>,
}

fn round_down(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).floor() / factor
}

/// Steps 2-10 of spec.md §4.12 (everything but the async idempotency check
/// and persistence, which `admit` layers on top). Returns the rounded
/// position size on success.
pub fn evaluate_guardrails(
    ctx: &GateContext,
    signal: &Signal,
    config: &RiskConfig,
) -> Result<f64, RiskViolation> {
    let current_price = ctx.current_price.ok_or(RiskViolation::NoMarketPrice)?;
    signal.validate(current_price)?;

    if !ctx.auto_trading_enabled {
        return Err(RiskViolation::AutoTradingDisabled {
            coin: ctx.coin.to_string(),
            strategy: ctx.strategy.to_string(),
        });
    }

    if ctx.trades_today >= config.max_trades_per_day {
        return Err(RiskViolation::DailyTradeCap {
            count: ctx.trades_today,
            max: config.max_trades_per_day,
        });
    }

    if ctx.daily_pnl <= -config.max_daily_loss_usd {
        return Err(RiskViolation::DailyLossLimit {
            loss_usd: ctx.daily_pnl,
            max_usd: config.max_daily_loss_usd,
        });
    }

    if ctx.open_positions >= config.max_open_positions {
        return Err(RiskViolation::OpenPositionCap {
            count: ctx.open_positions,
            max: config.max_open_positions,
        });
    }
    if ctx.position_open_for_coin {
        return Err(RiskViolation::PositionAlreadyOpen {
            coin: ctx.coin.to_string(),
        });
    }

    let entry = signal.entry_price.unwrap_or(current_price);
    let raw_size = match config.sizing_mode {
        SizingMode::Risk => config.risk_per_trade_usd / (entry - signal.stop_loss).abs(),
        SizingMode::Cash => config.cash_per_trade / entry,
    };
    let size = round_down(raw_size, ctx.size_decimals);
    if size <= 0.0 {
        return Err(RiskViolation::ZeroSize);
    }

    if ctx.requested_leverage > config.max_leverage {
        return Err(RiskViolation::LeverageCap {
            leverage: ctx.requested_leverage,
            max: config.max_leverage,
        });
    }
    let notional = size * entry * ctx.requested_leverage;
    if notional > config.max_notional_usd {
        return Err(RiskViolation::NotionalCap {
            notional,
            max: config.max_notional_usd,
        });
    }

    if ctx.bars_since_exit < config.cooldown_bars {
        return Err(RiskViolation::Cooldown {
            bars_since_exit: ctx.bars_since_exit,
            cooldown_bars: config.cooldown_bars,
        });
    }

    for (field, _) in ctx.requested_overrides {
        if config.protected_fields.iter().any(|p| p == field) {
            return Err(RiskViolation::ProtectedFieldChanged {
                field: field.clone(),
            });
        }
    }
    for (name, value) in ctx.requested_overrides {
        if let Some(param) = ctx.strategy_params.get(name) {
            param.validate_override(*value)?;
        }
    }

    Ok(size)
}

/// Full admission flow: idempotency check, guardrail evaluation, and
/// audit-log persistence (spec.md §4.12). The store is the audit log: every
/// decision, accepted or rejected, is persisted.
pub async fn admit(
    dedup: &Arc<dyn Dedup>,
    signal_repo: &Arc<dyn SignalRepository>,
    alert_id: &str,
    ctx: &GateContext<'_>,
    signal: &Signal,
    config: &RiskConfig,
) -> Result<f64, RiskViolation> {
    if dedup.has(alert_id).await.unwrap_or(false) {
        let violation = RiskViolation::Duplicate {
            alert_id: alert_id.to_string(),
        };
        persist(signal_repo, alert_id, ctx, signal, Err(&violation)).await;
        return Err(violation);
    }

    let result = evaluate_guardrails(ctx, signal, config);
    persist(signal_repo, alert_id, ctx, signal, result.as_ref().map(|_| ()).map_err(|e| e)).await;

    match &result {
        Ok(_) => {
            let _ = dedup.set(alert_id, Duration::from_secs(24 * 3600)).await;
        }
        Err(_) => {}
    }
    result
}

async fn persist(
    signal_repo: &Arc<dyn SignalRepository>,
    alert_id: &str,
    ctx: &GateContext<'_>,
    signal: &Signal,
    outcome: Result<(), &RiskViolation>,
) {
    let stored = StoredSignal {
        alert_id: alert_id.to_string(),
        source: ctx.strategy.to_string(),
        coin: ctx.coin.to_string(),
        side: signal.direction,
        entry_price: signal.entry_price,
        stop_loss: signal.stop_loss,
        take_profits: signal.take_profits.clone(),
        risk_check_passed: outcome.is_ok(),
        risk_check_reason: outcome.err().map(|e| e.reason()),
        created_at: Utc::now(),
    };
    let _ = signal_repo.save(&stored).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trading::Direction;

    fn signal() -> Signal {
        Signal {
            direction: Direction::Long,
            entry_price: None,
            stop_loss: 95.0,
            take_profits: vec![],
            comment: String::new(),
        }
    }

    fn base_ctx<'a>(overrides: &'a HashMap<String, f64>, params: &'a HashMap<String, StrategyParam>) -> GateContext<'a> {
        GateContext {
            coin: "BTC",
            strategy: "donchian_adx_breakout",
            auto_trading_enabled: true,
            trades_today: 0,
            daily_pnl: 0.0,
            open_positions: 0,
            position_open_for_coin: false,
            bars_since_exit: 10,
            current_price: Some(100.0),
            size_decimals: 3,
            requested_leverage: 5.0,
            requested_overrides: overrides,
            strategy_params: params,
        }
    }

    #[test]
    fn missing_market_price_is_rejected() {
        let overrides = HashMap::new();
        let params = HashMap::new();
        let mut ctx = base_ctx(&overrides, &params);
        ctx.current_price = None;
        let result = evaluate_guardrails(&ctx, &signal(), &RiskConfig::default());
        assert!(matches!(result, Err(RiskViolation::NoMarketPrice)));
    }

    #[test]
    fn daily_trade_cap_rejects_with_global_daily_limit_reason() {
        let overrides = HashMap::new();
        let params = HashMap::new();
        let mut ctx = base_ctx(&overrides, &params);
        ctx.trades_today = 10;
        let config = RiskConfig::default();
        let result = evaluate_guardrails(&ctx, &signal(), &config);
        let err = result.unwrap_err();
        assert_eq!(err.reason(), "global_daily_limit");
    }

    #[test]
    fn valid_signal_returns_a_positive_size() {
        let overrides = HashMap::new();
        let params = HashMap::new();
        let ctx = base_ctx(&overrides, &params);
        let size = evaluate_guardrails(&ctx, &signal(), &RiskConfig::default()).unwrap();
        assert!(size > 0.0);
    }

    #[test]
    fn protected_field_override_is_rejected() {
        let mut overrides = HashMap::new();
        overrides.insert("commission".to_string(), 0.001);
        let params = HashMap::new();
        let ctx = base_ctx(&overrides, &params);
        let result = evaluate_guardrails(&ctx, &signal(), &RiskConfig::default());
        assert!(matches!(result, Err(RiskViolation::ProtectedFieldChanged { .. })));
    }

    #[test]
    fn cooldown_blocks_entries_too_soon_after_exit() {
        let overrides = HashMap::new();
        let params = HashMap::new();
        let mut ctx = base_ctx(&overrides, &params);
        ctx.bars_since_exit = 0;
        let result = evaluate_guardrails(&ctx, &signal(), &RiskConfig::default());
        assert!(matches!(result, Err(RiskViolation::Cooldown { .. })));
    }
}
