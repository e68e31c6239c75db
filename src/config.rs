//! Frozen process configuration, loaded once at startup.
//!
//! Mirrors the teacher's `Config::from_env` pattern: environment variables
//! are parsed and validated eagerly so that a malformed deployment fails at
//! boot rather than mid-session.

use anyhow::{bail, Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Venue {
    Binance,
    Hyperliquid,
}

impl FromStr for Venue {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "binance" => Ok(Venue::Binance),
            "hyperliquid" => Ok(Venue::Hyperliquid),
            other => bail!("Invalid CANDLE_SOURCE: {other}. Must be 'binance' or 'hyperliquid'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarginMode {
    Isolated,
    Cross,
}

impl FromStr for MarginMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "isolated" => Ok(MarginMode::Isolated),
            "cross" => Ok(MarginMode::Cross),
            other => bail!("Invalid MARGIN_MODE: {other}. Must be 'isolated' or 'cross'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingMode {
    Risk,
    Cash,
}

impl FromStr for SizingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "risk" => Ok(SizingMode::Risk),
            "cash" => Ok(SizingMode::Cash),
            other => bail!("Invalid SIZING_MODE: {other}. Must be 'risk' or 'cash'"),
        }
    }
}

/// Candle-source connection options (spec.md §9, "Recognized options").
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub source: Venue,
    pub candles_per_request: u32,
    pub request_delay_ms: u64,
    pub symbol_override: Option<String>,
}

impl SourceOptions {
    pub fn defaults_for(source: Venue) -> Self {
        let candles_per_request = match source {
            Venue::Binance => 1500,
            Venue::Hyperliquid => 500,
        };
        Self {
            source,
            candles_per_request,
            request_delay_ms: 200,
            symbol_override: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub max_trades_per_day: u32,
    pub max_daily_loss_usd: f64,
    pub max_open_positions: usize,
    pub sizing_mode: SizingMode,
    pub risk_per_trade_usd: f64,
    pub cash_per_trade: f64,
    pub max_notional_usd: f64,
    pub max_leverage: f64,
    pub cooldown_bars: u32,
    pub entry_slippage_bps: f64,
    pub protected_fields: Vec<String>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_trades_per_day: 10,
            max_daily_loss_usd: 500.0,
            max_open_positions: 3,
            sizing_mode: SizingMode::Risk,
            risk_per_trade_usd: 50.0,
            cash_per_trade: 200.0,
            max_notional_usd: 20_000.0,
            max_leverage: 10.0,
            cooldown_bars: 2,
            entry_slippage_bps: 5.0,
            protected_fields: vec!["commission".into(), "initial_capital".into()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct OptimizationConfig {
    pub max_iter: u32,
    pub max_cycles: u32,
    pub min_trades: u32,
    pub max_fix_attempts: u32,
    pub refine_timeout: Duration,
    pub restructure_timeout: Duration,
    pub min_phase_iters: u32,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            max_iter: 100,
            max_cycles: 3,
            min_trades: 20,
            max_fix_attempts: 3,
            refine_timeout: Duration::from_secs(900),
            restructure_timeout: Duration::from_secs(1800),
            min_phase_iters: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub coins: Vec<String>,
    pub primary_interval: String,
    pub candle_source: SourceOptions,
    pub db_url: String,
    pub webhook_secret: String,
    pub webhook_ttl_seconds: i64,
    pub margin_mode: MarginMode,
    pub risk: RiskConfig,
    pub optimization: OptimizationConfig,
    pub control_api_bind: String,
    pub control_api_rate_limit_per_min: u32,
    pub observability_enabled: bool,
    pub observability_interval_secs: u64,
    pub binance_api_key: String,
    pub binance_api_secret: String,
    pub binance_base_url: String,
    pub hyperliquid_api_key: String,
    pub hyperliquid_api_secret: String,
    pub hyperliquid_base_url: String,
    pub hyperliquid_ws_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let coins = env_var_or("COINS", "BTC,ETH")
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        if coins.is_empty() {
            bail!("COINS must name at least one coin");
        }

        let candle_source_venue = env_var_or("CANDLE_SOURCE", "hyperliquid")
            .parse::<Venue>()
            .context("parsing CANDLE_SOURCE")?;
        let mut candle_source = SourceOptions::defaults_for(candle_source_venue);
        if let Ok(v) = env::var("CANDLES_PER_REQUEST") {
            candle_source.candles_per_request =
                v.parse().context("parsing CANDLES_PER_REQUEST")?;
        }
        if let Ok(v) = env::var("REQUEST_DELAY_MS") {
            candle_source.request_delay_ms = v.parse().context("parsing REQUEST_DELAY_MS")?;
        }
        candle_source.symbol_override = env::var("SYMBOL_OVERRIDE").ok();

        let margin_mode = env_var_or("MARGIN_MODE", "isolated")
            .parse::<MarginMode>()
            .context("parsing MARGIN_MODE")?;

        let mut risk = RiskConfig::default();
        if let Ok(v) = env::var("MAX_TRADES_PER_DAY") {
            risk.max_trades_per_day = v.parse().context("parsing MAX_TRADES_PER_DAY")?;
        }
        if let Ok(v) = env::var("MAX_DAILY_LOSS_USD") {
            risk.max_daily_loss_usd = v.parse().context("parsing MAX_DAILY_LOSS_USD")?;
        }
        if let Ok(v) = env::var("MAX_OPEN_POSITIONS") {
            risk.max_open_positions = v.parse().context("parsing MAX_OPEN_POSITIONS")?;
        }
        if let Ok(v) = env::var("SIZING_MODE") {
            risk.sizing_mode = v.parse().context("parsing SIZING_MODE")?;
        }
        if let Ok(v) = env::var("RISK_PER_TRADE_USD") {
            risk.risk_per_trade_usd = v.parse().context("parsing RISK_PER_TRADE_USD")?;
        }
        if let Ok(v) = env::var("CASH_PER_TRADE") {
            risk.cash_per_trade = v.parse().context("parsing CASH_PER_TRADE")?;
        }
        if let Ok(v) = env::var("MAX_NOTIONAL_USD") {
            risk.max_notional_usd = v.parse().context("parsing MAX_NOTIONAL_USD")?;
        }
        if let Ok(v) = env::var("MAX_LEVERAGE") {
            risk.max_leverage = v.parse().context("parsing MAX_LEVERAGE")?;
        }
        if let Ok(v) = env::var("COOLDOWN_BARS") {
            risk.cooldown_bars = v.parse().context("parsing COOLDOWN_BARS")?;
        }

        let mut optimization = OptimizationConfig::default();
        if let Ok(v) = env::var("MAX_ITER") {
            optimization.max_iter = v.parse().context("parsing MAX_ITER")?;
        }
        if let Ok(v) = env::var("MAX_CYCLES") {
            optimization.max_cycles = v.parse().context("parsing MAX_CYCLES")?;
        }
        if let Ok(v) = env::var("MIN_TRADES") {
            optimization.min_trades = v.parse().context("parsing MIN_TRADES")?;
        }

        if risk.max_leverage <= 0.0 {
            bail!("MAX_LEVERAGE must be positive");
        }

        Ok(Self {
            coins,
            primary_interval: env_var_or("PRIMARY_INTERVAL", "15m"),
            candle_source,
            db_url: env_var_or("DATABASE_URL", "sqlite://data/perpd.db"),
            webhook_secret: env_var_or("WEBHOOK_SECRET", ""),
            webhook_ttl_seconds: env_var_or("WEBHOOK_TTL_SECONDS", "300")
                .parse()
                .context("parsing WEBHOOK_TTL_SECONDS")?,
            margin_mode,
            risk,
            optimization,
            control_api_bind: env_var_or("CONTROL_API_BIND", "0.0.0.0:8080"),
            control_api_rate_limit_per_min: env_var_or("CONTROL_API_RATE_LIMIT", "10")
                .parse()
                .context("parsing CONTROL_API_RATE_LIMIT")?,
            observability_enabled: env_var_or("OBSERVABILITY_ENABLED", "true")
                .parse()
                .context("parsing OBSERVABILITY_ENABLED")?,
            observability_interval_secs: env_var_or("OBSERVABILITY_INTERVAL", "60")
                .parse()
                .context("parsing OBSERVABILITY_INTERVAL")?,
            binance_api_key: env::var("BINANCE_API_KEY").unwrap_or_default(),
            binance_api_secret: env::var("BINANCE_API_SECRET").unwrap_or_default(),
            binance_base_url: env_var_or("BINANCE_BASE_URL", "https://api.binance.com"),
            hyperliquid_api_key: env::var("HYPERLIQUID_API_KEY").unwrap_or_default(),
            hyperliquid_api_secret: env::var("HYPERLIQUID_API_SECRET").unwrap_or_default(),
            hyperliquid_base_url: env_var_or("HYPERLIQUID_BASE_URL", "https://api.hyperliquid.xyz"),
            hyperliquid_ws_url: env_var_or("HYPERLIQUID_WS_URL", "wss://api.hyperliquid.xyz/ws"),
        })
    }
}

fn env_var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_parses_known_values() {
        assert_eq!("binance".parse::<Venue>().unwrap(), Venue::Binance);
        assert_eq!("Hyperliquid".parse::<Venue>().unwrap(), Venue::Hyperliquid);
        assert!("dydx".parse::<Venue>().is_err());
    }

    #[test]
    fn source_options_defaults_differ_per_venue() {
        assert_eq!(
            SourceOptions::defaults_for(Venue::Binance).candles_per_request,
            1500
        );
        assert_eq!(
            SourceOptions::defaults_for(Venue::Hyperliquid).candles_per_request,
            500
        );
    }
}
