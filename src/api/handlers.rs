//! Control-API handlers (spec.md §6), grounded on the teacher's
//! `web::api` handler idiom: a `State(state): State<AppState>` extractor
//! per handler, `Json(json!({...}))` success bodies, `ApiError` for the
//! failure path.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::domain::candle::{CandleKey, Interval};
use crate::domain::errors::RiskViolation;
use crate::domain::trading::{Direction, Signal, TakeProfit};

use super::auth::authenticate_webhook;
use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// No primary bar has closed within this window ⇒ streamer is stale
/// (spec.md §7 "stale streamer data flips to `{status:"stale"}`").
const STALE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

fn parse_direction(raw: &str) -> ApiResult<Direction> {
    match raw.to_ascii_lowercase().as_str() {
        "long" => Ok(Direction::Long),
        "short" => Ok(Direction::Short),
        other => Err(ApiError::InvalidPayload(format!("unknown direction: {other}"))),
    }
}

fn lookup_runner(state: &AppState, coin: &str) -> ApiResult<std::sync::Arc<crate::live::CoinRunner>> {
    state.runner(coin).ok_or_else(|| ApiError::NotFound(format!("unknown coin {coin}")))
}

// ---------------------------------------------------------------------
// POST /signal
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TakeProfitDto {
    pub price: f64,
    pub pct_of_position: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRequest {
    pub coin: String,
    pub direction: String,
    pub entry_price: Option<f64>,
    pub stop_loss: f64,
    #[serde(default)]
    pub take_profits: Vec<TakeProfitDto>,
    pub comment: Option<String>,
    pub alert_id: Option<String>,
}

pub async fn post_signal(State(state): State<AppState>, Json(req): Json<SignalRequest>) -> ApiResult<impl IntoResponse> {
    let coin = req.coin.to_uppercase();
    let runner = lookup_runner(&state, &coin)?;
    let direction = parse_direction(&req.direction)?;

    let signal = Signal {
        direction,
        entry_price: req.entry_price,
        stop_loss: req.stop_loss,
        take_profits: req.take_profits.into_iter().map(|tp| TakeProfit { price: tp.price, pct_of_position: tp.pct_of_position }).collect(),
        comment: req.comment.unwrap_or_default(),
    };
    let alert_id = req.alert_id.unwrap_or_else(|| Uuid::new_v4().to_string());

    runner.submit_signal(&alert_id, &signal).await?;
    Ok(Json(json!({ "status": "executed", "signalId": alert_id })))
}

// ---------------------------------------------------------------------
// POST /webhook, POST /webhook/:token
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct WebhookRequest {
    pub alert_id: String,
    #[allow(dead_code)]
    pub event_type: String,
    pub asset: String,
    pub side: String,
    pub entry: Option<f64>,
    pub sl: f64,
    #[allow(dead_code)]
    pub qty: Option<f64>,
    pub tp1: Option<f64>,
    pub tp2: Option<f64>,
    pub tp1_pct: Option<f64>,
    #[allow(dead_code)]
    pub leverage: Option<f64>,
    #[allow(dead_code)]
    pub risk_usd: Option<f64>,
    #[allow(dead_code)]
    pub notional_usdc: Option<f64>,
    #[allow(dead_code)]
    pub margin_usdc: Option<f64>,
    pub signal_ts: Option<i64>,
    #[allow(dead_code)]
    pub bar_ts: Option<i64>,
    /// Not part of the enumerated trading payload, but the alternative to
    /// the `:token` path segment for the constant-time secret check
    /// (spec.md §6 "either the token path segment or a secret body field").
    pub secret: Option<String>,
}

fn take_profits_from_webhook(req: &WebhookRequest) -> Vec<TakeProfit> {
    let mut tps = Vec::new();
    if let Some(price) = req.tp1 {
        let pct = req.tp1_pct.unwrap_or(1.0).clamp(0.0, 1.0);
        tps.push(TakeProfit { price, pct_of_position: pct });
        if let Some(price2) = req.tp2 {
            tps.push(TakeProfit { price: price2, pct_of_position: (1.0 - pct).max(0.0) });
        }
    } else if let Some(price2) = req.tp2 {
        tps.push(TakeProfit { price: price2, pct_of_position: 1.0 });
    }
    tps
}

async fn handle_webhook(state: AppState, token: Option<String>, body: axum::body::Bytes) -> ApiResult<impl IntoResponse> {
    let req: WebhookRequest = serde_json::from_slice(&body).map_err(|e| ApiError::InvalidPayload(e.to_string()))?;

    if !authenticate_webhook(&state.config.webhook_secret, token.as_deref(), req.secret.as_deref(), &body) {
        return Err(ApiError::Forbidden("invalid webhook secret"));
    }

    if let Some(ts) = req.signal_ts {
        let now = chrono::Utc::now().timestamp_millis();
        if (now - ts) > state.config.webhook_ttl_seconds * 1000 {
            return Ok(Json(json!({ "status": "expired" })));
        }
    }

    let coin = req.asset.to_uppercase();
    let runner = lookup_runner(&state, &coin)?;
    let direction = parse_direction(&req.side)?;
    let signal = Signal {
        direction,
        entry_price: req.entry,
        stop_loss: req.sl,
        take_profits: take_profits_from_webhook(&req),
        comment: "webhook".to_string(),
    };

    runner.submit_signal(&req.alert_id, &signal).await?;
    Ok(Json(json!({ "status": "executed", "signalId": req.alert_id })))
}

pub async fn post_webhook_untoked(State(state): State<AppState>, body: axum::body::Bytes) -> ApiResult<impl IntoResponse> {
    handle_webhook(state, None, body).await
}

pub async fn post_webhook_toked(
    State(state): State<AppState>,
    Path(token): Path<String>,
    body: axum::body::Bytes,
) -> ApiResult<impl IntoResponse> {
    handle_webhook(state, Some(token), body).await
}

// ---------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------

pub async fn get_health(State(state): State<AppState>) -> impl IntoResponse {
    let mut stale = false;
    for runner in state.runners.values() {
        if runner.is_stale(STALE_THRESHOLD).await {
            stale = true;
            break;
        }
    }
    let status = if stale { "stale" } else { "ok" };
    Json(json!({ "status": status, "dedup_degraded": state.dedup.is_degraded() }))
}

// ---------------------------------------------------------------------
// GET /positions
// ---------------------------------------------------------------------

pub async fn get_positions(State(state): State<AppState>) -> impl IntoResponse {
    let mut positions = Vec::new();
    for runner in state.runners.values() {
        if let Some(position) = runner.position().await {
            positions.push(position);
        }
    }
    Json(positions)
}

// ---------------------------------------------------------------------
// GET /orders
// ---------------------------------------------------------------------

pub async fn get_orders(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let mut orders = Vec::new();
    for coin in state.runners.keys() {
        orders.extend(state.order_repo.find_by_coin(coin).await?);
    }
    Ok(Json(orders))
}

// ---------------------------------------------------------------------
// GET /equity
// ---------------------------------------------------------------------

pub async fn get_equity(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "equityUsd": state.metrics.equity_usd.get(),
        "dailyPnlUsd": state.metrics.daily_pnl_usd.get(),
    }))
}

// ---------------------------------------------------------------------
// GET /open-orders?coin=
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CoinQuery {
    pub coin: String,
}

pub async fn get_open_orders(State(state): State<AppState>, Query(q): Query<CoinQuery>) -> ApiResult<impl IntoResponse> {
    let coin = q.coin.to_uppercase();
    let ids = state.exchange.open_order_ids(&coin).await?;
    Ok(Json(ids))
}

// ---------------------------------------------------------------------
// DELETE /open-order/:oid
// ---------------------------------------------------------------------

pub async fn delete_open_order(State(state): State<AppState>, Path(oid): Path<String>) -> ApiResult<impl IntoResponse> {
    state.exchange.cancel_order(&oid).await?;
    Ok(Json(json!({ "status": "cancelled", "oid": oid })))
}

// ---------------------------------------------------------------------
// GET /candles?coin&interval[&start][&end]
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CandlesQuery {
    pub coin: String,
    pub interval: String,
    pub start: Option<i64>,
    pub end: Option<i64>,
}

pub async fn get_candles(State(state): State<AppState>, Query(q): Query<CandlesQuery>) -> ApiResult<impl IntoResponse> {
    let interval = Interval::from_str(&q.interval).map_err(|e| ApiError::InvalidPayload(e.to_string()))?;
    let key = CandleKey::new(q.coin.to_uppercase(), interval, state.candle_source_label.clone());
    let start = q.start.unwrap_or(0);
    let end = q.end.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
    let candles = state.candle_cache.get_candles(&key, start, end).await?;
    Ok(Json(candles))
}

// ---------------------------------------------------------------------
// GET /signals
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

pub async fn get_signals(State(state): State<AppState>, Query(q): Query<LimitQuery>) -> impl IntoResponse {
    Json(state.events.recent(q.limit.unwrap_or(50)).await)
}

// ---------------------------------------------------------------------
// GET /strategy-signals?coin&strategy
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StrategySignalsQuery {
    pub coin: String,
    /// Accepted for schema compatibility; every signal the event log
    /// records already belongs to the one strategy a coin's runner drives
    /// (spec.md §5 "one strategy per coin"), so this is not filtered on.
    #[allow(dead_code)]
    pub strategy: Option<String>,
}

pub async fn get_strategy_signals(State(state): State<AppState>, Query(q): Query<StrategySignalsQuery>) -> impl IntoResponse {
    let coin = q.coin.to_uppercase();
    let events = state.events.recent(500).await;
    let filtered: Vec<_> = events.into_iter().filter(|e| e.kind.coin() == Some(coin.as_str())).collect();
    Json(filtered)
}

// ---------------------------------------------------------------------
// GET /account
// ---------------------------------------------------------------------

pub async fn get_account(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "coins": state.config.coins,
        "marginMode": format!("{:?}", state.config.margin_mode),
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "autoTrading": state.runners.iter().map(|(coin, r)| (coin.clone(), r.is_auto_trading_enabled())).collect::<HashMap<_, _>>(),
    }))
}

// ---------------------------------------------------------------------
// GET /config
// ---------------------------------------------------------------------

pub async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "coins": state.config.coins,
        "primaryInterval": state.config.primary_interval,
        "marginMode": format!("{:?}", state.config.margin_mode),
        "risk": {
            "maxTradesPerDay": state.config.risk.max_trades_per_day,
            "maxDailyLossUsd": state.config.risk.max_daily_loss_usd,
            "maxOpenPositions": state.config.risk.max_open_positions,
            "maxNotionalUsd": state.config.risk.max_notional_usd,
            "maxLeverage": state.config.risk.max_leverage,
            "cooldownBars": state.config.risk.cooldown_bars,
        },
        "controlApiRateLimitPerMin": state.config.control_api_rate_limit_per_min,
    }))
}

// ---------------------------------------------------------------------
// POST /close-position {coin}
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ClosePositionRequest {
    pub coin: String,
}

pub async fn post_close_position(State(state): State<AppState>, Json(req): Json<ClosePositionRequest>) -> ApiResult<impl IntoResponse> {
    let coin = req.coin.to_uppercase();
    let runner = lookup_runner(&state, &coin)?;
    let closed = runner.close_manually().await;
    info!(coin = %coin, closed, "control api: manual close requested");
    Ok(Json(json!({ "status": if closed { "closed" } else { "no_position" } })))
}

// ---------------------------------------------------------------------
// POST /auto-trading {coin, strategy?, enabled}
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AutoTradingRequest {
    pub coin: String,
    #[allow(dead_code)]
    pub strategy: Option<String>,
    pub enabled: bool,
}

pub async fn post_auto_trading(State(state): State<AppState>, Json(req): Json<AutoTradingRequest>) -> ApiResult<impl IntoResponse> {
    let coin = req.coin.to_uppercase();
    let runner = lookup_runner(&state, &coin)?;
    runner.set_auto_trading(req.enabled);
    Ok(Json(json!({ "status": "ok", "coin": coin, "enabled": req.enabled })))
}

// ---------------------------------------------------------------------
// POST /quick-signal {coin, direction}
// ---------------------------------------------------------------------

/// Default stop distance for a quick signal with no explicit risk
/// parameters: 2% away from the last observed price, on the side that
/// makes the signal a loss-limiting stop for its direction.
const QUICK_SIGNAL_STOP_PCT: f64 = 0.02;

#[derive(Debug, Deserialize)]
pub struct QuickSignalRequest {
    pub coin: String,
    pub direction: String,
}

pub async fn post_quick_signal(State(state): State<AppState>, Json(req): Json<QuickSignalRequest>) -> ApiResult<impl IntoResponse> {
    let coin = req.coin.to_uppercase();
    let runner = lookup_runner(&state, &coin)?;
    let direction = parse_direction(&req.direction)?;
    let price = runner.last_price().await.ok_or(RiskViolation::NoMarketPrice)?;

    let stop_loss = match direction {
        Direction::Long => price * (1.0 - QUICK_SIGNAL_STOP_PCT),
        Direction::Short => price * (1.0 + QUICK_SIGNAL_STOP_PCT),
    };
    let signal = Signal { direction, entry_price: None, stop_loss, take_profits: vec![], comment: "quick-signal".to_string() };
    let alert_id = Uuid::new_v4().to_string();

    runner.submit_signal(&alert_id, &signal).await?;
    Ok(Json(json!({ "status": "executed", "signalId": alert_id })))
}
