//! Narrow capability interfaces at the boundary with external collaborators
//! (spec.md §1, §9 "cyclic references... broken by passing only narrow
//! capability interfaces at construction").

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

use crate::domain::candle::{Candle, Interval};
use crate::domain::trading::{Direction, OrderTag};

/// A single-venue, single-page OHLCV fetch. `CandleClient` (C1) drives this
/// in a loop to implement pagination; this trait never retries and never
/// paginates itself.
#[async_trait]
pub trait CandlePageFetcher: Send + Sync {
    /// Fetches one page of at most `limit` candles starting at `since_ms`.
    async fn fetch_page(
        &self,
        coin: &str,
        interval: Interval,
        since_ms: i64,
        limit: u32,
    ) -> Result<Vec<Candle>>;
}

/// Fill/placement report from an exchange for a single leg (C13/C15).
#[derive(Debug, Clone)]
pub struct FillReport {
    pub hl_order_id: String,
    pub filled_size: f64,
    pub avg_price: f64,
}

/// The order-placement surface C13 drives (spec.md §4.13).
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn set_leverage(&self, coin: &str, leverage: f64, isolated: bool) -> Result<()>;

    async fn place_market_order(
        &self,
        coin: &str,
        direction: Direction,
        size: f64,
        reduce_only: bool,
        tag: OrderTag,
    ) -> Result<FillReport>;

    async fn place_limit_order(
        &self,
        coin: &str,
        direction: Direction,
        size: f64,
        price: f64,
        reduce_only: bool,
        tag: OrderTag,
    ) -> Result<FillReport>;

    async fn place_stop_order(
        &self,
        coin: &str,
        direction: Direction,
        size: f64,
        trigger_price: f64,
        tag: OrderTag,
    ) -> Result<FillReport>;

    async fn cancel_order(&self, hl_order_id: &str) -> Result<()>;

    async fn open_order_ids(&self, coin: &str) -> Result<Vec<String>>;
}

/// A capability interface for idempotency, with an external-KV-backed
/// implementation preferred and an in-process LRU as a degraded fallback
/// (spec.md §5, §9).
#[async_trait]
pub trait Dedup: Send + Sync {
    async fn has(&self, id: &str) -> Result<bool>;
    async fn set(&self, id: &str, ttl: Duration) -> Result<()>;
    /// True when running in the degraded (in-process) mode.
    fn is_degraded(&self) -> bool;
}

/// The wire contract with the external code-modifying agent (spec.md §9).
/// The agent never writes parameter history directly; it returns a
/// result the orchestrator interprets and then records itself.
#[derive(Debug, Clone)]
pub enum ModifierOutcome {
    ParamOverrides(std::collections::HashMap<String, f64>),
    SourceRewritten { new_source: Vec<u8> },
}

#[async_trait]
pub trait StrategyModifier: Send + Sync {
    async fn invoke(
        &self,
        prompt_path: &std::path::Path,
        timeout: Duration,
    ) -> Result<ModifierOutcome>;
}

/// A single order-update/fill WS event (spec.md §4.15).
#[derive(Debug, Clone)]
pub struct OrderUpdateEvent {
    pub hl_order_id: String,
    pub fill_id: String,
    pub coin: String,
    pub status: crate::domain::trading::OrderStatus,
    pub fill_price: f64,
    pub fill_size: f64,
    pub fee: f64,
}

/// Subscription handle for the wallet's order-update/user-fill feeds. A
/// `None` return means the stream ended (reconnect is the caller's concern).
#[async_trait]
pub trait OrderEventSource: Send + Sync {
    async fn next_event(&mut self) -> Result<Option<OrderUpdateEvent>>;
}

/// Outbound user notification (entry/SL/TP summaries, critical alarms).
/// The messaging-transport gateway itself is out of scope (spec.md §1); this
/// is the narrow interface the core depends on.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, message: &str) -> Result<()>;
    async fn alarm(&self, message: &str) -> Result<()>;
}
