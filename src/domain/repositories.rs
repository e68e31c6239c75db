//! Repository trait abstractions (spec.md §6 "Persisted layout").
//!
//! Mirrors the teacher's repository-pattern split: business logic depends
//! only on these traits; `infrastructure::persistence` provides the sqlx
//! implementation and `infrastructure::memory` an in-memory one for tests.

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::candle::{Candle, CandleKey};
use crate::domain::trading::{Fill, Order, StoredSignal};

#[async_trait]
pub trait CandleRepository: Send + Sync {
    /// Upserts by `t`; returns the number of rows actually inserted (new `t`s).
    async fn insert_candles(&self, key: &CandleKey, candles: &[Candle]) -> Result<usize>;

    async fn get_candles(
        &self,
        key: &CandleKey,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>>;

    async fn get_first_timestamp(&self, key: &CandleKey) -> Result<Option<i64>>;
    async fn get_last_timestamp(&self, key: &CandleKey) -> Result<Option<i64>>;
    async fn get_candle_count(&self, key: &CandleKey) -> Result<usize>;
}

#[async_trait]
pub trait SignalRepository: Send + Sync {
    async fn exists(&self, alert_id: &str) -> Result<bool>;
    async fn save(&self, signal: &StoredSignal) -> Result<()>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn save(&self, order: &Order) -> Result<()>;
    async fn find_by_coin(&self, coin: &str) -> Result<Vec<Order>>;
    async fn find_by_hl_order_id(&self, hl_order_id: &str) -> Result<Option<Order>>;
    async fn update_status(
        &self,
        hl_order_id: &str,
        status: crate::domain::trading::OrderStatus,
    ) -> Result<()>;
}

#[async_trait]
pub trait FillRepository: Send + Sync {
    /// Inserts the fill; returns `false` without error if `(hl_order_id,
    /// fill_id)` was already recorded (spec.md §4.15 idempotent snapshots).
    async fn insert(&self, fill: &Fill) -> Result<bool>;
    async fn find_by_order(&self, hl_order_id: &str) -> Result<Vec<Fill>>;
}
