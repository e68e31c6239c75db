//! In-memory repository set for tests and single-process dry runs, grounded
//! on the teacher's `infrastructure::repositories::in_memory` pattern:
//! `Arc<RwLock<...>>`-backed state behind the same repository traits the
//! sqlx implementation satisfies.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::candle::{Candle, CandleKey};
use crate::domain::repositories::{CandleRepository, FillRepository, OrderRepository, SignalRepository};
use crate::domain::trading::{Fill, Order, OrderStatus, StoredSignal};

#[derive(Default)]
pub struct InMemoryCandleRepository {
    series: Arc<RwLock<HashMap<CandleKey, Vec<Candle>>>>,
}

impl InMemoryCandleRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CandleRepository for InMemoryCandleRepository {
    async fn insert_candles(&self, key: &CandleKey, candles: &[Candle]) -> Result<usize> {
        let mut series = self.series.write().await;
        let existing = series.entry(key.clone()).or_default();
        let mut inserted = 0usize;
        for candle in candles {
            if !candle.is_valid() {
                continue;
            }
            match existing.iter_mut().find(|c| c.t == candle.t) {
                Some(slot) => *slot = *candle,
                None => {
                    existing.push(*candle);
                    inserted += 1;
                }
            }
        }
        existing.sort_by_key(|c| c.t);
        Ok(inserted)
    }

    async fn get_candles(&self, key: &CandleKey, start_ms: i64, end_ms: i64) -> Result<Vec<Candle>> {
        let series = self.series.read().await;
        Ok(series
            .get(key)
            .map(|candles| candles.iter().filter(|c| c.t >= start_ms && c.t < end_ms).copied().collect())
            .unwrap_or_default())
    }

    async fn get_first_timestamp(&self, key: &CandleKey) -> Result<Option<i64>> {
        let series = self.series.read().await;
        Ok(series.get(key).and_then(|c| c.first()).map(|c| c.t))
    }

    async fn get_last_timestamp(&self, key: &CandleKey) -> Result<Option<i64>> {
        let series = self.series.read().await;
        Ok(series.get(key).and_then(|c| c.last()).map(|c| c.t))
    }

    async fn get_candle_count(&self, key: &CandleKey) -> Result<usize> {
        let series = self.series.read().await;
        Ok(series.get(key).map(|c| c.len()).unwrap_or(0))
    }
}

#[derive(Default)]
pub struct InMemorySignalRepository {
    signals: Arc<RwLock<HashMap<String, StoredSignal>>>,
}

impl InMemorySignalRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignalRepository for InMemorySignalRepository {
    async fn exists(&self, alert_id: &str) -> Result<bool> {
        Ok(self.signals.read().await.contains_key(alert_id))
    }

    async fn save(&self, signal: &StoredSignal) -> Result<()> {
        self.signals.write().await.entry(signal.alert_id.clone()).or_insert_with(|| signal.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryOrderRepository {
    orders: Arc<RwLock<Vec<Order>>>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn save(&self, order: &Order) -> Result<()> {
        self.orders.write().await.push(order.clone());
        Ok(())
    }

    async fn find_by_coin(&self, coin: &str) -> Result<Vec<Order>> {
        Ok(self.orders.read().await.iter().filter(|o| o.coin == coin).cloned().collect())
    }

    async fn find_by_hl_order_id(&self, hl_order_id: &str) -> Result<Option<Order>> {
        Ok(self
            .orders
            .read()
            .await
            .iter()
            .find(|o| o.hl_order_id.as_deref() == Some(hl_order_id))
            .cloned())
    }

    async fn update_status(&self, hl_order_id: &str, status: OrderStatus) -> Result<()> {
        let mut orders = self.orders.write().await;
        if let Some(order) = orders.iter_mut().find(|o| o.hl_order_id.as_deref() == Some(hl_order_id)) {
            order.status = status;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryFillRepository {
    fills: Arc<RwLock<Vec<Fill>>>,
}

impl InMemoryFillRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FillRepository for InMemoryFillRepository {
    async fn insert(&self, fill: &Fill) -> Result<bool> {
        let mut fills = self.fills.write().await;
        if fills.iter().any(|f| f.hl_order_id == fill.hl_order_id && f.fill_id == fill.fill_id) {
            return Ok(false);
        }
        fills.push(fill.clone());
        Ok(true)
    }

    async fn find_by_order(&self, hl_order_id: &str) -> Result<Vec<Fill>> {
        Ok(self.fills.read().await.iter().filter(|f| f.hl_order_id == hl_order_id).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::candle::Interval;
    use crate::domain::trading::{OrderSide, OrderTag, OrderType};
    use chrono::Utc;

    #[tokio::test]
    async fn candle_repository_upserts_by_timestamp() {
        let repo = InMemoryCandleRepository::new();
        let key = CandleKey::new("BTC", Interval::M1, "binance");
        let c1 = Candle { t: 0, o: 1.0, h: 2.0, l: 0.5, c: 1.5, v: 1.0, n: 1 };
        assert_eq!(repo.insert_candles(&key, &[c1]).await.unwrap(), 1);
        let c1_updated = Candle { c: 1.9, ..c1 };
        assert_eq!(repo.insert_candles(&key, &[c1_updated]).await.unwrap(), 0);
        assert_eq!(repo.get_candle_count(&key).await.unwrap(), 1);
        let rows = repo.get_candles(&key, 0, 100).await.unwrap();
        assert_eq!(rows[0].c, 1.9);
    }

    #[tokio::test]
    async fn fill_repository_dedups_by_order_and_fill_id() {
        let repo = InMemoryFillRepository::new();
        let fill = Fill { hl_order_id: "o1".into(), fill_id: "f1".into(), coin: "BTC".into(), price: 1.0, size: 1.0, fee: 0.0, filled_at: Utc::now() };
        assert!(repo.insert(&fill).await.unwrap());
        assert!(!repo.insert(&fill).await.unwrap());
    }

    #[tokio::test]
    async fn order_repository_finds_by_hl_order_id_and_updates_status() {
        let repo = InMemoryOrderRepository::new();
        let order = Order {
            signal_id: "s1".into(),
            hl_order_id: Some("o1".into()),
            coin: "BTC".into(),
            side: OrderSide::Buy,
            size: 1.0,
            price: None,
            order_type: OrderType::Market,
            tag: OrderTag::Entry,
            status: OrderStatus::Pending,
            mode: "live".into(),
            filled_at: None,
        };
        repo.save(&order).await.unwrap();
        repo.update_status("o1", OrderStatus::Filled).await.unwrap();
        let found = repo.find_by_hl_order_id("o1").await.unwrap().unwrap();
        assert!(matches!(found.status, OrderStatus::Filled));
    }
}
