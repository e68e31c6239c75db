//! sqlx-backed implementations of the `domain::repositories` traits.
//!
//! Uses runtime-checked `sqlx::query`/`query_as` (not the `query!` macros,
//! which need a live database at compile time) and maps rows by hand, the
//! way the teacher's own repository implementations do.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::domain::candle::{Candle, CandleKey};
use crate::domain::repositories::{CandleRepository, FillRepository, OrderRepository, SignalRepository};
use crate::domain::trading::{
    Direction, Fill, Order, OrderSide, OrderStatus, OrderTag, OrderType, StoredSignal,
};

pub struct SqliteCandleRepository {
    pool: SqlitePool,
}

impl SqliteCandleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CandleRepository for SqliteCandleRepository {
    async fn insert_candles(&self, key: &CandleKey, candles: &[Candle]) -> Result<usize> {
        let mut inserted = 0usize;
        let mut tx = self.pool.begin().await.context("failed to begin candle insert transaction")?;
        for candle in candles {
            if !candle.is_valid() {
                continue;
            }
            let result = sqlx::query(
                r#"
                INSERT INTO candles (coin, interval, source, t, o, h, l, c, v, n)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (coin, interval, source, t) DO UPDATE SET
                    o = excluded.o, h = excluded.h, l = excluded.l, c = excluded.c,
                    v = excluded.v, n = excluded.n
                "#,
            )
            .bind(&key.coin)
            .bind(key.interval.as_str())
            .bind(&key.source)
            .bind(candle.t)
            .bind(candle.o)
            .bind(candle.h)
            .bind(candle.l)
            .bind(candle.c)
            .bind(candle.v)
            .bind(candle.n)
            .execute(&mut *tx)
            .await
            .context("failed to upsert candle")?;
            if result.rows_affected() > 0 {
                inserted += 1;
            }
        }
        tx.commit().await.context("failed to commit candle insert transaction")?;
        Ok(inserted)
    }

    async fn get_candles(&self, key: &CandleKey, start_ms: i64, end_ms: i64) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            r#"
            SELECT t, o, h, l, c, v, n FROM candles
            WHERE coin = ? AND interval = ? AND source = ? AND t >= ? AND t < ?
            ORDER BY t ASC
            "#,
        )
        .bind(&key.coin)
        .bind(key.interval.as_str())
        .bind(&key.source)
        .bind(start_ms)
        .bind(end_ms)
        .fetch_all(&self.pool)
        .await
        .context("failed to query candles")?;

        Ok(rows
            .into_iter()
            .map(|row| Candle {
                t: row.get("t"),
                o: row.get("o"),
                h: row.get("h"),
                l: row.get("l"),
                c: row.get("c"),
                v: row.get("v"),
                n: row.get("n"),
            })
            .collect())
    }

    async fn get_first_timestamp(&self, key: &CandleKey) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT MIN(t) as ts FROM candles WHERE coin = ? AND interval = ? AND source = ?")
            .bind(&key.coin)
            .bind(key.interval.as_str())
            .bind(&key.source)
            .fetch_one(&self.pool)
            .await
            .context("failed to query first candle timestamp")?;
        Ok(row.try_get::<Option<i64>, _>("ts").unwrap_or(None))
    }

    async fn get_last_timestamp(&self, key: &CandleKey) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT MAX(t) as ts FROM candles WHERE coin = ? AND interval = ? AND source = ?")
            .bind(&key.coin)
            .bind(key.interval.as_str())
            .bind(&key.source)
            .fetch_one(&self.pool)
            .await
            .context("failed to query last candle timestamp")?;
        Ok(row.try_get::<Option<i64>, _>("ts").unwrap_or(None))
    }

    async fn get_candle_count(&self, key: &CandleKey) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) as n FROM candles WHERE coin = ? AND interval = ? AND source = ?")
            .bind(&key.coin)
            .bind(key.interval.as_str())
            .bind(&key.source)
            .fetch_one(&self.pool)
            .await
            .context("failed to count candles")?;
        let count: i64 = row.get("n");
        Ok(count as usize)
    }
}

pub struct SqliteSignalRepository {
    pool: SqlitePool,
}

impl SqliteSignalRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SignalRepository for SqliteSignalRepository {
    async fn exists(&self, alert_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) as n FROM signals WHERE alert_id = ?")
            .bind(alert_id)
            .fetch_one(&self.pool)
            .await
            .context("failed to query signal existence")?;
        let count: i64 = row.get("n");
        Ok(count > 0)
    }

    async fn save(&self, signal: &StoredSignal) -> Result<()> {
        let take_profits = serde_json::to_string(&signal.take_profits).context("failed to serialize take profits")?;
        let side = match signal.side {
            Direction::Long => "long",
            Direction::Short => "short",
        };
        sqlx::query(
            r#"
            INSERT INTO signals (alert_id, source, coin, side, entry_price, stop_loss, take_profits, risk_check_passed, risk_check_reason, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (alert_id) DO NOTHING
            "#,
        )
        .bind(&signal.alert_id)
        .bind(&signal.source)
        .bind(&signal.coin)
        .bind(side)
        .bind(signal.entry_price)
        .bind(signal.stop_loss)
        .bind(take_profits)
        .bind(signal.risk_check_passed)
        .bind(&signal.risk_check_reason)
        .bind(signal.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to insert signal")?;
        Ok(())
    }
}

pub struct SqliteOrderRepository {
    pool: SqlitePool,
}

impl SqliteOrderRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn side_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "BUY",
        OrderSide::Sell => "SELL",
    }
}

fn parse_side(s: &str) -> OrderSide {
    match s {
        "BUY" => OrderSide::Buy,
        _ => OrderSide::Sell,
    }
}

fn order_type_str(t: OrderType) -> &'static str {
    match t {
        OrderType::Market => "market",
        OrderType::Limit => "limit",
        OrderType::Stop => "stop",
    }
}

fn parse_order_type(s: &str) -> OrderType {
    match s {
        "market" => OrderType::Market,
        "limit" => OrderType::Limit,
        _ => OrderType::Stop,
    }
}

fn tag_str(tag: OrderTag) -> String {
    match tag {
        OrderTag::Entry => "entry".to_string(),
        OrderTag::Sl => "sl".to_string(),
        OrderTag::Tp(n) => format!("tp{n}"),
    }
}

fn parse_tag(s: &str) -> OrderTag {
    if s == "entry" {
        OrderTag::Entry
    } else if s == "sl" {
        OrderTag::Sl
    } else if let Some(n) = s.strip_prefix("tp").and_then(|n| n.parse::<u8>().ok()) {
        OrderTag::Tp(n)
    } else {
        OrderTag::Entry
    }
}

fn status_str(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::Pending => "pending",
        OrderStatus::Filled => "filled",
        OrderStatus::Cancelled => "cancelled",
        OrderStatus::Rejected => "rejected",
    }
}

fn parse_status(s: &str) -> OrderStatus {
    match s {
        "filled" => OrderStatus::Filled,
        "cancelled" => OrderStatus::Cancelled,
        "rejected" => OrderStatus::Rejected,
        _ => OrderStatus::Pending,
    }
}

fn row_to_order(row: &sqlx::sqlite::SqliteRow) -> Order {
    let filled_at: Option<String> = row.get("filled_at");
    Order {
        signal_id: row.get("signal_id"),
        hl_order_id: row.get("hl_order_id"),
        coin: row.get("coin"),
        side: parse_side(row.get::<String, _>("side").as_str()),
        size: row.get("size"),
        price: row.get("price"),
        order_type: parse_order_type(row.get::<String, _>("order_type").as_str()),
        tag: parse_tag(row.get::<String, _>("tag").as_str()),
        status: parse_status(row.get::<String, _>("status").as_str()),
        mode: row.get("mode"),
        filled_at: filled_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|dt| dt.with_timezone(&Utc)),
    }
}

#[async_trait]
impl OrderRepository for SqliteOrderRepository {
    async fn save(&self, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (signal_id, hl_order_id, coin, side, size, price, order_type, tag, status, mode, filled_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&order.signal_id)
        .bind(&order.hl_order_id)
        .bind(&order.coin)
        .bind(side_str(order.side))
        .bind(order.size)
        .bind(order.price)
        .bind(order_type_str(order.order_type))
        .bind(tag_str(order.tag))
        .bind(status_str(order.status))
        .bind(&order.mode)
        .bind(order.filled_at.map(|dt| dt.to_rfc3339()))
        .execute(&self.pool)
        .await
        .context("failed to insert order")?;
        Ok(())
    }

    async fn find_by_coin(&self, coin: &str) -> Result<Vec<Order>> {
        let rows = sqlx::query("SELECT * FROM orders WHERE coin = ? ORDER BY id ASC")
            .bind(coin)
            .fetch_all(&self.pool)
            .await
            .context("failed to query orders by coin")?;
        Ok(rows.iter().map(row_to_order).collect())
    }

    async fn find_by_hl_order_id(&self, hl_order_id: &str) -> Result<Option<Order>> {
        let row = sqlx::query("SELECT * FROM orders WHERE hl_order_id = ? LIMIT 1")
            .bind(hl_order_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to query order by hl_order_id")?;
        Ok(row.map(|r| row_to_order(&r)))
    }

    async fn update_status(&self, hl_order_id: &str, status: OrderStatus) -> Result<()> {
        sqlx::query("UPDATE orders SET status = ? WHERE hl_order_id = ?")
            .bind(status_str(status))
            .bind(hl_order_id)
            .execute(&self.pool)
            .await
            .context("failed to update order status")?;
        Ok(())
    }
}

pub struct SqliteFillRepository {
    pool: SqlitePool,
}

impl SqliteFillRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FillRepository for SqliteFillRepository {
    async fn insert(&self, fill: &Fill) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO fills (hl_order_id, fill_id, coin, price, size, fee, filled_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (hl_order_id, fill_id) DO NOTHING
            "#,
        )
        .bind(&fill.hl_order_id)
        .bind(&fill.fill_id)
        .bind(&fill.coin)
        .bind(fill.price)
        .bind(fill.size)
        .bind(fill.fee)
        .bind(fill.filled_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to insert fill")?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_by_order(&self, hl_order_id: &str) -> Result<Vec<Fill>> {
        let rows = sqlx::query("SELECT * FROM fills WHERE hl_order_id = ? ORDER BY filled_at ASC")
            .bind(hl_order_id)
            .fetch_all(&self.pool)
            .await
            .context("failed to query fills by order")?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let filled_at: String = row.get("filled_at");
                Fill {
                    hl_order_id: row.get("hl_order_id"),
                    fill_id: row.get("fill_id"),
                    coin: row.get("coin"),
                    price: row.get("price"),
                    size: row.get("size"),
                    fee: row.get("fee"),
                    filled_at: DateTime::parse_from_rfc3339(&filled_at).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::candle::Interval;
    use crate::infrastructure::persistence::Database;

    async fn fresh_pool() -> SqlitePool {
        Database::new("sqlite::memory:").await.unwrap().pool
    }

    #[tokio::test]
    async fn candle_round_trip_and_upsert() {
        let pool = fresh_pool().await;
        let repo = SqliteCandleRepository::new(pool);
        let key = CandleKey::new("BTC", Interval::M15, "binance");
        let candle = Candle { t: 1000, o: 10.0, h: 11.0, l: 9.0, c: 10.5, v: 1.0, n: 1 };

        let inserted = repo.insert_candles(&key, &[candle]).await.unwrap();
        assert_eq!(inserted, 1);

        let updated = Candle { c: 10.9, ..candle };
        repo.insert_candles(&key, &[updated]).await.unwrap();

        let rows = repo.get_candles(&key, 0, 2000).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].c, 10.9);
        assert_eq!(repo.get_candle_count(&key).await.unwrap(), 1);
        assert_eq!(repo.get_first_timestamp(&key).await.unwrap(), Some(1000));
        assert_eq!(repo.get_last_timestamp(&key).await.unwrap(), Some(1000));
    }

    #[tokio::test]
    async fn signal_save_is_idempotent_per_alert_id() {
        let pool = fresh_pool().await;
        let repo = SqliteSignalRepository::new(pool);
        let signal = StoredSignal {
            alert_id: "a1".into(),
            source: "strategy".into(),
            coin: "BTC".into(),
            side: Direction::Long,
            entry_price: Some(100.0),
            stop_loss: 95.0,
            take_profits: vec![],
            risk_check_passed: true,
            risk_check_reason: None,
            created_at: Utc::now(),
        };
        repo.save(&signal).await.unwrap();
        repo.save(&signal).await.unwrap();
        assert!(repo.exists("a1").await.unwrap());
    }

    #[tokio::test]
    async fn order_and_fill_round_trip() {
        let pool = fresh_pool().await;
        let order_repo = SqliteOrderRepository::new(pool.clone());
        let fill_repo = SqliteFillRepository::new(pool);

        let order = Order {
            signal_id: "s1".into(),
            hl_order_id: Some("oid1".into()),
            coin: "BTC".into(),
            side: OrderSide::Buy,
            size: 1.0,
            price: Some(100.0),
            order_type: OrderType::Market,
            tag: OrderTag::Entry,
            status: OrderStatus::Filled,
            mode: "live".into(),
            filled_at: Some(Utc::now()),
        };
        order_repo.save(&order).await.unwrap();
        let found = order_repo.find_by_hl_order_id("oid1").await.unwrap().unwrap();
        assert_eq!(found.coin, "BTC");
        assert!(matches!(found.tag, OrderTag::Entry));

        order_repo.update_status("oid1", OrderStatus::Cancelled).await.unwrap();
        let found = order_repo.find_by_hl_order_id("oid1").await.unwrap().unwrap();
        assert!(matches!(found.status, OrderStatus::Cancelled));

        let fill = Fill {
            hl_order_id: "oid1".into(),
            fill_id: "f1".into(),
            coin: "BTC".into(),
            price: 100.0,
            size: 1.0,
            fee: 0.01,
            filled_at: Utc::now(),
        };
        assert!(fill_repo.insert(&fill).await.unwrap());
        assert!(!fill_repo.insert(&fill).await.unwrap());
        assert_eq!(fill_repo.find_by_order("oid1").await.unwrap().len(), 1);
    }
}
