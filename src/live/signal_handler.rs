//! Converts an admitted signal into exchange orders and position-book state
//! (spec.md §4.13, C13).

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::errors::SignalError;
use crate::domain::ports::{ExchangeAdapter, NotificationSink};
use crate::domain::repositories::OrderRepository;
use crate::domain::trading::{Direction, Order, OrderSide, OrderStatus, OrderTag, OrderType, Position, Signal};
use crate::live::position_book::PositionBook;

pub struct SignalHandler {
    exchange: Arc<dyn ExchangeAdapter>,
    order_repo: Arc<dyn OrderRepository>,
    notifications: Arc<dyn NotificationSink>,
}

impl SignalHandler {
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        order_repo: Arc<dyn OrderRepository>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        Self { exchange, order_repo, notifications }
    }

    /// Drives the full order-placement sequence of spec.md §4.13 for an
    /// already risk-admitted signal of `size` at leverage `leverage`.
    pub async fn handle(
        &self,
        coin: &str,
        signal: &Signal,
        size: f64,
        leverage: f64,
        isolated: bool,
        book: &mut PositionBook,
    ) -> Result<(), SignalError> {
        self.exchange
            .set_leverage(coin, leverage, isolated)
            .await
            .map_err(|e| SignalError::ExchangeFailed { reason: e.to_string() })?;

        let entry_side = signal.direction;

        let entry_report = match signal.entry_price {
            None => self
                .exchange
                .place_market_order(coin, entry_side, size, false, OrderTag::Entry)
                .await
                .map_err(|e| SignalError::ExchangeFailed { reason: e.to_string() })?,
            Some(limit_price) => self
                .exchange
                .place_limit_order(coin, entry_side, size, limit_price, false, OrderTag::Entry)
                .await
                .map_err(|e| SignalError::ExchangeFailed { reason: e.to_string() })?,
        };

        let signal_id = Uuid::new_v4().to_string();
        let position = Position {
            coin: coin.to_string(),
            direction: signal.direction,
            entry_price: entry_report.avg_price,
            size: entry_report.filled_size,
            stop_loss: signal.stop_loss,
            take_profits: signal.take_profits.clone(),
            trailing_stop_loss: None,
            opened_at: Utc::now(),
            signal_id: signal_id.clone(),
            liquidation_px: None,
        };
        book.open(position);
        let entry_order_type = match signal.entry_price {
            None => OrderType::Market,
            Some(_) => OrderType::Limit,
        };
        self.save_order(&signal_id, coin, entry_side, entry_report.filled_size, Some(entry_report.avg_price), entry_order_type, OrderTag::Entry).await;

        let sl_side = signal.direction.opposite();
        match self
            .exchange
            .place_stop_order(coin, sl_side, entry_report.filled_size, signal.stop_loss, OrderTag::Sl)
            .await
        {
            Ok(_) => {
                self.save_order(&signal_id, coin, sl_side, entry_report.filled_size, Some(signal.stop_loss), OrderType::Stop, OrderTag::Sl).await;
            }
            Err(e) => {
                error!(coin, error = %e, "signal handler: stop-loss placement failed, closing position defensively");
                self.notifications.alarm(&format!("SL placement failed for {coin}, closing position: {e}")).await.ok();
                let _ = self
                    .exchange
                    .place_market_order(coin, sl_side, entry_report.filled_size, true, OrderTag::Sl)
                    .await;
                book.close(coin);
                return Err(SignalError::ExchangeFailed { reason: e.to_string() });
            }
        }

        for (i, tp) in signal.take_profits.iter().enumerate() {
            let tp_size = entry_report.filled_size * tp.pct_of_position;
            if tp_size <= 0.0 {
                continue;
            }
            let tag = OrderTag::Tp((i + 1) as u8);
            match self
                .exchange
                .place_limit_order(coin, sl_side, tp_size, tp.price, true, tag)
                .await
            {
                Ok(_) => {
                    self.save_order(&signal_id, coin, sl_side, tp_size, Some(tp.price), OrderType::Limit, tag).await;
                }
                Err(e) => {
                    warn!(coin, tag = %tag, error = %e, "signal handler: take-profit placement degraded");
                    self.notifications.alarm(&format!("TP{} placement failed for {coin}: {e}", i + 1)).await.ok();
                }
            }
        }

        let risk_usd = (entry_report.avg_price - signal.stop_loss).abs() * entry_report.filled_size;
        let tp_summary: Vec<String> = signal.take_profits.iter().map(|tp| format!("{:.2}", tp.price)).collect();
        let message = format!(
            "{coin} {direction} entry {entry:.2} SL {sl:.2} TP [{tps}] risk ${risk:.2}",
            direction = signal.direction,
            entry = entry_report.avg_price,
            sl = signal.stop_loss,
            tps = tp_summary.join(", "),
            risk = risk_usd,
        );
        self.notifications.notify(&message).await.ok();
        info!(coin, signal_id, "signal handler: position opened");

        Ok(())
    }

    async fn save_order(&self, signal_id: &str, coin: &str, side: Direction, size: f64, price: Option<f64>, order_type: OrderType, tag: OrderTag) {
        let order = Order {
            signal_id: signal_id.to_string(),
            hl_order_id: None,
            coin: coin.to_string(),
            side: match side {
                Direction::Long => OrderSide::Buy,
                Direction::Short => OrderSide::Sell,
            },
            size,
            price,
            order_type,
            tag,
            status: OrderStatus::Filled,
            mode: "live".to_string(),
            filled_at: Some(Utc::now()),
        };
        if let Err(e) = self.order_repo.save(&order).await {
            error!(coin, error = %e, "signal handler: failed to persist order row");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::candle::Interval;
    use crate::domain::ports::{CandlePageFetcher, FillReport};
    use crate::domain::trading::TakeProfit;
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FailingSlExchange {
        sl_attempted: AtomicBool,
    }

    #[async_trait]
    impl ExchangeAdapter for FailingSlExchange {
        async fn set_leverage(&self, _coin: &str, _leverage: f64, _isolated: bool) -> AnyResult<()> {
            Ok(())
        }
        async fn place_market_order(&self, _coin: &str, _direction: Direction, size: f64, _reduce_only: bool, tag: OrderTag) -> AnyResult<FillReport> {
            if matches!(tag, OrderTag::Sl) {
                self.sl_attempted.store(true, Ordering::SeqCst);
            }
            Ok(FillReport { hl_order_id: "oid1".into(), filled_size: size, avg_price: 100.0 })
        }
        async fn place_limit_order(&self, _coin: &str, _direction: Direction, size: f64, price: f64, _reduce_only: bool, _tag: OrderTag) -> AnyResult<FillReport> {
            Ok(FillReport { hl_order_id: "oid2".into(), filled_size: size, avg_price: price })
        }
        async fn place_stop_order(&self, _coin: &str, _direction: Direction, _size: f64, _trigger_price: f64, _tag: OrderTag) -> AnyResult<FillReport> {
            anyhow::bail!("exchange rejected stop order")
        }
        async fn cancel_order(&self, _hl_order_id: &str) -> AnyResult<()> {
            Ok(())
        }
        async fn open_order_ids(&self, _coin: &str) -> AnyResult<Vec<String>> {
            Ok(vec![])
        }
    }

    struct NullOrderRepo;
    #[async_trait]
    impl OrderRepository for NullOrderRepo {
        async fn save(&self, _order: &Order) -> AnyResult<()> {
            Ok(())
        }
        async fn find_by_coin(&self, _coin: &str) -> AnyResult<Vec<Order>> {
            Ok(vec![])
        }
        async fn find_by_hl_order_id(&self, _hl_order_id: &str) -> AnyResult<Option<Order>> {
            Ok(None)
        }
        async fn update_status(&self, _hl_order_id: &str, _status: OrderStatus) -> AnyResult<()> {
            Ok(())
        }
    }

    struct NullNotifications;
    #[async_trait]
    impl NotificationSink for NullNotifications {
        async fn notify(&self, _message: &str) -> AnyResult<()> {
            Ok(())
        }
        async fn alarm(&self, _message: &str) -> AnyResult<()> {
            Ok(())
        }
    }

    #[allow(dead_code)]
    struct UnusedFetcher;
    #[async_trait]
    impl CandlePageFetcher for UnusedFetcher {
        async fn fetch_page(&self, _c: &str, _i: Interval, _s: i64, _l: u32) -> AnyResult<Vec<crate::domain::candle::Candle>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn stop_loss_failure_closes_position_and_market_closes() {
        let exchange = Arc::new(FailingSlExchange { sl_attempted: AtomicBool::new(false) });
        let handler = SignalHandler::new(exchange.clone(), Arc::new(NullOrderRepo), Arc::new(NullNotifications));
        let mut book = PositionBook::new();

        let signal = Signal {
            direction: Direction::Long,
            entry_price: None,
            stop_loss: 95.0,
            take_profits: vec![TakeProfit { price: 110.0, pct_of_position: 1.0 }],
            comment: String::new(),
        };

        let result = handler.handle("BTC", &signal, 1.0, 5.0, true, &mut book).await;
        assert!(result.is_err());
        assert!(book.get("BTC").is_none());
        assert!(exchange.sl_attempted.load(Ordering::SeqCst));
    }
}
