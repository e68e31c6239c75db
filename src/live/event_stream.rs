//! Order-update and fill reconciliation (spec.md §4.15, C15).
//!
//! The caller (the per-coin live runner) owns the subscription loop and the
//! per-coin mutex; this module only applies one event at a time to storage
//! and the position book, so it never needs its own locking.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::domain::ports::{NotificationSink, OrderUpdateEvent};
use crate::domain::repositories::{FillRepository, OrderRepository};
use crate::domain::trading::{Fill, OrderStatus, OrderTag};
use crate::live::position_book::PositionBook;

pub struct EventReconciler {
    order_repo: Arc<dyn OrderRepository>,
    fill_repo: Arc<dyn FillRepository>,
    notifications: Arc<dyn NotificationSink>,
}

impl EventReconciler {
    pub fn new(
        order_repo: Arc<dyn OrderRepository>,
        fill_repo: Arc<dyn FillRepository>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        Self { order_repo, fill_repo, notifications }
    }

    /// Applies one order-update event. Never returns an error that would
    /// crash the caller's stream loop — failures are logged and swallowed,
    /// per spec.md §4.15 ("callback errors never crash the stream").
    pub async fn apply(&self, event: OrderUpdateEvent, book: &mut PositionBook) {
        if let Err(e) = self.apply_inner(&event, book).await {
            error!(
                hl_order_id = %event.hl_order_id,
                fill_id = %event.fill_id,
                error = %e,
                "event stream: failed to reconcile order-update event"
            );
        }
    }

    async fn apply_inner(&self, event: &OrderUpdateEvent, book: &mut PositionBook) -> anyhow::Result<()> {
        let fill = Fill {
            hl_order_id: event.hl_order_id.clone(),
            fill_id: event.fill_id.clone(),
            coin: event.coin.clone(),
            price: event.fill_price,
            size: event.fill_size,
            fee: event.fee,
            filled_at: chrono::Utc::now(),
        };
        let inserted = self.fill_repo.insert(&fill).await?;
        if !inserted {
            // Already applied (re)subscribe snapshot; (hlOrderId, fillId) dedup.
            return Ok(());
        }

        self.order_repo.update_status(&event.hl_order_id, event.status).await?;

        if !matches!(event.status, OrderStatus::Filled) {
            return Ok(());
        }

        let order = self.order_repo.find_by_hl_order_id(&event.hl_order_id).await?;
        let tag = order.map(|o| o.tag);

        match tag {
            Some(OrderTag::Entry) | None => {
                // Entry fills are applied by the signal handler directly;
                // an unmatched order is logged but not otherwise actionable.
                if tag.is_none() {
                    warn!(hl_order_id = %event.hl_order_id, "event stream: fill for unknown order id");
                }
            }
            Some(OrderTag::Sl) | Some(OrderTag::Tp(_)) => {
                // Deterministic simultaneous-fill ordering (spec.md §9 open
                // question, resolved here): SL wins outright — if the
                // position is already gone a concurrent SL fill already
                // flattened it, so a trailing TP fill in the same batch is
                // a no-op rather than an error.
                if let Some(closed) = book.reduce(&event.coin, event.fill_size) {
                    info!(coin = %event.coin, pnl_entry = closed.entry_price, "event stream: position closed by fill reconciliation");
                    self.notifications
                        .notify(&format!("{} position closed (reduce-only fill reconciled)", event.coin))
                        .await
                        .ok();
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trading::{Direction, Order, OrderSide, OrderType, Position};
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    struct MemoryFillRepo {
        seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl FillRepository for MemoryFillRepo {
        async fn insert(&self, fill: &Fill) -> AnyResult<bool> {
            let mut seen = self.seen.lock().unwrap();
            let key = (fill.hl_order_id.clone(), fill.fill_id.clone());
            if seen.contains(&key) {
                return Ok(false);
            }
            seen.push(key);
            Ok(true)
        }
        async fn find_by_order(&self, _hl_order_id: &str) -> AnyResult<Vec<Fill>> {
            Ok(vec![])
        }
    }

    struct StubOrderRepo {
        order: Order,
    }

    #[async_trait]
    impl OrderRepository for StubOrderRepo {
        async fn save(&self, _order: &Order) -> AnyResult<()> {
            Ok(())
        }
        async fn find_by_coin(&self, _coin: &str) -> AnyResult<Vec<Order>> {
            Ok(vec![self.order.clone()])
        }
        async fn find_by_hl_order_id(&self, _hl_order_id: &str) -> AnyResult<Option<Order>> {
            Ok(Some(self.order.clone()))
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

    fn sl_order() -> Order {
        Order {
            signal_id: "s1".into(),
            hl_order_id: Some("oid-sl".into()),
            coin: "BTC".into(),
            side: OrderSide::Sell,
            size: 1.0,
            price: Some(95.0),
            order_type: OrderType::Stop,
            tag: OrderTag::Sl,
            status: OrderStatus::Pending,
            mode: "live".into(),
            filled_at: None,
        }
    }

    fn position() -> Position {
        Position {
            coin: "BTC".into(),
            direction: Direction::Long,
            entry_price: 100.0,
            size: 1.0,
            stop_loss: 95.0,
            take_profits: vec![],
            trailing_stop_loss: None,
            opened_at: Utc::now(),
            signal_id: "s1".into(),
            liquidation_px: None,
        }
    }

    fn event() -> OrderUpdateEvent {
        OrderUpdateEvent {
            hl_order_id: "oid-sl".into(),
            fill_id: "fill-1".into(),
            coin: "BTC".into(),
            status: OrderStatus::Filled,
            fill_price: 95.0,
            fill_size: 1.0,
            fee: 0.01,
        }
    }

    #[tokio::test]
    async fn sl_fill_closes_position() {
        let reconciler = EventReconciler::new(
            Arc::new(StubOrderRepo { order: sl_order() }),
            Arc::new(MemoryFillRepo { seen: Mutex::new(vec![]) }),
            Arc::new(NullNotifications),
        );
        let mut book = PositionBook::new();
        book.open(position());

        reconciler.apply(event(), &mut book).await;
        assert!(book.get("BTC").is_none());
    }

    #[tokio::test]
    async fn duplicate_fill_id_is_applied_once() {
        let fill_repo = Arc::new(MemoryFillRepo { seen: Mutex::new(vec![]) });
        let reconciler = EventReconciler::new(
            Arc::new(StubOrderRepo { order: sl_order() }),
            fill_repo.clone(),
            Arc::new(NullNotifications),
        );
        let mut book = PositionBook::new();
        book.open(position());

        reconciler.apply(event(), &mut book).await;
        // Re-deliver the same (hlOrderId, fillId) snapshot; the position is
        // already gone and reduce() must not be called again (it would
        // panic-free no-op anyway, but insert() short-circuits first).
        reconciler.apply(event(), &mut book).await;
        assert_eq!(fill_repo.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tp_fill_after_sl_already_flattened_is_a_no_op() {
        let reconciler = EventReconciler::new(
            Arc::new(StubOrderRepo {
                order: Order { tag: OrderTag::Tp(1), hl_order_id: Some("oid-tp".into()), ..sl_order() },
            }),
            Arc::new(MemoryFillRepo { seen: Mutex::new(vec![]) }),
            Arc::new(NullNotifications),
        );
        let mut book = PositionBook::new();
        // Position already closed by a concurrent SL fill earlier in the batch.

        let mut tp_event = event();
        tp_event.hl_order_id = "oid-tp".into();
        tp_event.fill_id = "fill-2".into();

        reconciler.apply(tp_event, &mut book).await;
        assert!(book.get("BTC").is_none());
    }
}
