//! Event log / dashboard events (spec.md SPEC_FULL §4 C17): an append-only
//! structured `tracing` event per state transition, plus an in-memory ring
//! buffer the control API exposes at `GET /signals` (spec.md §6).

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

const RING_BUFFER_CAPACITY: usize = 500;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    SignalAdmitted { coin: String, direction: String, size: f64 },
    SignalRejected { coin: String, reason: String },
    PositionOpened { coin: String, direction: String, entry_price: f64, size: f64 },
    PositionClosed { coin: String, reason: String },
    OrderFilled { coin: String, hl_order_id: String, tag: String },
    PhaseChanged { from: String, to: String },
    StreamerStale { coin: String, interval: String, silent_ms: i64 },
}

impl EventKind {
    /// The coin this event concerns, if any (`PhaseChanged` is global).
    pub fn coin(&self) -> Option<&str> {
        match self {
            EventKind::SignalAdmitted { coin, .. }
            | EventKind::SignalRejected { coin, .. }
            | EventKind::PositionOpened { coin, .. }
            | EventKind::PositionClosed { coin, .. }
            | EventKind::OrderFilled { coin, .. }
            | EventKind::StreamerStale { coin, .. } => Some(coin),
            EventKind::PhaseChanged { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Bounded FIFO of the most recent dashboard events, shared behind an
/// `Arc` between every component that wants to record one and the control
/// API handler that serves them.
pub struct EventLog {
    events: RwLock<VecDeque<DashboardEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: RwLock::new(VecDeque::with_capacity(RING_BUFFER_CAPACITY)) }
    }

    pub async fn record(&self, kind: EventKind) {
        info!(?kind, "event log: dashboard event recorded");
        let mut events = self.events.write().await;
        if events.len() >= RING_BUFFER_CAPACITY {
            events.pop_front();
        }
        events.push_back(DashboardEvent { at: Utc::now(), kind });
    }

    pub async fn recent(&self, limit: usize) -> Vec<DashboardEvent> {
        let events = self.events.read().await;
        events.iter().rev().take(limit).cloned().collect()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recent_returns_newest_first() {
        let log = EventLog::new();
        log.record(EventKind::SignalAdmitted { coin: "BTC".into(), direction: "long".into(), size: 1.0 }).await;
        log.record(EventKind::SignalRejected { coin: "ETH".into(), reason: "Duplicate".into() }).await;

        let recent = log.recent(10).await;
        assert_eq!(recent.len(), 2);
        assert!(matches!(recent[0].kind, EventKind::SignalRejected { .. }));
    }

    #[tokio::test]
    async fn ring_buffer_evicts_oldest_past_capacity() {
        let log = EventLog::new();
        for i in 0..(RING_BUFFER_CAPACITY + 10) {
            log.record(EventKind::PhaseChanged { from: "refine".into(), to: format!("iter-{i}") }).await;
        }
        let events = log.events.read().await;
        assert_eq!(events.len(), RING_BUFFER_CAPACITY);
    }
}
