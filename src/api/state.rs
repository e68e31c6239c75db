//! Shared application state for the control API (spec.md §6), grounded on
//! the teacher's `web::state::AppState` (a `Clone` bundle of `Arc`-wrapped
//! collaborators handed to every handler via axum's `State` extractor).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::candles::cache::CandleCache;
use crate::config::Config;
use crate::domain::ports::{Dedup, ExchangeAdapter};
use crate::domain::repositories::{OrderRepository, SignalRepository};
use crate::events::EventLog;
use crate::infrastructure::observability::Metrics;
use crate::live::CoinRunner;

use super::auth::RateLimitLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub runners: Arc<HashMap<String, Arc<CoinRunner>>>,
    pub candle_cache: Arc<CandleCache>,
    pub candle_source_label: String,
    pub order_repo: Arc<dyn OrderRepository>,
    pub signal_repo: Arc<dyn SignalRepository>,
    pub exchange: Arc<dyn ExchangeAdapter>,
    pub dedup: Arc<dyn Dedup>,
    pub events: Arc<EventLog>,
    pub metrics: Arc<Metrics>,
    pub rate_limiter: RateLimitLayer,
    pub started_at: Instant,
}

impl AppState {
    pub fn runner(&self, coin: &str) -> Option<Arc<CoinRunner>> {
        self.runners.get(coin).cloned()
    }
}
