//! Unified warmup + live-tick view over a single `(coin, interval, source)`
//! (spec.md §4.3, C3).

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{error, info, warn};

use crate::candles::cache::CandleCache;
use crate::candles::client::{fetch_candles, FetchOptions};
use crate::domain::candle::{Candle, CandleKey};
use crate::domain::ports::CandlePageFetcher;

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Tick(Candle),
    Close(Candle),
    Stale { last_candle_at: DateTime<Utc>, silent_ms: u64 },
}

/// Connects to a venue's live feed and yields raw ticks until the
/// connection drops. One call == one connection attempt; the streamer's
/// reconnect loop is what retries.
#[async_trait]
pub trait LiveTickSource: Send + Sync {
    async fn connect(&self, key: &CandleKey) -> Result<mpsc::Receiver<Candle>>;
}

struct StreamerState {
    candles: Vec<Candle>,
}

pub struct CandleStreamer {
    key: CandleKey,
    cache: Arc<CandleCache>,
    source: Arc<dyn CandlePageFetcher>,
    live: Arc<dyn LiveTickSource>,
    opts: FetchOptions,
    state: RwLock<StreamerState>,
    tx: broadcast::Sender<StreamEvent>,
    running: Arc<AtomicBool>,
}

impl CandleStreamer {
    pub fn new(
        key: CandleKey,
        cache: Arc<CandleCache>,
        source: Arc<dyn CandlePageFetcher>,
        live: Arc<dyn LiveTickSource>,
        opts: FetchOptions,
    ) -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            key,
            cache,
            source,
            live,
            opts,
            state: RwLock::new(StreamerState { candles: Vec::new() }),
            tx,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Listeners added after `stop()` see no further events: `subscribe`
    /// itself is unaffected, but once the background task exits no more
    /// sends occur on `tx`.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }

    /// Fetches the most recent `bars` via `CandleCache::sync`, discarding
    /// rows that violate the §3 candle invariants.
    pub async fn warmup(&self, bars: usize) -> Result<Vec<Candle>> {
        let interval_ms = self.key.interval.millis().unwrap_or(30 * 24 * 3_600_000);
        let end_ms = Utc::now().timestamp_millis();
        let start_ms = end_ms - interval_ms * bars as i64;

        self.cache
            .sync(&self.key, self.source.as_ref(), start_ms, end_ms, &self.opts)
            .await?;
        let candles = self.cache.get_candles(&self.key, start_ms, end_ms).await?;
        let valid: Vec<Candle> = candles.into_iter().filter(|c| c.is_valid()).collect();

        let mut state = self.state.write().await;
        state.candles = valid.clone();
        Ok(valid)
    }

    /// Direct REST fallback, bypassing the cache.
    pub async fn fetch_historical(&self, end_ms: i64, bars: usize) -> Result<Vec<Candle>> {
        let interval_ms = self.key.interval.millis().unwrap_or(30 * 24 * 3_600_000);
        let start_ms = end_ms - interval_ms * bars as i64;
        fetch_candles(
            self.source.as_ref(),
            &self.key.coin,
            self.key.interval,
            start_ms,
            end_ms,
            &self.opts,
        )
        .await
    }

    pub async fn get_candles(&self) -> Vec<Candle> {
        self.state.read().await.candles.clone()
    }

    pub async fn get_latest(&self) -> Option<Candle> {
        self.state.read().await.candles.last().copied()
    }

    /// Applies the upsert rule (spec.md §4.3): equal `t` replaces the last
    /// stored candle (in-progress update), otherwise appends. Invalid ticks
    /// are discarded silently. Returns whether the bar was closed, i.e. a
    /// genuinely new bar began (a superset `Close` event is also emitted).
    async fn ingest(&self, candle: Candle) -> bool {
        if !candle.is_valid() {
            return false;
        }
        let mut state = self.state.write().await;
        let closed = match state.candles.last_mut() {
            Some(last) if last.t == candle.t => {
                *last = candle;
                false
            }
            Some(last) if candle.t > last.t => {
                state.candles.push(candle);
                true
            }
            None => {
                state.candles.push(candle);
                true
            }
            _ => return false, // t < last.t: out-of-order, discard
        };
        closed
    }

    fn emit(tx: &broadcast::Sender<StreamEvent>, event: StreamEvent) {
        // A callback panic must never crash the streamer: broadcast::send
        // only fails when there are no receivers, which is not an error here.
        let _ = tx.send(event);
    }

    /// Idempotent. Spawns the reconnect loop and the stale watchdog.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move { this.run_reconnect_loop().await });
    }

    /// Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn run_reconnect_loop(self: Arc<Self>) {
        let mut backoff = Duration::from_secs(1);
        const MAX_BACKOFF: Duration = Duration::from_secs(60);
        let interval_ms = self.key.interval.millis().unwrap_or(30 * 24 * 3_600_000) as u64;
        let stale_after = Duration::from_millis(interval_ms * 3);

        while self.running.load(Ordering::SeqCst) {
            let mut rx = match self.live.connect(&self.key).await {
                Ok(rx) => {
                    backoff = Duration::from_secs(1);
                    rx
                }
                Err(e) => {
                    error!(key = %self.key, error = %e, "streamer: connect failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            loop {
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                match tokio::time::timeout(stale_after, rx.recv()).await {
                    Ok(Some(candle)) => {
                        let closed = self.ingest(candle).await;
                        Self::emit(&self.tx, StreamEvent::Tick(candle));
                        if closed {
                            Self::emit(&self.tx, StreamEvent::Close(candle));
                        }
                    }
                    Ok(None) => {
                        warn!(key = %self.key, "streamer: connection dropped, reconnecting");
                        break;
                    }
                    Err(_) => {
                        let last_at = self.get_latest().await.map(|_| Utc::now()).unwrap_or_else(Utc::now);
                        Self::emit(
                            &self.tx,
                            StreamEvent::Stale {
                                last_candle_at: last_at,
                                silent_ms: stale_after.as_millis() as u64,
                            },
                        );
                    }
                }
            }
        }
        info!(key = %self.key, "streamer: stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candles::cache::CandleCache;
    use crate::domain::candle::Interval;
    use crate::domain::repositories::CandleRepository;

    struct NullRepo;
    #[async_trait]
    impl CandleRepository for NullRepo {
        async fn insert_candles(&self, _key: &CandleKey, _candles: &[Candle]) -> Result<usize> {
            Ok(0)
        }
        async fn get_candles(&self, _key: &CandleKey, _s: i64, _e: i64) -> Result<Vec<Candle>> {
            Ok(vec![])
        }
        async fn get_first_timestamp(&self, _key: &CandleKey) -> Result<Option<i64>> {
            Ok(None)
        }
        async fn get_last_timestamp(&self, _key: &CandleKey) -> Result<Option<i64>> {
            Ok(None)
        }
        async fn get_candle_count(&self, _key: &CandleKey) -> Result<usize> {
            Ok(0)
        }
    }

    struct NullSource;
    #[async_trait]
    impl CandlePageFetcher for NullSource {
        async fn fetch_page(&self, _c: &str, _i: Interval, _s: i64, _l: u32) -> Result<Vec<Candle>> {
            Ok(vec![])
        }
    }

    struct NullLive;
    #[async_trait]
    impl LiveTickSource for NullLive {
        async fn connect(&self, _key: &CandleKey) -> Result<mpsc::Receiver<Candle>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    fn make_streamer() -> CandleStreamer {
        let cache = Arc::new(CandleCache::new(Arc::new(NullRepo)));
        CandleStreamer::new(
            CandleKey::new("BTC", Interval::M1, "test"),
            cache,
            Arc::new(NullSource),
            Arc::new(NullLive),
            FetchOptions { candles_per_request: 100, request_delay_ms: 0 },
        )
    }

    fn c(t: i64) -> Candle {
        Candle { t, o: 1.0, h: 1.0, l: 1.0, c: 1.0, v: 1.0, n: 1 }
    }

    #[tokio::test]
    async fn ingest_replaces_in_progress_bar() {
        let streamer = make_streamer();
        assert!(streamer.ingest(c(1000)).await);
        assert!(!streamer.ingest(Candle { c: 2.0, ..c(1000) }).await);
        let candles = streamer.get_candles().await;
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].c, 2.0);
    }

    #[tokio::test]
    async fn ingest_appends_new_bar_and_reports_close() {
        let streamer = make_streamer();
        assert!(streamer.ingest(c(1000)).await);
        assert!(streamer.ingest(c(2000)).await);
        assert_eq!(streamer.get_candles().await.len(), 2);
    }

    #[tokio::test]
    async fn ingest_discards_invalid_ticks() {
        let streamer = make_streamer();
        let invalid = Candle { t: 1000, o: 1.0, h: 0.5, l: 1.0, c: 1.0, v: 1.0, n: 1 };
        assert!(!streamer.ingest(invalid).await);
        assert!(streamer.get_candles().await.is_empty());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let streamer = Arc::new(make_streamer());
        streamer.start();
        streamer.start();
        assert!(streamer.running.load(Ordering::SeqCst));
        streamer.stop();
        assert!(!streamer.running.load(Ordering::SeqCst));
    }
}
