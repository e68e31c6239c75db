//! Durable, per-`(coin, interval, source)` OHLCV store (spec.md §4.2, C2).

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::candles::client::{fetch_candles, FetchOptions};
use crate::domain::candle::{Candle, CandleKey};
use crate::domain::ports::CandlePageFetcher;
use crate::domain::repositories::CandleRepository;

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncResult {
    pub fetched: usize,
    pub cached: usize,
}

/// Wraps a `CandleRepository` with the sync orchestration and per-key
/// serialization of spec.md §4.2 / §5: concurrent syncs on the same key
/// never produce duplicate fetches.
pub struct CandleCache {
    repo: Arc<dyn CandleRepository>,
    locks: Mutex<HashMap<CandleKey, Arc<Mutex<()>>>>,
}

impl CandleCache {
    pub fn new(repo: Arc<dyn CandleRepository>) -> Self {
        Self {
            repo,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, key: &CandleKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn insert_candles(&self, key: &CandleKey, candles: &[Candle]) -> Result<usize> {
        self.repo.insert_candles(key, candles).await
    }

    pub async fn get_candles(
        &self,
        key: &CandleKey,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>> {
        self.repo.get_candles(key, start_ms, end_ms).await
    }

    /// Orchestrates a gap-filling fetch against `source`: if the cache
    /// already covers `[start_ms, end_ms]`, returns `{fetched: 0, ...}`
    /// without calling out. Otherwise determines the gap, fetches it, and
    /// always re-fetches the last cached bar to overwrite an in-progress
    /// candle with its finalized OHLCV.
    pub async fn sync(
        &self,
        key: &CandleKey,
        source: &dyn CandlePageFetcher,
        start_ms: i64,
        end_ms: i64,
        opts: &FetchOptions,
    ) -> Result<SyncResult> {
        let guard = self.lock_for(key).await;
        let _permit = guard.lock().await;

        let first_ts = self.repo.get_first_timestamp(key).await?;
        let last_ts = self.repo.get_last_timestamp(key).await?;

        if let (Some(first), Some(last)) = (first_ts, last_ts) {
            if first <= start_ms && last >= end_ms {
                debug!(%key, "candle cache: already covers requested range");
                let cached = self.repo.get_candle_count(key).await?;
                return Ok(SyncResult { fetched: 0, cached });
            }
        }

        // Re-fetch from just before the last cached bar (or from the start
        // of the window if the cache is empty) so the in-progress candle at
        // `last_ts` gets overwritten with its finalized values.
        let interval_ms = key.interval.millis().unwrap_or(30 * 24 * 3_600_000);
        let fetch_from = last_ts.map(|t| t - interval_ms).unwrap_or(start_ms).max(0);

        let fetched = fetch_candles(source, &key.coin, key.interval, fetch_from, end_ms, opts).await?;
        let fetched_count = fetched.len();

        self.repo.insert_candles(key, &fetched).await?;
        let cached = self.repo.get_candle_count(key).await?;

        info!(
            %key,
            fetched = fetched_count,
            cached,
            "candle cache: sync complete"
        );
        Ok(SyncResult {
            fetched: fetched_count,
            cached,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::candle::Interval;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct InMemoryCandleRepo {
        rows: StdMutex<HashMap<CandleKey, Vec<Candle>>>,
    }

    impl InMemoryCandleRepo {
        fn new() -> Self {
            Self {
                rows: StdMutex::new(HashMap::new()),
            }
        }

        fn seed(&self, key: &CandleKey, candles: Vec<Candle>) {
            self.rows.lock().unwrap().insert(key.clone(), candles);
        }
    }

    #[async_trait]
    impl CandleRepository for InMemoryCandleRepo {
        async fn insert_candles(&self, key: &CandleKey, candles: &[Candle]) -> Result<usize> {
            let mut rows = self.rows.lock().unwrap();
            let existing = rows.entry(key.clone()).or_default();
            let mut inserted = 0;
            for c in candles {
                if let Some(pos) = existing.iter().position(|e| e.t == c.t) {
                    existing[pos] = *c;
                } else {
                    existing.push(*c);
                    inserted += 1;
                }
            }
            existing.sort_by_key(|c| c.t);
            Ok(inserted)
        }

        async fn get_candles(&self, key: &CandleKey, start_ms: i64, end_ms: i64) -> Result<Vec<Candle>> {
            let rows = self.rows.lock().unwrap();
            Ok(rows
                .get(key)
                .map(|v| v.iter().filter(|c| c.t >= start_ms && c.t <= end_ms).copied().collect())
                .unwrap_or_default())
        }

        async fn get_first_timestamp(&self, key: &CandleKey) -> Result<Option<i64>> {
            Ok(self.rows.lock().unwrap().get(key).and_then(|v| v.first()).map(|c| c.t))
        }

        async fn get_last_timestamp(&self, key: &CandleKey) -> Result<Option<i64>> {
            Ok(self.rows.lock().unwrap().get(key).and_then(|v| v.last()).map(|c| c.t))
        }

        async fn get_candle_count(&self, key: &CandleKey) -> Result<usize> {
            Ok(self.rows.lock().unwrap().get(key).map(|v| v.len()).unwrap_or(0))
        }
    }

    fn c(t: i64, v: f64) -> Candle {
        Candle { t, o: v, h: v, l: v, c: v, v: 1.0, n: 1 }
    }

    struct ScriptedSource(StdMutex<Vec<Candle>>);

    #[async_trait]
    impl CandlePageFetcher for ScriptedSource {
        async fn fetch_page(&self, _coin: &str, _interval: Interval, since_ms: i64, _limit: u32) -> Result<Vec<Candle>> {
            let mut rows = self.0.lock().unwrap();
            let page: Vec<Candle> = rows.iter().filter(|c| c.t >= since_ms).copied().collect();
            rows.clear();
            Ok(page)
        }
    }

    #[tokio::test]
    async fn sync_backfills_a_gap() {
        // Scenario 3 (spec.md §8): cache has {t=5000}; sync(0, 5000) returns
        // candles at t in {1000, 2000} -> {fetched: 2, cached: 3}.
        let repo = Arc::new(InMemoryCandleRepo::new());
        let key = CandleKey::new("BTC", Interval::M1, "test");
        repo.seed(&key, vec![c(5000, 100.0)]);

        let source = ScriptedSource(StdMutex::new(vec![c(1000, 1.0), c(2000, 2.0)]));
        let cache = CandleCache::new(repo.clone());
        let opts = FetchOptions {
            candles_per_request: 100,
            request_delay_ms: 0,
        };

        let result = cache.sync(&key, &source, 0, 5000, &opts).await.unwrap();
        assert_eq!(result.fetched, 2);
        assert_eq!(result.cached, 3);

        let rows = cache.get_candles(&key, 0, 6000).await.unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn sync_is_a_noop_when_range_is_covered() {
        let repo = Arc::new(InMemoryCandleRepo::new());
        let key = CandleKey::new("BTC", Interval::M1, "test");
        repo.seed(&key, vec![c(0, 1.0), c(1000, 2.0), c(2000, 3.0)]);

        let source = ScriptedSource(StdMutex::new(vec![]));
        let cache = CandleCache::new(repo);
        let opts = FetchOptions {
            candles_per_request: 100,
            request_delay_ms: 0,
        };
        let result = cache.sync(&key, &source, 0, 2000, &opts).await.unwrap();
        assert_eq!(result.fetched, 0);
        assert_eq!(result.cached, 3);
    }

    #[tokio::test]
    async fn in_progress_candle_is_overwritten_on_sync() {
        // Scenario 4 (spec.md §8): the bar at the cached tail is replaced
        // with its finalized values, and a new bar past it is appended.
        let repo = Arc::new(InMemoryCandleRepo::new());
        let key = CandleKey::new("BTC", Interval::M1, "test");
        repo.seed(&key, vec![Candle { t: 5000, o: 100.0, h: 105.0, l: 99.0, c: 102.0, v: 10.0, n: 1 }]);

        let source = ScriptedSource(StdMutex::new(vec![
            Candle { t: 5000, o: 100.0, h: 112.0, l: 95.0, c: 108.0, v: 50.0, n: 3 },
            Candle { t: 6000, o: 108.0, h: 110.0, l: 107.0, c: 109.0, v: 5.0, n: 1 },
        ]));
        let cache = CandleCache::new(repo);
        let opts = FetchOptions {
            candles_per_request: 100,
            request_delay_ms: 0,
        };
        cache.sync(&key, &source, 0, 6000, &opts).await.unwrap();

        let rows = cache.get_candles(&key, 0, 6000).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].h, 112.0);
        assert_eq!(rows[0].v, 50.0);
        assert_eq!(rows[1].t, 6000);
    }

    #[tokio::test]
    async fn cache_isolates_by_coin() {
        let repo = Arc::new(InMemoryCandleRepo::new());
        let key_a = CandleKey::new("BTC", Interval::M1, "x");
        let key_b = CandleKey::new("BTC", Interval::M1, "y");
        repo.seed(&key_a, vec![c(0, 1.0)]);
        repo.seed(&key_b, vec![c(0, 2.0), c(1000, 3.0)]);

        let cache = CandleCache::new(repo);
        let rows = cache.get_candles(&key_a, 0, 10_000).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].c, 1.0);
    }
}
