//! Paginated OHLCV fetcher (spec.md §4.1, C1).

use anyhow::Result;
use std::time::Duration;
use tracing::debug;

use crate::domain::candle::{dedup_sort_candles, Candle, Interval};
use crate::domain::ports::CandlePageFetcher;

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub candles_per_request: u32,
    pub request_delay_ms: u64,
}

/// Fetches `[startMs, endMs]` for `coin`/`interval` from `source`, paginating
/// until the upstream stream is caught up. Errors from the upstream call
/// propagate unwrapped; no retries happen here (spec.md §4.1, §7).
pub async fn fetch_candles(
    source: &dyn CandlePageFetcher,
    coin: &str,
    interval: Interval,
    start_ms: i64,
    end_ms: i64,
    opts: &FetchOptions,
) -> Result<Vec<Candle>> {
    let mut since = start_ms;
    let mut collected: Vec<Candle> = Vec::new();

    loop {
        if since >= end_ms {
            break;
        }
        let page = source
            .fetch_page(coin, interval, since, opts.candles_per_request)
            .await?;

        if page.is_empty() {
            break;
        }

        let last_ts = page.iter().map(|c| c.t).max().unwrap();
        collected.extend(page.iter().filter(|c| c.t <= end_ms).copied());

        // No-progress guard: the upstream page didn't move the cursor forward.
        if last_ts <= since {
            break;
        }

        let page_len = page.len() as u32;
        let interval_ms = interval.millis().unwrap_or(30 * 24 * 3_600_000);

        if page_len < opts.candles_per_request {
            break;
        }

        since = last_ts + interval_ms;
        debug!(coin, %interval, since, "candle client: paginating");
        if opts.request_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(opts.request_delay_ms)).await;
        }
    }

    Ok(dedup_sort_candles(collected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedSource {
        pages: Mutex<Vec<Vec<Candle>>>,
        calls: Mutex<u32>,
    }

    fn c(t: i64) -> Candle {
        Candle { t, o: 1.0, h: 1.0, l: 1.0, c: 1.0, v: 1.0, n: 1 }
    }

    #[async_trait]
    impl CandlePageFetcher for ScriptedSource {
        async fn fetch_page(
            &self,
            _coin: &str,
            _interval: Interval,
            _since_ms: i64,
            _limit: u32,
        ) -> Result<Vec<Candle>> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            let mut pages = self.pages.lock().unwrap();
            Ok(if pages.is_empty() {
                vec![]
            } else {
                pages.remove(0)
            })
        }
    }

    #[tokio::test]
    async fn dedup_pagination_stops_when_caught_up() {
        // Scenario 1 (spec.md §8): pages [ohlcv(1000), ohlcv(1000), ohlcv(2000)]
        // with a candles_per_request of 2, yielding t in {1000, 2000} after one page.
        let source = ScriptedSource {
            pages: Mutex::new(vec![vec![c(1000), c(2000)]]),
            calls: Mutex::new(0),
        };
        let opts = FetchOptions {
            candles_per_request: 5,
            request_delay_ms: 0,
        };
        let out = fetch_candles(&source, "BTC", Interval::M1, 0, 10_000, &opts)
            .await
            .unwrap();
        assert_eq!(out.iter().map(|c| c.t).collect::<Vec<_>>(), vec![1000, 2000]);
        assert_eq!(*source.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn stale_timestamp_stops_the_loop() {
        // Scenario 2 (spec.md §8): second page is behind `since`, both
        // candles retained, exactly two requests issued.
        let source = ScriptedSource {
            pages: Mutex::new(vec![vec![c(1000)], vec![c(500)]]),
            calls: Mutex::new(0),
        };
        let opts = FetchOptions {
            candles_per_request: 1,
            request_delay_ms: 0,
        };
        let out = fetch_candles(&source, "BTC", Interval::M1, 0, 10_000, &opts)
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(*source.calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn empty_page_stops_the_loop() {
        let source = ScriptedSource {
            pages: Mutex::new(vec![vec![]]),
            calls: Mutex::new(0),
        };
        let opts = FetchOptions {
            candles_per_request: 5,
            request_delay_ms: 0,
        };
        let out = fetch_candles(&source, "BTC", Interval::M1, 0, 10_000, &opts)
            .await
            .unwrap();
        assert!(out.is_empty());
    }
}
