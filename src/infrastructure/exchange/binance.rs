//! Binance REST candle source, grounded on the teacher's
//! `BinanceMarketDataService::fetch_historical_bars_internal` (same
//! `/api/v3/klines` endpoint and array-positional parsing), adapted to the
//! `CandlePageFetcher` port's `(coin, interval, since_ms, limit)` shape.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;

use crate::candles::symbols::venue_symbol;
use crate::config::Venue;
use crate::domain::candle::{Candle, Interval};
use crate::domain::ports::CandlePageFetcher;

pub struct BinanceCandleFetcher {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    symbol_override: Option<String>,
}

impl BinanceCandleFetcher {
    pub fn new(base_url: String, api_key: Option<String>, symbol_override: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, base_url, api_key, symbol_override }
    }
}

#[async_trait]
impl CandlePageFetcher for BinanceCandleFetcher {
    async fn fetch_page(&self, coin: &str, interval: Interval, since_ms: i64, limit: u32) -> Result<Vec<Candle>> {
        let symbol = venue_symbol(coin, Venue::Binance, self.symbol_override.as_deref())
            .context("failed to resolve binance symbol")?;
        let url = format!("{}/api/v3/klines", self.base_url);

        let mut request = self.client.get(&url).query(&[
            ("symbol", symbol.as_str()),
            ("interval", interval.as_str()),
            ("startTime", &since_ms.to_string()),
            ("limit", &limit.to_string()),
        ]);
        if let Some(key) = &self.api_key {
            request = request.header("X-MBX-APIKEY", key);
        }

        let response = request.send().await.context("failed to fetch klines from binance")?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("binance klines fetch failed: {body}");
        }

        let klines: Vec<serde_json::Value> = response.json().await.context("failed to parse binance klines response")?;

        let candles = klines
            .into_iter()
            .filter_map(|k| {
                let arr = k.as_array()?;
                if arr.len() < 9 {
                    return None;
                }
                let t = arr[0].as_i64()?;
                let o = arr[1].as_str()?.parse::<f64>().ok()?;
                let h = arr[2].as_str()?.parse::<f64>().ok()?;
                let l = arr[3].as_str()?.parse::<f64>().ok()?;
                let c = arr[4].as_str()?.parse::<f64>().ok()?;
                let v = arr[5].as_str()?.parse::<f64>().ok()?;
                let n = arr[8].as_i64()?;
                Some(Candle { t, o, h, l, c, v, n })
            })
            .filter(|c| c.is_valid())
            .collect();

        Ok(candles)
    }
}
