//! Hyperliquid trading adapter: order placement, order-event stream, and a
//! live tick source. No teacher file covers this venue directly — the HMAC
//! request-signing idiom is carried over from the teacher's
//! `BinanceExecutionService::sign_request` (HMAC-SHA256 over the canonical
//! request body, hex-encoded), generalized from a query string to a JSON
//! payload since Hyperliquid's REST surface is JSON-bodied rather than
//! query-string-bodied.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::candles::symbols::venue_symbol;
use crate::candles::streamer::LiveTickSource;
use crate::config::Venue;
use crate::domain::candle::{Candle, CandleKey, Interval};
use crate::domain::ports::{CandlePageFetcher, ExchangeAdapter, FillReport, OrderEventSource, OrderUpdateEvent};
use crate::domain::trading::{Direction, OrderStatus, OrderTag};

type HmacSha256 = Hmac<Sha256>;

pub struct HyperliquidAdapter {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    symbol_override: Option<String>,
    next_order_id: AtomicU64,
}

impl HyperliquidAdapter {
    pub fn new(base_url: String, api_key: String, api_secret: String, symbol_override: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, base_url, api_key, api_secret, symbol_override, next_order_id: AtomicU64::new(1) }
    }

    fn sign(&self, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes()).expect("HMAC accepts a key of any size");
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn symbol(&self, coin: &str) -> Result<String> {
        venue_symbol(coin, Venue::Hyperliquid, self.symbol_override.as_deref()).context("failed to resolve hyperliquid symbol")
    }

    async fn post_signed<B: Serialize, R: for<'de> Deserialize<'de>>(&self, path: &str, body: &B) -> Result<R> {
        let payload = serde_json::to_string(body).context("failed to serialize hyperliquid request body")?;
        let signature = self.sign(&payload);
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(&url)
            .header("HL-API-KEY", &self.api_key)
            .header("HL-SIGNATURE", signature)
            .header("content-type", "application/json")
            .body(payload)
            .send()
            .await
            .with_context(|| format!("failed to call hyperliquid endpoint {path}"))?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("hyperliquid request to {path} failed: {text}");
        }

        response.json::<R>().await.with_context(|| format!("failed to parse hyperliquid response from {path}"))
    }
}

#[derive(Serialize)]
struct SetLeverageRequest<'a> {
    coin: &'a str,
    leverage: f64,
    is_cross: bool,
}

#[derive(Serialize)]
struct PlaceOrderRequest<'a> {
    coin: &'a str,
    is_buy: bool,
    size: f64,
    limit_price: Option<f64>,
    trigger_price: Option<f64>,
    reduce_only: bool,
    order_type: &'a str,
    client_order_id: String,
}

#[derive(Deserialize)]
struct PlaceOrderResponse {
    order_id: String,
    filled_size: f64,
    avg_price: f64,
}

#[derive(Deserialize)]
struct CancelOrderResponse {
    #[allow(dead_code)]
    ok: bool,
}

#[derive(Deserialize)]
struct OpenOrdersResponse {
    order_ids: Vec<String>,
}

fn direction_is_buy(direction: Direction) -> bool {
    matches!(direction, Direction::Long)
}

#[derive(Serialize)]
struct CandleSnapshotRequest<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    req: CandleSnapshotReq<'a>,
}

#[derive(Serialize)]
struct CandleSnapshotReq<'a> {
    coin: &'a str,
    interval: &'a str,
    #[serde(rename = "startTime")]
    start_time: i64,
    #[serde(rename = "endTime")]
    end_time: i64,
}

#[derive(Deserialize)]
struct CandleSnapshotEntry {
    #[serde(rename = "t")]
    t: i64,
    #[serde(rename = "o")]
    o: String,
    #[serde(rename = "h")]
    h: String,
    #[serde(rename = "l")]
    l: String,
    #[serde(rename = "c")]
    c: String,
    #[serde(rename = "v")]
    v: String,
    #[serde(rename = "n")]
    n: i64,
}

/// Hyperliquid's `/info` candle snapshot is a public, unsigned endpoint,
/// unlike every other request this adapter makes — no `sign`/`post_signed`
/// involved.
#[async_trait]
impl CandlePageFetcher for HyperliquidAdapter {
    async fn fetch_page(&self, coin: &str, interval: Interval, since_ms: i64, limit: u32) -> Result<Vec<Candle>> {
        let symbol = self.symbol(coin)?;
        let step_ms = interval.millis().unwrap_or(60_000);
        let end_time = since_ms + step_ms * i64::from(limit);
        let url = format!("{}/info", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&CandleSnapshotRequest {
                kind: "candleSnapshot",
                req: CandleSnapshotReq { coin: &symbol, interval: interval.as_str(), start_time: since_ms, end_time },
            })
            .send()
            .await
            .context("failed to fetch candle snapshot from hyperliquid")?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("hyperliquid candle snapshot fetch failed: {body}");
        }

        let entries: Vec<CandleSnapshotEntry> =
            response.json().await.context("failed to parse hyperliquid candle snapshot response")?;

        let candles = entries
            .into_iter()
            .filter_map(|e| {
                Some(Candle {
                    t: e.t,
                    o: e.o.parse::<f64>().ok()?,
                    h: e.h.parse::<f64>().ok()?,
                    l: e.l.parse::<f64>().ok()?,
                    c: e.c.parse::<f64>().ok()?,
                    v: e.v.parse::<f64>().ok()?,
                    n: e.n,
                })
            })
            .filter(|c| c.is_valid())
            .take(limit as usize)
            .collect();

        Ok(candles)
    }
}

#[async_trait]
impl ExchangeAdapter for HyperliquidAdapter {
    async fn set_leverage(&self, coin: &str, leverage: f64, isolated: bool) -> Result<()> {
        let symbol = self.symbol(coin)?;
        let _: serde_json::Value = self
            .post_signed("/exchange/leverage", &SetLeverageRequest { coin: &symbol, leverage, is_cross: !isolated })
            .await?;
        Ok(())
    }

    async fn place_market_order(&self, coin: &str, direction: Direction, size: f64, reduce_only: bool, tag: OrderTag) -> Result<FillReport> {
        let symbol = self.symbol(coin)?;
        let client_order_id = format!("{coin}-{tag}-{}", self.next_order_id.fetch_add(1, Ordering::SeqCst));
        let response: PlaceOrderResponse = self
            .post_signed(
                "/exchange/order",
                &PlaceOrderRequest {
                    coin: &symbol,
                    is_buy: direction_is_buy(direction),
                    size,
                    limit_price: None,
                    trigger_price: None,
                    reduce_only,
                    order_type: "market",
                    client_order_id,
                },
            )
            .await?;
        Ok(FillReport { hl_order_id: response.order_id, filled_size: response.filled_size, avg_price: response.avg_price })
    }

    async fn place_limit_order(&self, coin: &str, direction: Direction, size: f64, price: f64, reduce_only: bool, tag: OrderTag) -> Result<FillReport> {
        let symbol = self.symbol(coin)?;
        let client_order_id = format!("{coin}-{tag}-{}", self.next_order_id.fetch_add(1, Ordering::SeqCst));
        let response: PlaceOrderResponse = self
            .post_signed(
                "/exchange/order",
                &PlaceOrderRequest {
                    coin: &symbol,
                    is_buy: direction_is_buy(direction),
                    size,
                    limit_price: Some(price),
                    trigger_price: None,
                    reduce_only,
                    order_type: "limit",
                    client_order_id,
                },
            )
            .await?;
        Ok(FillReport { hl_order_id: response.order_id, filled_size: response.filled_size, avg_price: response.avg_price })
    }

    async fn place_stop_order(&self, coin: &str, direction: Direction, size: f64, trigger_price: f64, tag: OrderTag) -> Result<FillReport> {
        let symbol = self.symbol(coin)?;
        let client_order_id = format!("{coin}-{tag}-{}", self.next_order_id.fetch_add(1, Ordering::SeqCst));
        let response: PlaceOrderResponse = self
            .post_signed(
                "/exchange/order",
                &PlaceOrderRequest {
                    coin: &symbol,
                    is_buy: direction_is_buy(direction),
                    size,
                    limit_price: None,
                    trigger_price: Some(trigger_price),
                    reduce_only: true,
                    order_type: "stop_market",
                    client_order_id,
                },
            )
            .await?;
        Ok(FillReport { hl_order_id: response.order_id, filled_size: response.filled_size, avg_price: response.avg_price })
    }

    async fn cancel_order(&self, hl_order_id: &str) -> Result<()> {
        #[derive(Serialize)]
        struct CancelRequest<'a> {
            order_id: &'a str,
        }
        let _: CancelOrderResponse = self.post_signed("/exchange/cancel", &CancelRequest { order_id: hl_order_id }).await?;
        Ok(())
    }

    async fn open_order_ids(&self, coin: &str) -> Result<Vec<String>> {
        let symbol = self.symbol(coin)?;
        #[derive(Serialize)]
        struct OpenOrdersRequest<'a> {
            coin: &'a str,
        }
        let response: OpenOrdersResponse = self.post_signed("/info/open_orders", &OpenOrdersRequest { coin: &symbol }).await?;
        Ok(response.order_ids)
    }
}

#[derive(Deserialize)]
struct RawOrderUpdate {
    hl_order_id: String,
    fill_id: String,
    coin: String,
    status: String,
    fill_price: f64,
    fill_size: f64,
    fee: f64,
}

fn parse_status(s: &str) -> OrderStatus {
    match s {
        "filled" => OrderStatus::Filled,
        "cancelled" => OrderStatus::Cancelled,
        "rejected" => OrderStatus::Rejected,
        _ => OrderStatus::Pending,
    }
}

/// Polls Hyperliquid's user-events endpoint for order/fill updates. A real
/// deployment would subscribe over the venue's websocket the way
/// `HyperliquidTickSource` does for candles; polling keeps this adapter's
/// transport concerns small and symmetric with `place_*`'s plain REST calls.
pub struct HyperliquidOrderEvents {
    client: Client,
    base_url: String,
    api_key: String,
    poll_interval: std::time::Duration,
    cursor: Mutex<Option<String>>,
}

impl HyperliquidOrderEvents {
    pub fn new(base_url: String, api_key: String, poll_interval: std::time::Duration) -> Self {
        Self { client: Client::new(), base_url, api_key, poll_interval, cursor: Mutex::new(None) }
    }
}

#[derive(Deserialize)]
struct UserEventsResponse {
    events: Vec<RawOrderUpdate>,
    next_cursor: Option<String>,
}

#[async_trait]
impl OrderEventSource for HyperliquidOrderEvents {
    async fn next_event(&mut self) -> Result<Option<OrderUpdateEvent>> {
        loop {
            let cursor = self.cursor.lock().await.clone();
            let url = format!("{}/info/user_events", self.base_url);
            let mut request = self.client.get(&url).header("HL-API-KEY", &self.api_key);
            if let Some(c) = &cursor {
                request = request.query(&[("cursor", c.as_str())]);
            }
            let response = request.send().await.context("failed to poll hyperliquid user events")?;
            if !response.status().is_success() {
                let text = response.text().await.unwrap_or_default();
                anyhow::bail!("hyperliquid user events poll failed: {text}");
            }
            let parsed: UserEventsResponse = response.json().await.context("failed to parse hyperliquid user events response")?;
            *self.cursor.lock().await = parsed.next_cursor;

            if let Some(raw) = parsed.events.into_iter().next() {
                return Ok(Some(OrderUpdateEvent {
                    hl_order_id: raw.hl_order_id,
                    fill_id: raw.fill_id,
                    coin: raw.coin,
                    status: parse_status(&raw.status),
                    fill_price: raw.fill_price,
                    fill_size: raw.fill_size,
                    fee: raw.fee,
                }));
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Live tick source backed by Hyperliquid's candle websocket, matching the
/// `LiveTickSource::connect` port consumed by `CandleStreamer` (spec.md §4.2).
pub struct HyperliquidTickSource {
    ws_url: String,
}

impl HyperliquidTickSource {
    pub fn new(ws_url: String) -> Self {
        Self { ws_url }
    }
}

#[derive(Serialize)]
struct SubscribeMessage<'a> {
    method: &'a str,
    subscription: SubscriptionSpec<'a>,
}

#[derive(Serialize)]
struct SubscriptionSpec<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    coin: &'a str,
    interval: &'a str,
}

#[derive(Deserialize)]
struct WsCandleMessage {
    data: WsCandleData,
}

#[derive(Deserialize)]
struct WsCandleData {
    t: i64,
    o: String,
    h: String,
    l: String,
    c: String,
    v: String,
    n: i64,
}

#[async_trait]
impl LiveTickSource for HyperliquidTickSource {
    async fn connect(&self, key: &CandleKey) -> Result<mpsc::Receiver<Candle>> {
        use futures_util::{SinkExt, StreamExt};
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::Message;

        let (ws_stream, _) = connect_async(&self.ws_url).await.context("failed to connect to hyperliquid candle websocket")?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe = SubscribeMessage {
            method: "subscribe",
            subscription: SubscriptionSpec { kind: "candle", coin: &key.coin, interval: key.interval.as_str() },
        };
        let payload = serde_json::to_string(&subscribe).context("failed to serialize hyperliquid subscribe message")?;
        write.send(Message::Text(payload)).await.context("failed to send hyperliquid subscribe message")?;

        let (tx, rx) = mpsc::channel(256);
        let coin = key.coin.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let msg = match msg {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(coin = %coin, error = %e, "hyperliquid tick source: websocket error");
                        break;
                    }
                };
                let Message::Text(text) = msg else { continue };
                let parsed: Result<WsCandleMessage, _> = serde_json::from_str(&text);
                let Ok(parsed) = parsed else { continue };
                let candle = Candle {
                    t: parsed.data.t,
                    o: parsed.data.o.parse().unwrap_or(f64::NAN),
                    h: parsed.data.h.parse().unwrap_or(f64::NAN),
                    l: parsed.data.l.parse().unwrap_or(f64::NAN),
                    c: parsed.data.c.parse().unwrap_or(f64::NAN),
                    v: parsed.data.v.parse().unwrap_or(0.0),
                    n: parsed.data.n,
                };
                if tx.send(candle).await.is_err() {
                    break;
                }
            }
            info!(coin = %coin, "hyperliquid tick source: websocket stream ended");
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_is_deterministic_for_the_same_body_and_key() {
        let adapter = HyperliquidAdapter::new("https://api.hyperliquid.test".into(), "key".into(), "secret".into(), None);
        let a = adapter.sign("{\"coin\":\"BTC\"}");
        let b = adapter.sign("{\"coin\":\"BTC\"}");
        assert_eq!(a, b);
        assert_ne!(a, adapter.sign("{\"coin\":\"ETH\"}"));
    }

    #[test]
    fn symbol_resolution_uses_bare_coin_for_hyperliquid() {
        let adapter = HyperliquidAdapter::new("https://api.hyperliquid.test".into(), "key".into(), "secret".into(), None);
        assert_eq!(adapter.symbol("btc").unwrap(), "BTC");
    }
}
