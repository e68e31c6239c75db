//! `perpd` process entry point: wires every component of spec.md §2 together
//! and serves the control API until interrupted.
//!
//! Follows the teacher's boot sequence (`dotenvy` then `tracing_subscriber`
//! then `Config::from_env`, fail fast on any of the three) and its
//! `tokio::main` + background-task-per-concern shape.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use perpd::api::auth::{RateLimitConfig, RateLimitLayer};
use perpd::api::state::AppState;
use perpd::candles::cache::CandleCache;
use perpd::candles::client::FetchOptions;
use perpd::candles::streamer::CandleStreamer;
use perpd::config::{Config, Venue};
use perpd::domain::candle::{CandleKey, Interval};
use perpd::domain::ports::{Dedup, ExchangeAdapter, OrderEventSource};
use perpd::events::EventLog;
use perpd::infrastructure::dedup::InProcessDedup;
use perpd::infrastructure::exchange::{BinanceCandleFetcher, HyperliquidAdapter, HyperliquidOrderEvents, HyperliquidTickSource};
use perpd::infrastructure::notifications::{LogNotificationSink, WebhookNotificationSink};
use perpd::infrastructure::observability::{Metrics, MetricsReporter};
use perpd::infrastructure::persistence::{Database, SqliteCandleRepository, SqliteFillRepository, SqliteOrderRepository, SqliteSignalRepository};
use perpd::live::event_stream::EventReconciler;
use perpd::live::position_book::PositionBook;
use perpd::live::signal_handler::SignalHandler;
use perpd::live::CoinRunner;
use perpd::strategy::donchian_adx::{DonchianAdxParams, DonchianAdxStrategy};
use perpd::strategy::Strategy;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "perpd=info,tower_http=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn build_strategy() -> Box<dyn Strategy> {
    Box::new(DonchianAdxStrategy::new(DonchianAdxParams::default()))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let config = Arc::new(Config::from_env().context("loading configuration")?);
    info!(coins = ?config.coins, source = ?config.candle_source.source, "perpd: booting");

    let database = Database::new(&config.db_url).await.context("opening database")?;
    let candle_repo: Arc<dyn perpd::domain::repositories::CandleRepository> = Arc::new(SqliteCandleRepository::new(database.pool.clone()));
    let order_repo: Arc<dyn perpd::domain::repositories::OrderRepository> = Arc::new(SqliteOrderRepository::new(database.pool.clone()));
    let fill_repo: Arc<dyn perpd::domain::repositories::FillRepository> = Arc::new(SqliteFillRepository::new(database.pool.clone()));
    let signal_repo: Arc<dyn perpd::domain::repositories::SignalRepository> = Arc::new(SqliteSignalRepository::new(database.pool.clone()));

    let candle_cache = Arc::new(CandleCache::new(candle_repo));
    let candle_source_label = match config.candle_source.source {
        Venue::Binance => "binance",
        Venue::Hyperliquid => "hyperliquid",
    }
    .to_string();

    let candle_fetcher: Arc<dyn perpd::domain::ports::CandlePageFetcher> = match config.candle_source.source {
        Venue::Binance => Arc::new(BinanceCandleFetcher::new(
            config.binance_base_url.clone(),
            Some(config.binance_api_key.clone()).filter(|s| !s.is_empty()),
            config.candle_source.symbol_override.clone(),
        )),
        Venue::Hyperliquid => Arc::new(HyperliquidAdapter::new(
            config.hyperliquid_base_url.clone(),
            config.hyperliquid_api_key.clone(),
            config.hyperliquid_api_secret.clone(),
            config.candle_source.symbol_override.clone(),
        )),
    };
    let tick_source: Arc<dyn perpd::candles::streamer::LiveTickSource> = Arc::new(HyperliquidTickSource::new(config.hyperliquid_ws_url.clone()));

    let exchange: Arc<dyn ExchangeAdapter> = Arc::new(HyperliquidAdapter::new(
        config.hyperliquid_base_url.clone(),
        config.hyperliquid_api_key.clone(),
        config.hyperliquid_api_secret.clone(),
        config.candle_source.symbol_override.clone(),
    ));

    let dedup: Arc<dyn Dedup> = Arc::new(InProcessDedup::new());
    if dedup.is_degraded() {
        warn!("perpd: running with in-process (degraded) dedup; set an external KV to remove this flag");
    }

    let notifications: Arc<dyn perpd::domain::ports::NotificationSink> = match std::env::var("NOTIFICATION_WEBHOOK_URL") {
        Ok(url) if !url.is_empty() => Arc::new(WebhookNotificationSink::new(url)),
        _ => Arc::new(LogNotificationSink),
    };

    let events = Arc::new(EventLog::new());
    let metrics = Metrics::new().context("constructing metrics registry")?;

    let primary_interval = config.primary_interval.parse::<Interval>().context("parsing PRIMARY_INTERVAL")?;
    let fetch_opts = FetchOptions {
        candles_per_request: config.candle_source.candles_per_request,
        request_delay_ms: config.candle_source.request_delay_ms,
    };

    let mut runners = HashMap::new();
    let mut streamers = Vec::new();

    for coin in &config.coins {
        let key = CandleKey::new(coin.clone(), primary_interval, candle_source_label.clone());
        let streamer = Arc::new(CandleStreamer::new(key, candle_cache.clone(), candle_fetcher.clone(), tick_source.clone(), fetch_opts.clone()));
        streamer.warmup(500).await.with_context(|| format!("warming up {coin} candle cache"))?;
        streamer.start();

        let signal_handler = SignalHandler::new(exchange.clone(), order_repo.clone(), notifications.clone());
        let reconciler = EventReconciler::new(order_repo.clone(), fill_repo.clone(), notifications.clone());

        let runner = Arc::new(CoinRunner::new(
            coin.clone(),
            build_strategy(),
            signal_handler,
            reconciler,
            exchange.clone(),
            dedup.clone(),
            signal_repo.clone(),
            config.risk.clone(),
            config.risk.max_leverage,
            config.margin_mode,
            8,
            events.clone(),
        ));

        runners.insert(coin.clone(), runner.clone());
        streamers.push((coin.clone(), streamer, runner));
    }
    let runners = Arc::new(runners);

    for (coin, streamer, runner) in streamers {
        let mut rx = streamer.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(perpd::candles::streamer::StreamEvent::Close(_)) => {
                        let primary = streamer.get_candles().await;
                        let higher = HashMap::new();
                        runner.on_bar_close(&primary, &higher).await;
                    }
                    Ok(perpd::candles::streamer::StreamEvent::Tick(_)) => {}
                    Ok(perpd::candles::streamer::StreamEvent::Stale { silent_ms, .. }) => {
                        warn!(coin = %coin, silent_ms, "perpd: streamer reported stale data");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(coin = %coin, skipped, "perpd: bar-close listener lagged, dropping buffered events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    spawn_order_event_dispatch(runners.clone(), exchange.clone(), config.clone());

    if config.observability_enabled {
        let position_book = Arc::new(Mutex::new(PositionBook::new()));
        let reporter = MetricsReporter::new(position_book.clone(), metrics.clone(), config.observability_interval_secs, 0.0);
        tokio::spawn(reporter.run());
        spawn_position_book_mirror(runners.clone(), position_book, config.observability_interval_secs);
    }
    let metrics = Arc::new(metrics);

    let rate_limiter = RateLimitLayer::new(RateLimitConfig {
        max_requests: config.control_api_rate_limit_per_min,
        window: Duration::from_secs(60),
        burst: 2,
    });
    {
        let rate_limiter = rate_limiter.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(120));
            loop {
                ticker.tick().await;
                rate_limiter.cleanup();
            }
        });
    }

    let state = AppState {
        config: config.clone(),
        runners,
        candle_cache,
        candle_source_label,
        order_repo,
        signal_repo,
        exchange,
        dedup,
        events,
        metrics,
        rate_limiter,
        started_at: Instant::now(),
    };

    perpd::api::serve(state, &config.control_api_bind).await
}

/// Polls the account-wide order-event feed and dispatches each event to the
/// matching coin's runner via a one-shot [`OrderEventSource`] adapter, since
/// `CoinRunner::on_order_event` is written to own and drain its source
/// (spec.md §4.15) but Hyperliquid's user-events feed is not per-coin.
fn spawn_order_event_dispatch(runners: Arc<HashMap<String, Arc<CoinRunner>>>, _exchange: Arc<dyn ExchangeAdapter>, config: Arc<Config>) {
    let mut source = HyperliquidOrderEvents::new(config.hyperliquid_base_url.clone(), config.hyperliquid_api_key.clone(), Duration::from_secs(2));
    tokio::spawn(async move {
        loop {
            match source.next_event().await {
                Ok(Some(event)) => {
                    let Some(runner) = runners.get(&event.coin) else {
                        warn!(coin = %event.coin, "perpd: order event for unmonitored coin");
                        continue;
                    };
                    let mut adapter = OneShotEventSource(Some(event));
                    runner.on_order_event(&mut adapter).await;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "perpd: order event feed failed, retrying");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    });
}

/// `MetricsReporter` was grounded on the teacher's single shared portfolio
/// book; each `CoinRunner` here owns its position state privately instead, so
/// this task rebuilds a shared book from `CoinRunner::position()` on the same
/// cadence the reporter reads it, rather than reshaping either side to share
/// one lock.
fn spawn_position_book_mirror(runners: Arc<HashMap<String, Arc<CoinRunner>>>, book: Arc<Mutex<PositionBook>>, interval_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            ticker.tick().await;
            let mut fresh = PositionBook::new();
            for runner in runners.values() {
                if let Some(position) = runner.position().await {
                    fresh.open(position);
                }
            }
            *book.lock().await = fresh;
        }
    });
}

struct OneShotEventSource(Option<perpd::domain::ports::OrderUpdateEvent>);

#[async_trait::async_trait]
impl OrderEventSource for OneShotEventSource {
    async fn next_event(&mut self) -> Result<Option<perpd::domain::ports::OrderUpdateEvent>> {
        Ok(self.0.take())
    }
}
