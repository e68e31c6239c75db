//! Standalone backtest entry point (spec.md §4.6-§4.7, C6-C7): runs one
//! strategy over a candle series (a local file or a live fetch through the
//! configured exchange) and prints the aggregate metrics and breakdown
//! report as JSON.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use perpd::backtest::{analyze_trades, compute_metrics, run_backtest, BacktestConfig};
use perpd::candles::client::{fetch_candles, FetchOptions};
use perpd::config::{Config, RiskConfig, Venue};
use perpd::domain::candle::{Candle, Interval};
use perpd::domain::ports::CandlePageFetcher;
use perpd::infrastructure::exchange::{BinanceCandleFetcher, HyperliquidAdapter};
use perpd::strategy::donchian_adx::{DonchianAdxParams, DonchianAdxStrategy};
use perpd::strategy::ema_pullback::{EmaPullbackParams, EmaPullbackStrategy};
use perpd::strategy::keltner_rsi2::{KeltnerRsi2Params, KeltnerRsi2Strategy};
use perpd::strategy::Strategy;

#[derive(Parser, Debug)]
#[command(name = "backtest", about = "Backtests one strategy over a candle series and reports the results")]
struct Args {
    /// Strategy to test: donchian_adx, ema_pullback, or keltner_rsi2.
    #[arg(long)]
    strategy: String,

    /// JSON file holding a `Vec<Candle>` primary-timeframe series. If
    /// omitted, candles are fetched live through the configured exchange
    /// using --coin/--from/--to.
    #[arg(long)]
    candles: Option<PathBuf>,

    /// Coin to fetch when --candles is omitted.
    #[arg(long)]
    coin: Option<String>,

    /// Fetch window start, unix milliseconds.
    #[arg(long)]
    from: Option<i64>,

    /// Fetch window end, unix milliseconds.
    #[arg(long)]
    to: Option<i64>,

    #[arg(long, default_value_t = 10_000.0)]
    starting_equity: f64,

    /// Write the full report (metrics + breakdown + trades) to this path
    /// instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "perpd=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn build_strategy(name: &str) -> Result<Box<dyn Strategy>> {
    match name {
        "donchian_adx" => Ok(Box::new(DonchianAdxStrategy::new(DonchianAdxParams::default()))),
        "ema_pullback" => Ok(Box::new(EmaPullbackStrategy::new(EmaPullbackParams::default()))),
        "keltner_rsi2" => Ok(Box::new(KeltnerRsi2Strategy::new(KeltnerRsi2Params::default()))),
        other => bail!("unknown strategy {other:?}; expected donchian_adx, ema_pullback, or keltner_rsi2"),
    }
}

async fn load_candles(args: &Args, config: &Config) -> Result<Vec<Candle>> {
    if let Some(path) = &args.candles {
        let bytes = tokio::fs::read(path).await.context("reading candle file")?;
        let candles: Vec<Candle> = serde_json::from_slice(&bytes).context("parsing candle file as a JSON array of candles")?;
        return Ok(candles);
    }

    let coin = args.coin.as_deref().context("--coin is required when --candles is omitted")?;
    let from = args.from.context("--from is required when --candles is omitted")?;
    let to = args.to.context("--to is required when --candles is omitted")?;
    let interval: Interval = config.primary_interval.parse().context("parsing PRIMARY_INTERVAL")?;

    let fetcher: Box<dyn CandlePageFetcher> = match config.candle_source.source {
        Venue::Binance => Box::new(BinanceCandleFetcher::new(
            config.binance_base_url.clone(),
            Some(config.binance_api_key.clone()).filter(|s| !s.is_empty()),
            config.candle_source.symbol_override.clone(),
        )),
        Venue::Hyperliquid => Box::new(HyperliquidAdapter::new(
            config.hyperliquid_base_url.clone(),
            config.hyperliquid_api_key.clone(),
            config.hyperliquid_api_secret.clone(),
            config.candle_source.symbol_override.clone(),
        )),
    };

    let opts = FetchOptions {
        candles_per_request: config.candle_source.candles_per_request,
        request_delay_ms: config.candle_source.request_delay_ms,
    };
    fetch_candles(fetcher.as_ref(), coin, interval, from, to, &opts).await
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();
    let config = Config::from_env().context("loading configuration")?;

    let candles = load_candles(&args, &config).await?;
    if candles.is_empty() {
        bail!("no candles to backtest against");
    }
    info!(strategy = %args.strategy, bars = candles.len(), "backtest: starting");

    let risk = RiskConfig::default();
    let backtest_config = BacktestConfig {
        risk_per_trade_usd: risk.risk_per_trade_usd,
        max_trades_per_day: risk.max_trades_per_day,
        max_daily_loss_usd: risk.max_daily_loss_usd,
        cooldown_bars: risk.cooldown_bars,
        starting_equity: args.starting_equity,
    };

    let mut strategy = build_strategy(&args.strategy)?;
    let trades = run_backtest(strategy.as_mut(), &candles, &backtest_config);
    let metrics = compute_metrics(&trades, args.starting_equity);
    let analysis = analyze_trades(&trades, args.starting_equity);

    info!(
        trades = metrics.num_trades,
        pnl = metrics.total_pnl,
        profit_factor = ?metrics.profit_factor,
        max_drawdown_pct = metrics.max_drawdown_pct,
        "backtest: finished"
    );

    let report = serde_json::json!({
        "strategy": args.strategy,
        "bars": candles.len(),
        "metrics": metrics,
        "analysis": analysis,
        "trades": trades,
    });
    let rendered = serde_json::to_vec_pretty(&report)?;

    match &args.out {
        Some(path) => {
            tokio::fs::write(path, &rendered).await.context("writing report file")?;
            info!(path = %path.display(), "backtest: report written");
        }
        None => println!("{}", String::from_utf8_lossy(&rendered)),
    }

    Ok(())
}
