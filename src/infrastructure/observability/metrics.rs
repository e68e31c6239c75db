use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{CounterVec, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};

/// Prometheus metric set for one running `perpd` process, grounded on the
/// teacher's `infrastructure::observability::metrics::Metrics` (same
/// registration/render shape, adapted from a portfolio to a coin book).
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    pub equity_usd: Gauge,
    pub daily_pnl_usd: Gauge,
    pub open_positions_count: Gauge,
    pub position_value_usd: GaugeVec,
    pub orders_total: CounterVec,
    pub signals_rejected_total: CounterVec,
    pub stream_reconnects_total: CounterVec,
    pub order_latency_seconds: HistogramVec,
    pub uptime_seconds: Gauge,
    pub win_rate_current: Gauge,
    pub drawdown_current: Gauge,
    pub trades_today_total: CounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let equity_usd = Gauge::new("perpd_equity_usd", "Current account equity in USD")
            .context("failed to create equity_usd gauge")?;
        let daily_pnl_usd = Gauge::new("perpd_daily_pnl_usd", "Realized PnL since the current UTC day began")
            .context("failed to create daily_pnl_usd gauge")?;
        let open_positions_count = Gauge::new("perpd_open_positions_count", "Number of coins with an open position")
            .context("failed to create open_positions_count gauge")?;
        let position_value_usd = GaugeVec::new(
            Opts::new("perpd_position_value_usd", "Notional value of the open position, by coin"),
            &["coin"],
        )
        .context("failed to create position_value_usd gauge vec")?;
        let orders_total = CounterVec::new(
            Opts::new("perpd_orders_total", "Orders placed, by coin/tag/status"),
            &["coin", "tag", "status"],
        )
        .context("failed to create orders_total counter vec")?;
        let signals_rejected_total = CounterVec::new(
            Opts::new("perpd_signals_rejected_total", "Signals rejected by the guardrail gate, by reason"),
            &["reason"],
        )
        .context("failed to create signals_rejected_total counter vec")?;
        let stream_reconnects_total = CounterVec::new(
            Opts::new("perpd_stream_reconnects_total", "Candle/order stream reconnect attempts, by coin"),
            &["coin"],
        )
        .context("failed to create stream_reconnects_total counter vec")?;
        let order_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new("perpd_order_latency_seconds", "Exchange order round-trip latency"),
            &["venue"],
        )
        .context("failed to create order_latency_seconds histogram vec")?;
        let uptime_seconds = Gauge::new("perpd_uptime_seconds", "Seconds since process start")
            .context("failed to create uptime_seconds gauge")?;
        let win_rate_current = Gauge::new("perpd_win_rate_current", "Rolling win rate over completed trades")
            .context("failed to create win_rate_current gauge")?;
        let drawdown_current = Gauge::new("perpd_drawdown_current_pct", "Current drawdown from the equity high-water mark")
            .context("failed to create drawdown_current gauge")?;
        let trades_today_total = CounterVec::new(
            Opts::new("perpd_trades_today_total", "Trades admitted today, by coin"),
            &["coin"],
        )
        .context("failed to create trades_today_total counter vec")?;

        registry.register(Box::new(equity_usd.clone())).context("failed to register equity_usd")?;
        registry.register(Box::new(daily_pnl_usd.clone())).context("failed to register daily_pnl_usd")?;
        registry.register(Box::new(open_positions_count.clone())).context("failed to register open_positions_count")?;
        registry.register(Box::new(position_value_usd.clone())).context("failed to register position_value_usd")?;
        registry.register(Box::new(orders_total.clone())).context("failed to register orders_total")?;
        registry.register(Box::new(signals_rejected_total.clone())).context("failed to register signals_rejected_total")?;
        registry.register(Box::new(stream_reconnects_total.clone())).context("failed to register stream_reconnects_total")?;
        registry.register(Box::new(order_latency_seconds.clone())).context("failed to register order_latency_seconds")?;
        registry.register(Box::new(uptime_seconds.clone())).context("failed to register uptime_seconds")?;
        registry.register(Box::new(win_rate_current.clone())).context("failed to register win_rate_current")?;
        registry.register(Box::new(drawdown_current.clone())).context("failed to register drawdown_current")?;
        registry.register(Box::new(trades_today_total.clone())).context("failed to register trades_today_total")?;

        Ok(Self {
            registry,
            equity_usd,
            daily_pnl_usd,
            open_positions_count,
            position_value_usd,
            orders_total,
            signals_rejected_total,
            stream_reconnects_total,
            order_latency_seconds,
            uptime_seconds,
            win_rate_current,
            drawdown_current,
            trades_today_total,
        })
    }

    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder.encode_to_string(&families).context("failed to encode metrics")
    }

    pub fn set_position_value(&self, coin: &str, notional_usd: f64) {
        self.position_value_usd.with_label_values(&[coin]).set(notional_usd);
    }

    pub fn inc_order(&self, coin: &str, tag: &str, status: &str) {
        self.orders_total.with_label_values(&[coin, tag, status]).inc();
    }

    pub fn inc_signal_rejected(&self, reason: &str) {
        self.signals_rejected_total.with_label_values(&[reason]).inc();
    }

    pub fn inc_stream_reconnect(&self, coin: &str) {
        self.stream_reconnects_total.with_label_values(&[coin]).inc();
    }

    pub fn observe_order_latency(&self, venue: &str, seconds: f64) {
        self.order_latency_seconds.with_label_values(&[venue]).observe(seconds);
    }

    pub fn inc_trade_today(&self, coin: &str) {
        self.trades_today_total.with_label_values(&[coin]).inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("failed to construct default Metrics registry")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_metric_names() {
        let metrics = Metrics::new().unwrap();
        metrics.equity_usd.set(10_000.0);
        metrics.inc_order("BTC", "entry", "filled");
        let rendered = metrics.render().unwrap();
        assert!(rendered.contains("perpd_equity_usd"));
        assert!(rendered.contains("perpd_orders_total"));
    }

    #[test]
    fn position_value_is_labeled_by_coin() {
        let metrics = Metrics::new().unwrap();
        metrics.set_position_value("ETH", 2500.0);
        let rendered = metrics.render().unwrap();
        assert!(rendered.contains("coin=\"ETH\""));
    }
}
