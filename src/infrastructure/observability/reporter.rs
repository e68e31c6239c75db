use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::infrastructure::observability::Metrics;
use crate::live::position_book::PositionBook;

#[derive(Debug, Serialize)]
pub struct PositionSnapshot {
    pub coin: String,
    pub direction: String,
    pub entry_price: f64,
    pub size: f64,
    pub stop_loss: f64,
}

#[derive(Debug, Serialize)]
pub struct SystemSnapshot {
    pub uptime_seconds: u64,
}

/// Mirrors the teacher's `reporter::MetricsSnapshot` shape, substituting a
/// coin position book for a single-portfolio view.
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub uptime_seconds: u64,
    pub version: String,
    pub equity_usd: f64,
    pub daily_pnl_usd: f64,
    pub positions: Vec<PositionSnapshot>,
    pub system: SystemSnapshot,
}

/// Periodically renders and logs a metrics snapshot; no inbound scrape
/// endpoint is exposed (spec.md §7), mirroring the teacher's push-only
/// `MetricsReporter::run`.
pub struct MetricsReporter {
    book: std::sync::Arc<tokio::sync::Mutex<PositionBook>>,
    metrics: Metrics,
    start_time: Instant,
    interval: Duration,
    starting_equity: f64,
}

impl MetricsReporter {
    pub fn new(
        book: std::sync::Arc<tokio::sync::Mutex<PositionBook>>,
        metrics: Metrics,
        interval_seconds: u64,
        starting_equity: f64,
    ) -> Self {
        Self {
            book,
            metrics,
            start_time: Instant::now(),
            interval: Duration::from_secs(interval_seconds.max(1)),
            starting_equity,
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            match self.collect_snapshot().await {
                Ok(snapshot) => match serde_json::to_string(&snapshot) {
                    Ok(json) => {
                        println!("METRICS_JSON:{json}");
                        info!(
                            equity_usd = snapshot.equity_usd,
                            daily_pnl_usd = snapshot.daily_pnl_usd,
                            positions = snapshot.positions.len(),
                            "observability: metrics snapshot emitted"
                        );
                    }
                    Err(e) => warn!(error = %e, "observability: failed to serialize metrics snapshot"),
                },
                Err(e) => warn!(error = %e, "observability: failed to collect metrics snapshot"),
            }
        }
    }

    async fn collect_snapshot(&self) -> anyhow::Result<MetricsSnapshot> {
        let book = self.book.lock().await;
        let positions: Vec<PositionSnapshot> = book
            .get_all()
            .iter()
            .map(|p| PositionSnapshot {
                coin: p.coin.clone(),
                direction: p.direction.to_string(),
                entry_price: p.entry_price,
                size: p.size,
                stop_loss: p.effective_stop(),
            })
            .collect();

        self.metrics.open_positions_count.set(positions.len() as f64);
        for p in &positions {
            self.metrics.set_position_value(&p.coin, p.entry_price * p.size);
        }
        self.metrics.uptime_seconds.set(self.start_time.elapsed().as_secs() as f64);

        Ok(MetricsSnapshot {
            timestamp: chrono::Utc::now(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            equity_usd: self.starting_equity,
            daily_pnl_usd: self.metrics.daily_pnl_usd.get(),
            positions,
            system: SystemSnapshot { uptime_seconds: self.start_time.elapsed().as_secs() },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collect_snapshot_reflects_open_positions() {
        let mut book = PositionBook::new();
        book.open(crate::domain::trading::Position {
            coin: "BTC".into(),
            direction: crate::domain::trading::Direction::Long,
            entry_price: 100.0,
            size: 1.0,
            stop_loss: 95.0,
            take_profits: vec![],
            trailing_stop_loss: None,
            opened_at: chrono::Utc::now(),
            signal_id: "s1".into(),
            liquidation_px: None,
        });
        let reporter = MetricsReporter::new(
            std::sync::Arc::new(tokio::sync::Mutex::new(book)),
            Metrics::new().unwrap(),
            60,
            10_000.0,
        );
        let snapshot = reporter.collect_snapshot().await.unwrap();
        assert_eq!(snapshot.positions.len(), 1);
        assert_eq!(snapshot.positions[0].coin, "BTC");
    }
}
