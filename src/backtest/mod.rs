//! Bar-by-bar backtest engine, metrics, and trade-analysis reporting
//! (spec.md §4.6, C6).

pub mod engine;
pub mod metrics;
pub mod trade_analysis;

pub use engine::{run_backtest, BacktestConfig, CompletedTrade, ExitReason};
pub use metrics::{compute_metrics, Metrics};
pub use trade_analysis::{analyze_trades, TradeAnalysis};
