pub mod api;
pub mod backtest;
pub mod candles;
pub mod config;
pub mod domain;
pub mod events;
pub mod indicators;
pub mod infrastructure;
pub mod live;
pub mod optimization;
pub mod risk;
pub mod scoring;
pub mod strategy;
