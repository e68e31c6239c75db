//! Concrete adapters for the domain's port traits (spec.md §6, §9).
//!
//! `persistence` backs the repository traits with sqlx/SQLite; `memory`
//! backs them in-process for tests and single-session runs; `observability`
//! renders the push-based metrics snapshot; `exchange` adapts Binance and
//! Hyperliquid; `dedup` and `notifications` fill the remaining narrow
//! capability interfaces of `domain::ports`.

pub mod dedup;
pub mod exchange;
pub mod memory;
pub mod notifications;
pub mod observability;
pub mod persistence;
