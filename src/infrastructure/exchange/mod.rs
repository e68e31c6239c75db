//! Exchange adapters (spec.md §4.1, §4.13-§4.15). `binance` supplies
//! historical candles only (spec.md §2 candle source); `hyperliquid` is the
//! trading venue, implementing order placement, fills, and live ticks.

mod binance;
mod hyperliquid;

pub use binance::BinanceCandleFetcher;
pub use hyperliquid::{HyperliquidAdapter, HyperliquidOrderEvents, HyperliquidTickSource};
