pub mod cache;
pub mod client;
pub mod streamer;
pub mod symbols;

pub use cache::CandleCache;
pub use client::fetch_candles;
pub use streamer::{CandleStreamer, LiveTickSource, StreamEvent};
