pub mod candle;
pub mod errors;
pub mod optimization;
pub mod ports;
pub mod repositories;
pub mod trading;

pub use candle::{Candle, CandleKey, Interval, SyncMeta};
pub use trading::{
    Direction, Order, OrderStatus, OrderTag, OrderType, Position, Signal, StoredSignal,
    StrategyParam, TakeProfit,
};
