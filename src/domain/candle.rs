//! Candle / bar data model (spec.md §3).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::errors::CandleError;

/// One of the fixed closed set of supported bar intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H8,
    H12,
    D1,
    D3,
    W1,
    /// Calendar month; has no fixed millisecond duration.
    Mo1,
}

impl Interval {
    /// Milliseconds per bar. `None` for `Mo1`, whose length varies by month.
    pub fn millis(self) -> Option<i64> {
        const MINUTE: i64 = 60_000;
        const HOUR: i64 = 60 * MINUTE;
        const DAY: i64 = 24 * HOUR;
        Some(match self {
            Interval::M1 => MINUTE,
            Interval::M3 => 3 * MINUTE,
            Interval::M5 => 5 * MINUTE,
            Interval::M15 => 15 * MINUTE,
            Interval::M30 => 30 * MINUTE,
            Interval::H1 => HOUR,
            Interval::H2 => 2 * HOUR,
            Interval::H4 => 4 * HOUR,
            Interval::H8 => 8 * HOUR,
            Interval::H12 => 12 * HOUR,
            Interval::D1 => DAY,
            Interval::D3 => 3 * DAY,
            Interval::W1 => 7 * DAY,
            Interval::Mo1 => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Interval::M1 => "1m",
            Interval::M3 => "3m",
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::M30 => "30m",
            Interval::H1 => "1h",
            Interval::H2 => "2h",
            Interval::H4 => "4h",
            Interval::H8 => "8h",
            Interval::H12 => "12h",
            Interval::D1 => "1d",
            Interval::D3 => "3d",
            Interval::W1 => "1w",
            Interval::Mo1 => "1M",
        }
    }

    /// True if `self` is strictly coarser than `other` (used for the
    /// higher-timeframe bar-completion rule of spec.md §4.5).
    pub fn is_higher_than(self, other: Interval) -> bool {
        match (self.millis(), other.millis()) {
            (Some(a), Some(b)) => a > b,
            (None, _) => true,
            (_, None) => false,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Interval {
    type Err = CandleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "1m" => Interval::M1,
            "3m" => Interval::M3,
            "5m" => Interval::M5,
            "15m" => Interval::M15,
            "30m" => Interval::M30,
            "1h" => Interval::H1,
            "2h" => Interval::H2,
            "4h" => Interval::H4,
            "8h" => Interval::H8,
            "12h" => Interval::H12,
            "1d" => Interval::D1,
            "3d" => Interval::D3,
            "1w" => Interval::W1,
            "1M" => Interval::Mo1,
            other => {
                return Err(CandleError::UnsupportedInterval {
                    interval: other.to_string(),
                })
            }
        })
    }
}

/// An OHLCV observation covering `[t, t+interval)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub t: i64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
    pub n: i64,
}

impl Candle {
    /// Validates the invariants of spec.md §3:
    /// `h >= max(o,c) && l <= min(o,c) && v >= 0 && c > 0 && t >= 0`.
    pub fn is_valid(&self) -> bool {
        self.h >= self.o.max(self.c)
            && self.l <= self.o.min(self.c)
            && self.v >= 0.0
            && self.c > 0.0
            && self.t >= 0
            && self.h.is_finite()
            && self.l.is_finite()
            && self.o.is_finite()
            && self.c.is_finite()
    }
}

/// Identifies a single time series: `(coin, interval, source)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandleKey {
    pub coin: String,
    pub interval: Interval,
    pub source: String,
}

impl CandleKey {
    pub fn new(coin: impl Into<String>, interval: Interval, source: impl Into<String>) -> Self {
        Self {
            coin: coin.into(),
            interval,
            source: source.into(),
        }
    }
}

impl fmt::Display for CandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.source, self.coin, self.interval)
    }
}

/// Per-`CandleKey` high-water mark. Invariant: `last_ts == max(t)` over the
/// bars stored for that key, updated transactionally with bar upserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    pub last_ts: i64,
}

/// Deduplicates by `t` (first occurrence wins) and sorts ascending, as
/// required at the end of `fetchCandles` (spec.md §4.1).
pub fn dedup_sort_candles(mut candles: Vec<Candle>) -> Vec<Candle> {
    candles.sort_by_key(|c| c.t);
    candles.dedup_by_key(|c| c.t);
    candles
}

/// Aggregates a run of primary-interval candles into one higher-timeframe
/// bar: `o=first.o, h=max.h, l=min.l, c=last.c, v=sum, n=sum` (spec.md §4.6).
pub fn aggregate_ohlc(bars: &[Candle]) -> Option<Candle> {
    let first = bars.first()?;
    let last = bars.last()?;
    Some(Candle {
        t: first.t,
        o: first.o,
        h: bars.iter().fold(f64::MIN, |acc, b| acc.max(b.h)),
        l: bars.iter().fold(f64::MAX, |acc, b| acc.min(b.l)),
        c: last.c,
        v: bars.iter().map(|b| b.v).sum(),
        n: bars.iter().map(|b| b.n).sum(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candle_invariants() {
        let good = Candle {
            t: 0,
            o: 10.0,
            h: 11.0,
            l: 9.0,
            c: 10.5,
            v: 1.0,
            n: 1,
        };
        assert!(good.is_valid());

        let bad_high = Candle { h: 10.0, ..good };
        assert!(!bad_high.is_valid());

        let bad_volume = Candle { v: -1.0, ..good };
        assert!(!bad_volume.is_valid());
    }

    #[test]
    fn interval_roundtrips_through_string() {
        for s in ["1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "8h", "12h", "1d", "3d", "1w", "1M"] {
            let parsed: Interval = s.parse().unwrap();
            assert_eq!(parsed.as_str(), s);
        }
    }

    #[test]
    fn monthly_interval_has_no_fixed_millis() {
        assert_eq!(Interval::Mo1.millis(), None);
        assert_eq!(Interval::M15.millis(), Some(15 * 60_000));
    }

    #[test]
    fn dedup_sort_keeps_first_occurrence() {
        let c = |t: i64, o: f64| Candle { t, o, h: o + 1.0, l: o - 1.0, c: o, v: 1.0, n: 1 };
        let candles = vec![c(2000, 2.0), c(1000, 1.0), c(1000, 99.0)];
        let out = dedup_sort_candles(candles);
        assert_eq!(out.iter().map(|c| c.t).collect::<Vec<_>>(), vec![1000, 2000]);
        assert_eq!(out[0].o, 1.0);
    }

    #[test]
    fn aggregate_ohlc_combines_run() {
        let c = |t: i64, o: f64, h: f64, l: f64, c_: f64, v: f64| Candle { t, o, h, l, c: c_, v, n: 1 };
        let bars = vec![c(0, 10.0, 12.0, 9.0, 11.0, 5.0), c(900, 11.0, 13.0, 10.5, 12.5, 7.0)];
        let agg = aggregate_ohlc(&bars).unwrap();
        assert_eq!(agg.t, 0);
        assert_eq!(agg.o, 10.0);
        assert_eq!(agg.h, 13.0);
        assert_eq!(agg.l, 9.0);
        assert_eq!(agg.c, 12.5);
        assert_eq!(agg.v, 12.0);
        assert_eq!(agg.n, 2);
    }
}
