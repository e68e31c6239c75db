//! Signal, position, and order data model (spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::errors::RiskViolation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "long"),
            Direction::Short => write!(f, "short"),
        }
    }
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

/// A tunable strategy parameter (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyParam {
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub optimizable: bool,
    pub description: String,
}

impl StrategyParam {
    pub fn is_valid(&self) -> bool {
        self.min <= self.value && self.value <= self.max && self.step > 0.0
    }

    pub fn validate_override(&self, new_value: f64) -> Result<(), RiskViolation> {
        if new_value < self.min || new_value > self.max {
            return Err(RiskViolation::ParamOutOfBounds {
                name: self.description.clone(),
                value: new_value,
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TakeProfit {
    pub price: f64,
    pub pct_of_position: f64,
}

/// A directional trading intent produced by a strategy for a given bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub direction: Direction,
    /// `None` means execute at market.
    pub entry_price: Option<f64>,
    pub stop_loss: f64,
    pub take_profits: Vec<TakeProfit>,
    pub comment: String,
}

impl Signal {
    /// Validates the sign relations and take-profit share of spec.md §3,
    /// given the current market price to check the stop-loss relation
    /// against when `entry_price` is `None` (market order).
    pub fn validate(&self, current_price: f64) -> Result<(), RiskViolation> {
        if self.stop_loss <= 0.0 {
            return Err(RiskViolation::InvalidSignal {
                reason: "stopLoss must be > 0".into(),
            });
        }
        let pct_sum: f64 = self.take_profits.iter().map(|tp| tp.pct_of_position).sum();
        if pct_sum > 1.0 + 1e-9 {
            return Err(RiskViolation::InvalidSignal {
                reason: "sum(pctOfPosition) must be <= 1".into(),
            });
        }
        for tp in &self.take_profits {
            if tp.price <= 0.0 || !(0.0..=1.0).contains(&tp.pct_of_position) {
                return Err(RiskViolation::InvalidSignal {
                    reason: "takeProfit price/pct out of range".into(),
                });
            }
        }
        let reference = self.entry_price.unwrap_or(current_price);
        match self.direction {
            Direction::Long if self.stop_loss >= reference => {
                return Err(RiskViolation::InvalidSignal {
                    reason: "long stopLoss must be < entry/current price".into(),
                });
            }
            Direction::Short if self.stop_loss <= reference => {
                return Err(RiskViolation::InvalidSignal {
                    reason: "short stopLoss must be > entry/current price".into(),
                });
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub coin: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub size: f64,
    pub stop_loss: f64,
    pub take_profits: Vec<TakeProfit>,
    pub trailing_stop_loss: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub signal_id: String,
    pub liquidation_px: Option<f64>,
}

impl Position {
    /// True if `candidate` is strictly "better" than the current stop
    /// (higher for long, lower for short) beyond a small epsilon, per the
    /// trailing-stop recalculation rule of spec.md §4.14.
    pub fn is_better_stop(&self, candidate: f64, epsilon: f64) -> bool {
        let current = self.trailing_stop_loss.unwrap_or(self.stop_loss);
        match self.direction {
            Direction::Long => candidate > current + epsilon,
            Direction::Short => candidate < current - epsilon,
        }
    }

    pub fn effective_stop(&self) -> f64 {
        self.trailing_stop_loss.unwrap_or(self.stop_loss)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderTag {
    Entry,
    Sl,
    Tp(u8),
}

impl fmt::Display for OrderTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderTag::Entry => write!(f, "entry"),
            OrderTag::Sl => write!(f, "sl"),
            OrderTag::Tp(n) => write!(f, "tp{n}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub signal_id: String,
    pub hl_order_id: Option<String>,
    pub coin: String,
    pub side: OrderSide,
    pub size: f64,
    pub price: Option<f64>,
    pub order_type: OrderType,
    pub tag: OrderTag,
    pub status: OrderStatus,
    pub mode: String,
    pub filled_at: Option<DateTime<Utc>>,
}

/// A single exchange fill against an order (spec.md §4.15). Dedup key is
/// `(hl_order_id, fill_id)` — snapshots redelivered on (re)subscribe must not
/// double-apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub hl_order_id: String,
    pub fill_id: String,
    pub coin: String,
    pub price: f64,
    pub size: f64,
    pub fee: f64,
    pub filled_at: DateTime<Utc>,
}

/// The idempotency-audited record of every admission decision (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSignal {
    pub alert_id: String,
    pub source: String,
    pub coin: String,
    pub side: Direction,
    pub entry_price: Option<f64>,
    pub stop_loss: f64,
    pub take_profits: Vec<TakeProfit>,
    pub risk_check_passed: bool,
    pub risk_check_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tp(price: f64, pct: f64) -> TakeProfit {
        TakeProfit {
            price,
            pct_of_position: pct,
        }
    }

    #[test]
    fn long_signal_requires_lower_stop() {
        let sig = Signal {
            direction: Direction::Long,
            entry_price: Some(100.0),
            stop_loss: 105.0,
            take_profits: vec![],
            comment: String::new(),
        };
        assert!(sig.validate(100.0).is_err());
    }

    #[test]
    fn short_signal_requires_higher_stop() {
        let sig = Signal {
            direction: Direction::Short,
            entry_price: Some(100.0),
            stop_loss: 95.0,
            take_profits: vec![],
            comment: String::new(),
        };
        assert!(sig.validate(100.0).is_err());
    }

    #[test]
    fn take_profit_pct_sum_over_one_rejected() {
        let sig = Signal {
            direction: Direction::Long,
            entry_price: Some(100.0),
            stop_loss: 90.0,
            take_profits: vec![tp(110.0, 0.6), tp(120.0, 0.6)],
            comment: String::new(),
        };
        assert!(sig.validate(100.0).is_err());
    }

    #[test]
    fn valid_long_signal_passes() {
        let sig = Signal {
            direction: Direction::Long,
            entry_price: Some(100.0),
            stop_loss: 95.0,
            take_profits: vec![tp(110.0, 0.5), tp(120.0, 0.5)],
            comment: String::new(),
        };
        assert!(sig.validate(100.0).is_ok());
    }

    #[test]
    fn trailing_stop_only_moves_favorably() {
        let mut pos = Position {
            coin: "BTC".into(),
            direction: Direction::Long,
            entry_price: 100.0,
            size: 1.0,
            stop_loss: 90.0,
            take_profits: vec![],
            trailing_stop_loss: None,
            opened_at: Utc::now(),
            signal_id: "s1".into(),
            liquidation_px: None,
        };
        assert!(pos.is_better_stop(95.0, 0.01));
        assert!(!pos.is_better_stop(85.0, 0.01));
        pos.trailing_stop_loss = Some(95.0);
        assert!(!pos.is_better_stop(94.0, 0.01));
        assert!(pos.is_better_stop(96.0, 0.01));
    }
}
