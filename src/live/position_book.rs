//! In-memory, per-coin position book (spec.md §4.14, C14).
//!
//! A plain value type, not internally synchronized: per the "break cyclic
//! references" design note (spec.md §9), the book is manipulated only
//! through these methods by callers that already hold the per-coin
//! serialization (the live runner's per-coin mutex, spec.md §5).

use std::collections::HashMap;

use crate::domain::trading::Position;

#[derive(Debug, Default)]
pub struct PositionBook {
    positions: HashMap<String, Position>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, position: Position) {
        self.positions.insert(position.coin.clone(), position);
    }

    pub fn close(&mut self, coin: &str) -> Option<Position> {
        self.positions.remove(coin)
    }

    pub fn get(&self, coin: &str) -> Option<&Position> {
        self.positions.get(coin)
    }

    pub fn get_mut(&mut self, coin: &str) -> Option<&mut Position> {
        self.positions.get_mut(coin)
    }

    pub fn get_all(&self) -> Vec<&Position> {
        self.positions.values().collect()
    }

    /// Applies the trailing-stop recalculation rule of spec.md §4.14:
    /// updates the book only if `candidate` is strictly better than the
    /// current stop beyond `epsilon`, and returns the new level when it
    /// does so the caller can re-place the exchange stop order.
    pub fn update_trailing_stop(&mut self, coin: &str, candidate: f64, epsilon: f64) -> Option<f64> {
        let position = self.positions.get_mut(coin)?;
        if position.is_better_stop(candidate, epsilon) {
            position.trailing_stop_loss = Some(candidate);
            Some(candidate)
        } else {
            None
        }
    }

    /// Reduces an open position's size after a partial fill (SL/TP leg);
    /// closes and returns the position once size reaches zero (spec.md
    /// §4.15).
    pub fn reduce(&mut self, coin: &str, filled_size: f64) -> Option<Position> {
        let position = self.positions.get_mut(coin)?;
        position.size -= filled_size;
        if position.size <= 1e-9 {
            self.positions.remove(coin)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trading::Direction;
    use chrono::Utc;

    fn position(coin: &str, stop: f64) -> Position {
        Position {
            coin: coin.to_string(),
            direction: Direction::Long,
            entry_price: 100.0,
            size: 1.0,
            stop_loss: stop,
            take_profits: vec![],
            trailing_stop_loss: None,
            opened_at: Utc::now(),
            signal_id: "s1".into(),
            liquidation_px: None,
        }
    }

    #[test]
    fn trailing_stop_updates_only_on_favorable_move() {
        let mut book = PositionBook::new();
        book.open(position("BTC", 90.0));
        assert_eq!(book.update_trailing_stop("BTC", 95.0, 0.01), Some(95.0));
        assert_eq!(book.update_trailing_stop("BTC", 93.0, 0.01), None);
        assert_eq!(book.get("BTC").unwrap().trailing_stop_loss, Some(95.0));
    }

    #[test]
    fn reduce_closes_position_once_size_reaches_zero() {
        let mut book = PositionBook::new();
        book.open(position("ETH", 90.0));
        assert!(book.reduce("ETH", 0.5).is_none());
        assert_eq!(book.get("ETH").unwrap().size, 0.5);
        let closed = book.reduce("ETH", 0.5);
        assert!(closed.is_some());
        assert!(book.get("ETH").is_none());
    }

    #[test]
    fn get_all_reflects_every_open_coin() {
        let mut book = PositionBook::new();
        book.open(position("BTC", 90.0));
        book.open(position("ETH", 90.0));
        assert_eq!(book.get_all().len(), 2);
    }
}
