//! Per-venue symbol mapping (spec.md §4.1, generalized from the teacher's
//! `normalize_crypto_symbol`/`denormalize_crypto_symbol` pair).

use crate::config::Venue;
use crate::domain::errors::CandleError;

/// Maps `(coin, venue)` to a venue-specific wire symbol. Unknown venues are
/// rejected with `UnsupportedSource`; a `symbol_override` always wins.
pub fn venue_symbol(
    coin: &str,
    venue: Venue,
    symbol_override: Option<&str>,
) -> Result<String, CandleError> {
    if let Some(sym) = symbol_override {
        return Ok(sym.to_string());
    }
    match venue {
        Venue::Binance => Ok(format!("{}USDT", coin.to_uppercase())),
        Venue::Hyperliquid => Ok(coin.to_uppercase()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binance_appends_usdt_quote() {
        assert_eq!(venue_symbol("btc", Venue::Binance, None).unwrap(), "BTCUSDT");
    }

    #[test]
    fn hyperliquid_uses_bare_coin() {
        assert_eq!(venue_symbol("eth", Venue::Hyperliquid, None).unwrap(), "ETH");
    }

    #[test]
    fn override_always_wins() {
        assert_eq!(
            venue_symbol("btc", Venue::Binance, Some("XBTUSD")).unwrap(),
            "XBTUSD"
        );
    }
}
