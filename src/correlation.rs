//! Static correlation guard.
//!
//! Keeps the book from quietly concentrating into one macro bet through
//! several tickers. The tables are deliberately static: the majors'
//! relationships are stable enough that a rolling estimate adds noise,
//! not safety.

use crate::signal::{Direction, GateReason, Position};

/// Symbols that historically move together.
fn positively_correlated(symbol: &str) -> &'static [&'static str] {
    match symbol {
        "EUR_USD" => &["GBP_USD", "AUD_USD", "NZD_USD"],
        "GBP_USD" => &["EUR_USD", "AUD_USD"],
        "AUD_USD" => &["EUR_USD", "GBP_USD", "NZD_USD"],
        "NZD_USD" => &["EUR_USD", "AUD_USD"],
        "BTC-USD" => &["ETH-USD"],
        "ETH-USD" => &["BTC-USD"],
        _ => &[],
    }
}

/// Symbols that historically move against each other.
fn inversely_correlated(symbol: &str) -> &'static [&'static str] {
    match symbol {
        "EUR_USD" => &["USD_CHF", "USD_JPY"],
        "GBP_USD" => &["USD_CHF"],
        "USD_CHF" => &["EUR_USD", "GBP_USD"],
        "USD_JPY" => &["EUR_USD"],
        _ => &[],
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CorrelationGuard {
    pub max_correlated: usize,
}

impl CorrelationGuard {
    pub fn new(max_correlated: usize) -> Self {
        Self { max_correlated }
    }

    /// None means the new exposure is acceptable.
    pub fn check(
        &self,
        symbol: &str,
        direction: Direction,
        open_positions: &[Position],
    ) -> Option<GateReason> {
        // Same symbol, same direction is a duplicate. Opposite direction is
        // a reduce and always passes this guard.
        for pos in open_positions.iter().filter(|p| p.symbol == symbol) {
            if pos.direction == direction {
                return Some(GateReason::DuplicatePosition);
            }
        }

        let positives = positively_correlated(symbol);
        let inverses = inversely_correlated(symbol);
        let correlated_exposure = open_positions
            .iter()
            .filter(|p| {
                (positives.contains(&p.symbol.as_str()) && p.direction == direction)
                    || (inverses.contains(&p.symbol.as_str()) && p.direction.opposes(direction))
            })
            .count();
        if correlated_exposure >= self.max_correlated {
            return Some(GateReason::CorrelationLimit);
        }
        None
    }
}
