//! Manually driven price feed.

use super::{PriceFeed, PriceRound};
use crate::domain::{Decimal, TimeMs};
use std::sync::RwLock;

/// Price feed whose answer is set by its operator.
#[derive(Debug)]
pub struct StaticPriceFeed {
    round: RwLock<PriceRound>,
}

impl StaticPriceFeed {
    pub fn new(answer: Decimal, updated_at: TimeMs) -> Self {
        Self {
            round: RwLock::new(PriceRound { answer, updated_at }),
        }
    }

    /// Publish a new answer.
    pub fn set_price(&self, answer: Decimal, updated_at: TimeMs) {
        let mut round = self.round.write().unwrap_or_else(|e| e.into_inner());
        *round = PriceRound { answer, updated_at };
    }
}

impl PriceFeed for StaticPriceFeed {
    fn latest_round(&self) -> PriceRound {
        *self.round.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_price_updates_round() {
        let feed = StaticPriceFeed::new(Decimal::from_units(5), TimeMs::new(0));
        feed.set_price(Decimal::from_units(7), TimeMs::new(10));
        let round = feed.latest_round();
        assert_eq!(round.answer, Decimal::from_units(7));
        assert_eq!(round.updated_at, TimeMs::new(10));
    }
}
