//! Price oracle: one feed per token, prices in a common unit.
//!
//! Prices are used only for valuation (health factor, liquidation value),
//! never to size a settlement transfer.

use crate::domain::{Decimal, TimeMs, TokenId};
use crate::error::CreditError;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub mod feed;

pub use feed::StaticPriceFeed;

/// Latest answer of a price feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceRound {
    /// Price of one base unit in the common unit.
    pub answer: Decimal,
    /// When the feed last updated.
    pub updated_at: TimeMs,
}

/// External price feed port.
///
/// Implementations must not call back into the credit engine; they are read
/// after the calling operation has already applied its internal effects.
pub trait PriceFeed: Send + Sync + fmt::Debug {
    fn latest_round(&self) -> PriceRound;
}

/// Registry of price feeds with a staleness bound.
#[derive(Clone)]
pub struct PriceOracle {
    feeds: BTreeMap<TokenId, Arc<dyn PriceFeed>>,
    staleness_ms: i64,
}

impl PriceOracle {
    pub fn new(staleness_ms: i64) -> Self {
        Self {
            feeds: BTreeMap::new(),
            staleness_ms,
        }
    }

    /// Register `feeds[i]` as the feed for `tokens[i]`, replacing any previous feed.
    pub fn add_price_feed(
        &mut self,
        tokens: &[TokenId],
        feeds: Vec<Arc<dyn PriceFeed>>,
    ) -> Result<(), CreditError> {
        if tokens.len() != feeds.len() {
            return Err(CreditError::LengthMismatch {
                tokens: tokens.len(),
                feeds: feeds.len(),
            });
        }
        for (token, feed) in tokens.iter().zip(feeds) {
            tracing::debug!(token = %token, "price feed registered");
            self.feeds.insert(token.clone(), feed);
        }
        Ok(())
    }

    pub fn has_feed(&self, token: &TokenId) -> bool {
        self.feeds.contains_key(token)
    }

    pub fn staleness_ms(&self) -> i64 {
        self.staleness_ms
    }

    /// Price of `token` at `now`.
    ///
    /// # Errors
    /// `NoFeedRegistered` for unknown tokens, `StalePrice` when the feed is
    /// older than the staleness bound, `InvalidPrice` for a non-positive answer.
    pub fn price(&self, token: &TokenId, now: TimeMs) -> Result<Decimal, CreditError> {
        let feed = self
            .feeds
            .get(token)
            .ok_or_else(|| CreditError::NoFeedRegistered(token.clone()))?;
        let round = feed.latest_round();

        if now.since(round.updated_at) > self.staleness_ms {
            return Err(CreditError::StalePrice {
                token: token.clone(),
                updated_at: round.updated_at,
                now,
            });
        }
        if !round.answer.is_positive() {
            return Err(CreditError::InvalidPrice(token.clone()));
        }
        Ok(round.answer)
    }

    /// Value of `amount` of `from` expressed in units of `to`.
    pub fn convert(
        &self,
        amount: Decimal,
        from: &TokenId,
        to: &TokenId,
        now: TimeMs,
    ) -> Result<Decimal, CreditError> {
        if from == to || amount.is_zero() {
            return Ok(amount);
        }
        let price_from = self.price(from, now)?;
        let price_to = self.price(to, now)?;
        amount
            .checked_mul(price_from)
            .and_then(|v| v.checked_div(price_to))
            .ok_or(CreditError::MathOverflow("price conversion"))
    }
}

impl fmt::Debug for PriceOracle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriceOracle")
            .field("tokens", &self.feeds.keys().collect::<Vec<_>>())
            .field("staleness_ms", &self.staleness_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    fn oracle_with(prices: &[(&str, &str)], updated_at: i64) -> PriceOracle {
        let mut oracle = PriceOracle::new(60_000);
        let tokens: Vec<TokenId> = prices.iter().map(|(t, _)| TokenId::new(*t)).collect();
        let feeds: Vec<Arc<dyn PriceFeed>> = prices
            .iter()
            .map(|(_, p)| {
                Arc::new(StaticPriceFeed::new(d(p), TimeMs::new(updated_at))) as Arc<dyn PriceFeed>
            })
            .collect();
        oracle.add_price_feed(&tokens, feeds).unwrap();
        oracle
    }

    #[test]
    fn test_length_mismatch() {
        let mut oracle = PriceOracle::new(60_000);
        let err = oracle
            .add_price_feed(&[TokenId::new("USDC"), TokenId::new("WETH")], Vec::new())
            .unwrap_err();
        assert_eq!(err, CreditError::LengthMismatch { tokens: 2, feeds: 0 });
    }

    #[test]
    fn test_unknown_token() {
        let oracle = oracle_with(&[("USDC", "1")], 0);
        let err = oracle.price(&TokenId::new("DOGE"), TimeMs::new(0)).unwrap_err();
        assert_eq!(err, CreditError::NoFeedRegistered(TokenId::new("DOGE")));
    }

    #[test]
    fn test_stale_price_is_an_error() {
        let oracle = oracle_with(&[("USDC", "1")], 1_000);
        assert!(oracle.price(&TokenId::new("USDC"), TimeMs::new(61_000)).is_ok());
        let err = oracle
            .price(&TokenId::new("USDC"), TimeMs::new(61_001))
            .unwrap_err();
        assert!(matches!(err, CreditError::StalePrice { .. }));
    }

    #[test]
    fn test_non_positive_price_rejected() {
        let oracle = oracle_with(&[("USDC", "0")], 0);
        let err = oracle.price(&TokenId::new("USDC"), TimeMs::new(0)).unwrap_err();
        assert_eq!(err, CreditError::InvalidPrice(TokenId::new("USDC")));
    }

    #[test]
    fn test_convert_cross_price() {
        let oracle = oracle_with(&[("USDC", "1"), ("WETH", "2000")], 0);
        let value = oracle
            .convert(d("3"), &TokenId::new("WETH"), &TokenId::new("USDC"), TimeMs::new(0))
            .unwrap();
        assert_eq!(value, d("6000"));
    }
}
