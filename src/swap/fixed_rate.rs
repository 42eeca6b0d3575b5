//! Router quoting every pair at an operator-set rate minus a flat fee.

use super::{RouterError, SwapRouter};
use crate::domain::{Address, Decimal, TimeMs, TokenId};
use crate::ledger::FungibleAsset;
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Router that prices each hop at a fixed rate and charges `fee_bps` per hop.
///
/// Output is paid from the router's own ledger balance, so it must be funded
/// with every token it can deliver.
#[derive(Debug)]
pub struct FixedRateRouter {
    address: Address,
    fee_bps: u64,
    rates: RwLock<BTreeMap<(TokenId, TokenId), Decimal>>,
}

impl FixedRateRouter {
    pub fn new(address: Address, fee_bps: u64) -> Self {
        Self {
            address,
            fee_bps,
            rates: RwLock::new(BTreeMap::new()),
        }
    }

    /// Quote `1 from = rate to`, and the inverse for the reverse direction.
    pub fn set_rate(&self, from: &TokenId, to: &TokenId, rate: Decimal) {
        let mut rates = self.rates.write().unwrap_or_else(|e| e.into_inner());
        rates.insert((from.clone(), to.clone()), rate);
        if rate.is_positive() {
            rates.insert((to.clone(), from.clone()), Decimal::one() / rate);
        }
    }

    /// Amount delivered for `amount_in` along `path`, before slippage checks.
    pub fn quote(&self, amount_in: Decimal, path: &[TokenId]) -> Result<Decimal, RouterError> {
        if path.len() < 2 {
            return Err(RouterError::InvalidPath(format!(
                "need at least two tokens, got {}",
                path.len()
            )));
        }
        let rates = self.rates.read().unwrap_or_else(|e| e.into_inner());
        let keep = Decimal::one() - Decimal::from_bps(self.fee_bps);

        let mut amount = amount_in;
        for hop in path.windows(2) {
            let rate = rates
                .get(&(hop[0].clone(), hop[1].clone()))
                .copied()
                .ok_or_else(|| RouterError::UnknownPair {
                    from: hop[0].clone(),
                    to: hop[1].clone(),
                })?;
            amount = (amount * rate * keep).floor();
        }
        Ok(amount)
    }
}

impl SwapRouter for FixedRateRouter {
    fn address(&self) -> &Address {
        &self.address
    }

    fn swap_exact_tokens_for_tokens(
        &self,
        ledger: &mut dyn FungibleAsset,
        sender: &Address,
        amount_in: Decimal,
        amount_out_min: Decimal,
        path: &[TokenId],
        to: &Address,
        _deadline: TimeMs,
    ) -> Result<Decimal, RouterError> {
        let amount_out = self.quote(amount_in, path)?;
        if amount_out < amount_out_min {
            return Err(RouterError::InsufficientOutputAmount {
                amount_out,
                amount_out_min,
            });
        }

        let (token_in, token_out) = (&path[0], &path[path.len() - 1]);
        ledger.transfer_from(token_in, &self.address, sender, &self.address, amount_in)?;
        ledger.transfer(token_out, &self.address, to, amount_out)?;

        tracing::debug!(
            router = %self.address,
            %token_in,
            %token_out,
            %amount_in,
            %amount_out,
            "swap executed"
        );
        Ok(amount_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TokenLedger;

    fn usdc() -> TokenId {
        TokenId::new("USDC")
    }

    fn weth() -> TokenId {
        TokenId::new("WETH")
    }

    fn units(n: u64) -> Decimal {
        Decimal::from_units(n)
    }

    fn setup() -> (FixedRateRouter, TokenLedger, Address) {
        let router = FixedRateRouter::new(Address::new("0xrouter"), 30);
        router.set_rate(&weth(), &usdc(), units(2000));
        let mut ledger = TokenLedger::new();
        let trader = Address::new("0xtrader");
        ledger.mint(&trader, &weth(), &trader, units(10)).unwrap();
        ledger
            .mint(router.address(), &usdc(), router.address(), units(1_000_000))
            .unwrap();
        (router, ledger, trader)
    }

    #[test]
    fn test_quote_applies_fee_per_hop() {
        let (router, _, _) = setup();
        let out = router.quote(units(1), &[weth(), usdc()]).unwrap();
        assert_eq!(out, units(1994));
    }

    #[test]
    fn test_swap_moves_tokens() {
        let (router, mut ledger, trader) = setup();
        ledger
            .approve(&weth(), &trader, router.address(), Decimal::MAX)
            .unwrap();
        let out = router
            .swap_exact_tokens_for_tokens(
                &mut ledger,
                &trader,
                units(2),
                units(3900),
                &[weth(), usdc()],
                &trader,
                TimeMs::new(0),
            )
            .unwrap();

        assert_eq!(out, units(3988));
        assert_eq!(ledger.balance_of(&weth(), &trader), units(8));
        assert_eq!(ledger.balance_of(&usdc(), &trader), units(3988));
    }

    #[test]
    fn test_swap_below_min_out_fails_without_transfer() {
        let (router, mut ledger, trader) = setup();
        ledger
            .approve(&weth(), &trader, router.address(), Decimal::MAX)
            .unwrap();
        let err = router
            .swap_exact_tokens_for_tokens(
                &mut ledger,
                &trader,
                units(1),
                units(2000),
                &[weth(), usdc()],
                &trader,
                TimeMs::new(0),
            )
            .unwrap_err();

        assert!(matches!(err, RouterError::InsufficientOutputAmount { .. }));
        assert_eq!(ledger.balance_of(&weth(), &trader), units(10));
    }

    #[test]
    fn test_unknown_pair() {
        let (router, _, _) = setup();
        let err = router
            .quote(units(1), &[weth(), TokenId::new("DOGE")])
            .unwrap_err();
        assert!(matches!(err, RouterError::UnknownPair { .. }));
    }
}
