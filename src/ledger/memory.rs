//! In-process token ledger.

use super::{FungibleAsset, LedgerError};
use crate::domain::{Address, Decimal, TokenId};
use std::collections::BTreeMap;

/// Multi-token ledger holding balances, allowances and supply in memory.
///
/// Tokens without a registered minter behave like open faucets: anyone may
/// mint them. Once a minter is registered only that address can mint or burn.
/// An allowance of `Decimal::MAX` is never decremented.
#[derive(Debug, Clone, Default)]
pub struct TokenLedger {
    balances: BTreeMap<(TokenId, Address), Decimal>,
    allowances: BTreeMap<(TokenId, Address, Address), Decimal>,
    supply: BTreeMap<TokenId, Decimal>,
    minters: BTreeMap<TokenId, Address>,
}

impl TokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict minting and burning of `token` to `minter`.
    pub fn register_minter(&mut self, token: &TokenId, minter: &Address) -> Result<(), LedgerError> {
        match self.minters.get(token) {
            Some(existing) if existing != minter => Err(LedgerError::NotMinter {
                token: token.clone(),
                caller: minter.clone(),
            }),
            _ => {
                self.minters.insert(token.clone(), minter.clone());
                Ok(())
            }
        }
    }

    /// Registered minter of `token`, if any.
    pub fn minter_of(&self, token: &TokenId) -> Option<&Address> {
        self.minters.get(token)
    }

    /// Every non-zero balance of `holder`, ordered by token.
    pub fn holdings_of(&self, holder: &Address) -> Vec<(TokenId, Decimal)> {
        self.balances
            .iter()
            .filter(|((_, h), bal)| h == holder && !bal.is_zero())
            .map(|((token, _), bal)| (token.clone(), *bal))
            .collect()
    }

    fn validate(amount: Decimal) -> Result<(), LedgerError> {
        if amount.is_negative() || amount.floor() != amount {
            return Err(LedgerError::InvalidAmount(amount));
        }
        Ok(())
    }

    fn check_minter(&self, caller: &Address, token: &TokenId) -> Result<(), LedgerError> {
        match self.minters.get(token) {
            Some(minter) if minter != caller => Err(LedgerError::NotMinter {
                token: token.clone(),
                caller: caller.clone(),
            }),
            _ => Ok(()),
        }
    }

    fn credit(&mut self, token: &TokenId, holder: &Address, amount: Decimal) {
        *self
            .balances
            .entry((token.clone(), holder.clone()))
            .or_default() += amount;
    }

    fn debit(&mut self, token: &TokenId, holder: &Address, amount: Decimal) -> Result<(), LedgerError> {
        let key = (token.clone(), holder.clone());
        let balance = self.balances.get(&key).copied().unwrap_or_default();
        if balance < amount {
            return Err(LedgerError::InsufficientBalance {
                token: token.clone(),
                holder: holder.clone(),
            });
        }
        let remaining = balance - amount;
        if remaining.is_zero() {
            self.balances.remove(&key);
        } else {
            self.balances.insert(key, remaining);
        }
        Ok(())
    }
}

impl FungibleAsset for TokenLedger {
    fn balance_of(&self, token: &TokenId, holder: &Address) -> Decimal {
        self.balances
            .get(&(token.clone(), holder.clone()))
            .copied()
            .unwrap_or_default()
    }

    fn transfer(
        &mut self,
        token: &TokenId,
        from: &Address,
        to: &Address,
        amount: Decimal,
    ) -> Result<(), LedgerError> {
        Self::validate(amount)?;
        self.debit(token, from, amount)?;
        self.credit(token, to, amount);
        Ok(())
    }

    fn transfer_from(
        &mut self,
        token: &TokenId,
        spender: &Address,
        from: &Address,
        to: &Address,
        amount: Decimal,
    ) -> Result<(), LedgerError> {
        Self::validate(amount)?;
        let key = (token.clone(), from.clone(), spender.clone());
        let allowance = self.allowances.get(&key).copied().unwrap_or_default();
        if allowance < amount {
            return Err(LedgerError::InsufficientAllowance {
                token: token.clone(),
                spender: spender.clone(),
            });
        }
        self.debit(token, from, amount)?;
        self.credit(token, to, amount);
        if allowance != Decimal::MAX {
            self.allowances.insert(key, allowance - amount);
        }
        Ok(())
    }

    fn approve(
        &mut self,
        token: &TokenId,
        owner: &Address,
        spender: &Address,
        amount: Decimal,
    ) -> Result<(), LedgerError> {
        if amount != Decimal::MAX {
            Self::validate(amount)?;
        }
        self.allowances
            .insert((token.clone(), owner.clone(), spender.clone()), amount);
        Ok(())
    }

    fn allowance(&self, token: &TokenId, owner: &Address, spender: &Address) -> Decimal {
        self.allowances
            .get(&(token.clone(), owner.clone(), spender.clone()))
            .copied()
            .unwrap_or_default()
    }

    fn total_supply(&self, token: &TokenId) -> Decimal {
        self.supply.get(token).copied().unwrap_or_default()
    }

    fn mint(
        &mut self,
        caller: &Address,
        token: &TokenId,
        to: &Address,
        amount: Decimal,
    ) -> Result<(), LedgerError> {
        Self::validate(amount)?;
        self.check_minter(caller, token)?;
        self.credit(token, to, amount);
        *self.supply.entry(token.clone()).or_default() += amount;
        Ok(())
    }

    fn burn(
        &mut self,
        caller: &Address,
        token: &TokenId,
        from: &Address,
        amount: Decimal,
    ) -> Result<(), LedgerError> {
        Self::validate(amount)?;
        self.check_minter(caller, token)?;
        self.debit(token, from, amount)?;
        *self.supply.entry(token.clone()).or_default() -= amount;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usdc() -> TokenId {
        TokenId::new("USDC")
    }

    fn alice() -> Address {
        Address::new("0xalice")
    }

    fn bob() -> Address {
        Address::new("0xbob")
    }

    fn units(n: u64) -> Decimal {
        Decimal::from_units(n)
    }

    #[test]
    fn test_mint_and_transfer() {
        let mut ledger = TokenLedger::new();
        ledger.mint(&alice(), &usdc(), &alice(), units(100)).unwrap();
        ledger.transfer(&usdc(), &alice(), &bob(), units(40)).unwrap();

        assert_eq!(ledger.balance_of(&usdc(), &alice()), units(60));
        assert_eq!(ledger.balance_of(&usdc(), &bob()), units(40));
        assert_eq!(ledger.total_supply(&usdc()), units(100));
    }

    #[test]
    fn test_transfer_insufficient_balance_leaves_state() {
        let mut ledger = TokenLedger::new();
        ledger.mint(&alice(), &usdc(), &alice(), units(10)).unwrap();
        let err = ledger.transfer(&usdc(), &alice(), &bob(), units(11)).unwrap_err();

        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        assert_eq!(ledger.balance_of(&usdc(), &alice()), units(10));
        assert_eq!(ledger.balance_of(&usdc(), &bob()), Decimal::zero());
    }

    #[test]
    fn test_transfer_from_spends_allowance() {
        let mut ledger = TokenLedger::new();
        ledger.mint(&alice(), &usdc(), &alice(), units(100)).unwrap();
        ledger.approve(&usdc(), &alice(), &bob(), units(30)).unwrap();

        ledger
            .transfer_from(&usdc(), &bob(), &alice(), &bob(), units(20))
            .unwrap();
        assert_eq!(ledger.allowance(&usdc(), &alice(), &bob()), units(10));

        let err = ledger
            .transfer_from(&usdc(), &bob(), &alice(), &bob(), units(20))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientAllowance { .. }));
    }

    #[test]
    fn test_unbounded_allowance_is_not_decremented() {
        let mut ledger = TokenLedger::new();
        ledger.mint(&alice(), &usdc(), &alice(), units(100)).unwrap();
        ledger.approve(&usdc(), &alice(), &bob(), Decimal::MAX).unwrap();
        ledger
            .transfer_from(&usdc(), &bob(), &alice(), &bob(), units(50))
            .unwrap();
        assert_eq!(ledger.allowance(&usdc(), &alice(), &bob()), Decimal::MAX);
    }

    #[test]
    fn test_registered_minter_is_exclusive() {
        let mut ledger = TokenLedger::new();
        let share = TokenId::new("dUSDC");
        let pool = Address::new("0xpool");
        ledger.register_minter(&share, &pool).unwrap();

        let err = ledger.mint(&alice(), &share, &alice(), units(1)).unwrap_err();
        assert!(matches!(err, LedgerError::NotMinter { .. }));
        ledger.mint(&pool, &share, &alice(), units(1)).unwrap();
        ledger.burn(&pool, &share, &alice(), units(1)).unwrap();
        assert_eq!(ledger.total_supply(&share), Decimal::zero());

        assert!(ledger.register_minter(&share, &alice()).is_err());
    }

    #[test]
    fn test_fractional_amount_rejected() {
        let mut ledger = TokenLedger::new();
        let half = Decimal::from_str_canonical("0.5").unwrap();
        let err = ledger.mint(&alice(), &usdc(), &alice(), half).unwrap_err();
        assert_eq!(err, LedgerError::InvalidAmount(half));
    }

    #[test]
    fn test_holdings_of_is_ordered() {
        let mut ledger = TokenLedger::new();
        ledger.mint(&alice(), &TokenId::new("WETH"), &alice(), units(2)).unwrap();
        ledger.mint(&alice(), &usdc(), &alice(), units(5)).unwrap();
        let holdings = ledger.holdings_of(&alice());
        assert_eq!(
            holdings,
            vec![(usdc(), units(5)), (TokenId::new("WETH"), units(2))]
        );
    }
}
