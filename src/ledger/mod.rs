//! Fungible-asset abstraction for every token the protocol touches.

use crate::domain::{Address, Decimal, TokenId};
use std::fmt;
use thiserror::Error;

pub mod memory;

pub use memory::TokenLedger;

/// Balance/transfer/allowance primitive over all tokens on the ledger.
///
/// Amounts are whole base units. Every mutating call either applies fully or
/// returns an error without touching any balance.
pub trait FungibleAsset: fmt::Debug {
    /// Balance of `holder` in `token`.
    fn balance_of(&self, token: &TokenId, holder: &Address) -> Decimal;

    /// Move `amount` from `from` to `to`.
    fn transfer(
        &mut self,
        token: &TokenId,
        from: &Address,
        to: &Address,
        amount: Decimal,
    ) -> Result<(), LedgerError>;

    /// Move `amount` from `from` to `to`, spending the allowance `from` granted to `spender`.
    fn transfer_from(
        &mut self,
        token: &TokenId,
        spender: &Address,
        from: &Address,
        to: &Address,
        amount: Decimal,
    ) -> Result<(), LedgerError>;

    /// Set the allowance `owner` grants to `spender`.
    fn approve(
        &mut self,
        token: &TokenId,
        owner: &Address,
        spender: &Address,
        amount: Decimal,
    ) -> Result<(), LedgerError>;

    /// Remaining allowance `owner` granted to `spender`.
    fn allowance(&self, token: &TokenId, owner: &Address, spender: &Address) -> Decimal;

    /// Total supply of `token`.
    fn total_supply(&self, token: &TokenId) -> Decimal;

    /// Create `amount` of `token` for `to`. Only the registered minter may mint.
    fn mint(
        &mut self,
        caller: &Address,
        token: &TokenId,
        to: &Address,
        amount: Decimal,
    ) -> Result<(), LedgerError>;

    /// Destroy `amount` of `token` held by `from`. Only the registered minter may burn.
    fn burn(
        &mut self,
        caller: &Address,
        token: &TokenId,
        from: &Address,
        amount: Decimal,
    ) -> Result<(), LedgerError>;
}

/// Error type for ledger operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Holder does not have enough of the token.
    #[error("Insufficient {token} balance for {holder}")]
    InsufficientBalance { token: TokenId, holder: Address },
    /// Spender's allowance is below the requested amount.
    #[error("Insufficient {token} allowance for {spender}")]
    InsufficientAllowance { token: TokenId, spender: Address },
    /// Caller is not the registered minter of the token.
    #[error("{caller} is not the minter of {token}")]
    NotMinter { token: TokenId, caller: Address },
    /// Negative or fractional amount.
    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_error_display() {
        let err = LedgerError::InsufficientBalance {
            token: TokenId::new("USDC"),
            holder: Address::new("0xabc"),
        };
        assert_eq!(err.to_string(), "Insufficient USDC balance for 0xabc");

        let err = LedgerError::InvalidAmount(Decimal::from_units(0) - Decimal::one());
        assert_eq!(err.to_string(), "Invalid amount: -1");
    }

    #[test]
    fn test_ledger_error_is_std_error() {
        let err: Box<dyn std::error::Error> = Box::new(LedgerError::NotMinter {
            token: TokenId::new("dUSDC"),
            caller: Address::new("0xeve"),
        });
        assert_eq!(err.to_string(), "0xeve is not the minter of dUSDC");
    }
}
