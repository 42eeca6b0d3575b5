//! Swap router port used by credit accounts to trade.

use crate::domain::{Address, Decimal, TimeMs, TokenId};
use crate::ledger::{FungibleAsset, LedgerError};
use std::fmt;
use thiserror::Error;

pub mod fixed_rate;

pub use fixed_rate::FixedRateRouter;

/// External exchange adapter.
///
/// The router only sees the token ledger. Callers apply their own state
/// changes before invoking it, so a router can never observe a half-updated
/// credit account.
pub trait SwapRouter: Send + Sync + fmt::Debug {
    /// Ledger address the router spends allowances as.
    fn address(&self) -> &Address;

    /// Swap exactly `amount_in` of `path[0]` held by `sender` along `path`,
    /// delivering at least `amount_out_min` of the last token to `to`.
    ///
    /// # Returns
    /// The amount of the last token delivered.
    #[allow(clippy::too_many_arguments)]
    fn swap_exact_tokens_for_tokens(
        &self,
        ledger: &mut dyn FungibleAsset,
        sender: &Address,
        amount_in: Decimal,
        amount_out_min: Decimal,
        path: &[TokenId],
        to: &Address,
        deadline: TimeMs,
    ) -> Result<Decimal, RouterError>;
}

/// Error type for router failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("no liquidity for {from} -> {to}")]
    UnknownPair { from: TokenId, to: TokenId },
    #[error("insufficient output amount: {amount_out} < {amount_out_min}")]
    InsufficientOutputAmount {
        amount_out: Decimal,
        amount_out_min: Decimal,
    },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
