use crate::domain::{Address, Decimal, TimeMs, TokenId};
use crate::ledger::LedgerError;
use crate::swap::RouterError;
use thiserror::Error;

/// Failure of a whole credit operation. State is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CreditError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Token not allowed: {0}")]
    TokenNotAllowed(TokenId),
    #[error("Insufficient pool liquidity: requested {requested}, available {available}")]
    InsufficientPoolLiquidity {
        requested: Decimal,
        available: Decimal,
    },
    #[error("Exceeds available liquidity: requested {requested}, available {available}")]
    ExceedsAvailableLiquidity {
        requested: Decimal,
        available: Decimal,
    },
    #[error("Account already open for {0}")]
    AccountAlreadyOpen(Address),
    #[error("No open account for {0}")]
    NoOpenAccount(Address),
    #[error("Health factor sufficient: {health_factor} >= {threshold}")]
    HealthFactorSufficient { health_factor: u64, threshold: u64 },
    #[error("Parameter out of range: {0}")]
    ParameterOutOfRange(String),
    #[error("Stale price for {token}: updated at {updated_at:?}, now {now:?}")]
    StalePrice {
        token: TokenId,
        updated_at: TimeMs,
        now: TimeMs,
    },
    #[error("No price feed registered for {0}")]
    NoFeedRegistered(TokenId),
    #[error("Length mismatch: {tokens} tokens, {feeds} feeds")]
    LengthMismatch { tokens: usize, feeds: usize },
    #[error("Invalid price for {0}")]
    InvalidPrice(TokenId),
    #[error("Swap slippage exceeded: got {amount_out}, wanted at least {amount_out_min}")]
    SwapSlippageExceeded {
        amount_out: Decimal,
        amount_out_min: Decimal,
    },
    #[error("Insufficient allowance of {token} for {spender}")]
    InsufficientAllowance { token: TokenId, spender: Address },
    #[error("Insufficient {token} balance for {holder}")]
    InsufficientBalance { token: TokenId, holder: Address },
    #[error("Insufficient funds to settle: required {required}, available {available}")]
    InsufficientFunds {
        required: Decimal,
        available: Decimal,
    },
    #[error("Router error: {0}")]
    Router(String),
    #[error("Math overflow in {0}")]
    MathOverflow(&'static str),
}

impl From<LedgerError> for CreditError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientBalance { token, holder } => {
                CreditError::InsufficientBalance { token, holder }
            }
            LedgerError::InsufficientAllowance { token, spender } => {
                CreditError::InsufficientAllowance { token, spender }
            }
            LedgerError::NotMinter { token, caller } => {
                CreditError::Unauthorized(format!("{} cannot mint or burn {}", caller, token))
            }
            LedgerError::InvalidAmount(amount) => {
                CreditError::ParameterOutOfRange(format!("invalid token amount {}", amount))
            }
        }
    }
}

impl From<RouterError> for CreditError {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::InsufficientOutputAmount {
                amount_out,
                amount_out_min,
            } => CreditError::SwapSlippageExceeded {
                amount_out,
                amount_out_min,
            },
            RouterError::Ledger(inner) => inner.into(),
            other => CreditError::Router(other.to_string()),
        }
    }
}
