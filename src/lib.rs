pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod oracle;
pub mod orchestration;
pub mod swap;

pub use config::Config;
pub use domain::{AccountId, Address, CreditEvent, Decimal, EventRecord, TimeMs, TokenId};
pub use engine::{
    AccountFactory, ClosePath, ClosePayments, CreditAccount, CreditFilter, CreditManager,
    CreditManagerParams, InterestRateModel, LinearInterestRateModel, PoolParams, PoolService,
    TokenHolding,
};
pub use error::CreditError;
pub use ledger::{FungibleAsset, LedgerError, TokenLedger};
pub use oracle::{PriceFeed, PriceOracle, PriceRound, StaticPriceFeed};
pub use orchestration::{Clock, CreditSystem, ManualClock, SystemClock};
pub use swap::{FixedRateRouter, RouterError, SwapRouter};
