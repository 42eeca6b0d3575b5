//! Protocol engine: pool accounting, interest, credit accounts, collateral
//! risk and the position state machine.

pub mod account_factory;
pub mod credit_filter;
pub mod credit_manager;
pub mod interest;
pub mod pool;

pub use account_factory::{AccountFactory, CreditAccount};
pub use credit_filter::{AllowedToken, CreditFilter, TokenHolding};
pub use credit_manager::{
    ClosePath, ClosePayments, CreditContext, CreditManager, CreditManagerParams, CreditView,
    LEVERAGE_DECIMALS,
};
pub use interest::{utilization, InterestRateModel, LinearInterestRateModel};
pub use pool::{percent_of, PoolParams, PoolService};
