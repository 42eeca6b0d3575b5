//! Credit manager: the life cycle of leveraged positions.
//!
//! A position moves `None -> Open -> (trading) -> Closed | Liquidated`. Every
//! operation updates internal bookkeeping (account fields, enabled tokens,
//! ownership) before it touches the pool's balances or calls a router.

use super::account_factory::{AccountFactory, CreditAccount};
use super::credit_filter::CreditFilter;
use super::pool::{percent_of, PoolService, INDEX_DP};
use crate::domain::{AccountId, Address, CreditEvent, Decimal, TimeMs, TokenId, BPS};
use crate::error::CreditError;
use crate::ledger::FungibleAsset;
use crate::oracle::PriceOracle;
use crate::swap::SwapRouter;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Leverage denominator: 100 = x1.
pub const LEVERAGE_DECIMALS: u64 = 100;

/// Tunables of a credit manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditManagerParams {
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    /// Upper bound on leverage, 100 = x1.
    pub max_leverage: u64,
    /// Positions strictly below this health factor may be liquidated.
    pub liquidation_threshold_bps: u64,
    /// Share of accrued interest paid to the pool on top of the debt.
    pub fee_interest_bps: u64,
    /// Share of total value paid to the pool when liquidating.
    pub fee_liquidation_bps: u64,
    /// Share of total value the liquidator pays for the collateral.
    pub liquidation_discount_bps: u64,
    /// Balance left in every slot when an account is swept.
    pub dust: Decimal,
    /// Router used for forced conversions on close and liquidation.
    pub default_router: Option<Address>,
}

impl Default for CreditManagerParams {
    fn default() -> Self {
        Self {
            min_amount: Decimal::one(),
            max_amount: Decimal::from_units(1_000_000),
            max_leverage: 400,
            liquidation_threshold_bps: BPS,
            fee_interest_bps: 1_000,
            fee_liquidation_bps: 200,
            liquidation_discount_bps: 9_500,
            dust: Decimal::one(),
            default_router: None,
        }
    }
}

impl CreditManagerParams {
    pub fn validate(&self) -> Result<(), CreditError> {
        if self.min_amount.is_negative() || self.min_amount > self.max_amount {
            return Err(CreditError::ParameterOutOfRange(format!(
                "credit amount bounds [{}, {}] are inverted",
                self.min_amount, self.max_amount
            )));
        }
        if self.max_leverage == 0 {
            return Err(CreditError::ParameterOutOfRange(
                "max leverage must be positive".to_string(),
            ));
        }
        if self.liquidation_threshold_bps == 0 {
            return Err(CreditError::ParameterOutOfRange(
                "liquidation threshold must be positive".to_string(),
            ));
        }
        for (name, bps) in [
            ("fee_interest_bps", self.fee_interest_bps),
            ("fee_liquidation_bps", self.fee_liquidation_bps),
            ("liquidation_discount_bps", self.liquidation_discount_bps),
        ] {
            if bps > BPS {
                return Err(CreditError::ParameterOutOfRange(format!(
                    "{} must not exceed {}, got {}",
                    name, BPS, bps
                )));
            }
        }
        if self.dust.is_negative() || self.dust.floor() != self.dust {
            return Err(CreditError::ParameterOutOfRange(format!(
                "dust must be a whole non-negative amount, got {}",
                self.dust
            )));
        }
        Ok(())
    }
}

/// Settlement amounts for closing a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosePayments {
    /// Underlying transferred to the pool.
    pub amount_to_pool: Decimal,
    /// Underlying left for the borrower.
    pub remaining_funds: Decimal,
    /// Pool gain over principal plus interest; negative for a loss.
    pub profit: Decimal,
}

/// Forced conversion of one allowed token into the underlying on close.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClosePath {
    pub path: Vec<TokenId>,
    pub amount_out_min: Decimal,
}

impl ClosePath {
    pub fn new(path: Vec<TokenId>, amount_out_min: Decimal) -> Self {
        Self {
            path,
            amount_out_min,
        }
    }

    /// Leave this slot untouched.
    pub fn skip() -> Self {
        Self::default()
    }

    fn is_skip(&self) -> bool {
        self.path.is_empty() && self.amount_out_min.is_zero()
    }
}

/// Mutable protocol state an operation runs against.
pub struct CreditContext<'a> {
    pub ledger: &'a mut dyn FungibleAsset,
    pub pool: &'a mut PoolService,
    pub factory: &'a mut AccountFactory,
    pub oracle: &'a PriceOracle,
    pub routers: &'a BTreeMap<Address, Arc<dyn SwapRouter>>,
    pub events: &'a mut Vec<CreditEvent>,
    pub now: TimeMs,
}

impl CreditContext<'_> {
    pub fn view(&self) -> CreditView<'_> {
        CreditView {
            ledger: &*self.ledger,
            pool: &*self.pool,
            factory: &*self.factory,
            oracle: self.oracle,
            now: self.now,
        }
    }
}

/// Read-only protocol state for queries.
#[derive(Clone, Copy)]
pub struct CreditView<'a> {
    pub ledger: &'a dyn FungibleAsset,
    pub pool: &'a PoolService,
    pub factory: &'a AccountFactory,
    pub oracle: &'a PriceOracle,
    pub now: TimeMs,
}

/// State machine for leveraged positions drawing on one pool.
#[derive(Debug, Clone)]
pub struct CreditManager {
    address: Address,
    underlying: TokenId,
    params: CreditManagerParams,
    filter: CreditFilter,
    credit_accounts: BTreeMap<Address, AccountId>,
    allowed_contracts: BTreeSet<Address>,
}

impl CreditManager {
    /// Bind `filter` to a new manager at `address`.
    pub fn new(
        address: Address,
        mut filter: CreditFilter,
        params: CreditManagerParams,
    ) -> Result<Self, CreditError> {
        params.validate()?;
        filter.connect_credit_manager(&address)?;
        Ok(Self {
            underlying: filter.underlying().clone(),
            address,
            params,
            filter,
            credit_accounts: BTreeMap::new(),
            allowed_contracts: BTreeSet::new(),
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn underlying(&self) -> &TokenId {
        &self.underlying
    }

    pub fn params(&self) -> &CreditManagerParams {
        &self.params
    }

    pub fn filter(&self) -> &CreditFilter {
        &self.filter
    }

    pub fn is_contract_allowed(&self, contract: &Address) -> bool {
        self.allowed_contracts.contains(contract)
    }

    pub fn open_accounts(&self) -> usize {
        self.credit_accounts.len()
    }

    /// Account held by `borrower`.
    pub fn credit_account_of(&self, borrower: &Address) -> Result<AccountId, CreditError> {
        self.credit_accounts
            .get(borrower)
            .copied()
            .ok_or_else(|| CreditError::NoOpenAccount(borrower.clone()))
    }

    pub fn has_open_account(&self, borrower: &Address) -> bool {
        self.credit_accounts.contains_key(borrower)
    }

    /// Whitelist `token` as collateral.
    pub fn allow_token(
        &mut self,
        oracle: &PriceOracle,
        events: &mut Vec<CreditEvent>,
        token: &TokenId,
        risk_weight_bps: u64,
    ) -> Result<(), CreditError> {
        self.filter.allow_token(oracle, token, risk_weight_bps)?;
        info!(manager = %self.address, %token, risk_weight_bps, "token allowed");
        events.push(CreditEvent::TokenAllowed {
            manager: self.address.clone(),
            token: token.clone(),
            risk_weight_bps,
        });
        Ok(())
    }

    /// Let accounts of this manager trade through `contract`.
    pub fn allow_contract(&mut self, events: &mut Vec<CreditEvent>, contract: &Address) {
        if self.allowed_contracts.insert(contract.clone()) {
            info!(manager = %self.address, %contract, "contract allowed");
            events.push(CreditEvent::ContractAllowed {
                manager: self.address.clone(),
                contract: contract.clone(),
            });
        }
    }

    /// Open a position for `on_behalf_of`: `amount` from `caller` plus
    /// `amount × leverage / 100` borrowed from the pool.
    pub fn open_credit_account(
        &mut self,
        ctx: &mut CreditContext<'_>,
        caller: &Address,
        amount: Decimal,
        on_behalf_of: &Address,
        leverage: u64,
        referral_code: u32,
    ) -> Result<AccountId, CreditError> {
        if amount < self.params.min_amount || amount > self.params.max_amount {
            return Err(CreditError::ParameterOutOfRange(format!(
                "amount {} outside [{}, {}]",
                amount, self.params.min_amount, self.params.max_amount
            )));
        }
        if leverage == 0 || leverage > self.params.max_leverage {
            return Err(CreditError::ParameterOutOfRange(format!(
                "leverage {} outside (0, {}]",
                leverage, self.params.max_leverage
            )));
        }
        if self.has_open_account(on_behalf_of) {
            return Err(CreditError::AccountAlreadyOpen(on_behalf_of.clone()));
        }

        let borrowed_amount = (amount * Decimal::from_units(leverage)
            / Decimal::from_units(LEVERAGE_DECIMALS))
        .floor();
        let index = ctx.pool.calc_linear_cumulative_index(ctx.now);
        let id = ctx.factory.take(&self.address, ctx.now);
        let account_address = {
            let account = in_use(ctx.factory, id)?;
            account.borrower = Some(on_behalf_of.clone());
            account.borrowed_amount = borrowed_amount;
            account.cumulative_index_at_open = index;
            account.address.clone()
        };
        self.filter.init_enabled_tokens(&self.address, id)?;
        self.credit_accounts.insert(on_behalf_of.clone(), id);

        ctx.pool.lend_credit_account(
            &mut *ctx.ledger,
            ctx.events,
            &self.address,
            borrowed_amount,
            &account_address,
            ctx.now,
        )?;
        ctx.ledger.transfer_from(
            &self.underlying,
            &self.address,
            caller,
            &account_address,
            amount,
        )?;

        info!(
            manager = %self.address,
            borrower = %on_behalf_of,
            account = %account_address,
            %amount,
            %borrowed_amount,
            "credit account opened"
        );
        ctx.events.push(CreditEvent::AccountOpened {
            sender: caller.clone(),
            on_behalf_of: on_behalf_of.clone(),
            account: account_address,
            account_id: id,
            amount,
            borrowed_amount,
            referral_code,
        });
        Ok(id)
    }

    /// Grant `router` an unbounded allowance on `token` held by the owner's account.
    pub fn approve(
        &mut self,
        ctx: &mut CreditContext<'_>,
        owner: &Address,
        router: &Address,
        token: &TokenId,
    ) -> Result<(), CreditError> {
        let id = self.credit_account_of(owner)?;
        self.ensure_contract(router)?;
        if !self.filter.is_token_allowed(token) {
            return Err(CreditError::TokenNotAllowed(token.clone()));
        }
        let account = in_use(ctx.factory, id)?.address.clone();
        ctx.ledger.approve(token, &account, router, Decimal::MAX)?;
        debug!(%account, %router, %token, "router approved");
        Ok(())
    }

    /// Swap holdings of the owner's account through an allowed router.
    ///
    /// # Returns
    /// Amount of the last path token received.
    pub fn execute_order(
        &mut self,
        ctx: &mut CreditContext<'_>,
        owner: &Address,
        router: &Address,
        amount_in: Decimal,
        amount_out_min: Decimal,
        path: &[TokenId],
    ) -> Result<Decimal, CreditError> {
        let id = self.credit_account_of(owner)?;
        let router_impl = self.router(ctx.routers, router)?;
        self.check_path(path)?;
        let account = in_use(ctx.factory, id)?.address.clone();

        let token_out = &path[path.len() - 1];
        self.filter.check_and_enable_token(&self.address, id, token_out)?;
        provide_allowance(&mut *ctx.ledger, &account, router, &path[0], amount_in)?;

        let amount_out = router_impl.swap_exact_tokens_for_tokens(
            &mut *ctx.ledger,
            &account,
            amount_in,
            amount_out_min,
            path,
            &account,
            ctx.now,
        )?;

        info!(%owner, %router, %amount_in, %amount_out, "order executed");
        ctx.events.push(CreditEvent::OrderExecuted {
            owner: owner.clone(),
            router: router.clone(),
        });
        Ok(amount_out)
    }

    /// Move `amount` of `token` from `caller` into the account of `on_behalf_of`.
    pub fn add_collateral(
        &mut self,
        ctx: &mut CreditContext<'_>,
        caller: &Address,
        on_behalf_of: &Address,
        token: &TokenId,
        amount: Decimal,
    ) -> Result<(), CreditError> {
        if !amount.is_positive() {
            return Err(CreditError::ParameterOutOfRange(
                "collateral amount must be positive".to_string(),
            ));
        }
        let id = self.credit_account_of(on_behalf_of)?;
        self.filter.check_and_enable_token(&self.address, id, token)?;
        let account = in_use(ctx.factory, id)?.address.clone();
        ctx.ledger
            .transfer_from(token, &self.address, caller, &account, amount)?;

        info!(%on_behalf_of, %token, %amount, "collateral added");
        ctx.events.push(CreditEvent::CollateralAdded {
            on_behalf_of: on_behalf_of.clone(),
            token: token.clone(),
            amount,
        });
        Ok(())
    }

    /// Draw `amount` more credit into the owner's account.
    ///
    /// The opening index is re-based so that debt with interest grows by
    /// exactly `amount`.
    pub fn increase_borrowed_amount(
        &mut self,
        ctx: &mut CreditContext<'_>,
        owner: &Address,
        amount: Decimal,
    ) -> Result<(), CreditError> {
        if !amount.is_positive() {
            return Err(CreditError::ParameterOutOfRange(
                "borrow amount must be positive".to_string(),
            ));
        }
        let id = self.credit_account_of(owner)?;
        let limit = (self.params.max_amount * Decimal::from_units(self.params.max_leverage)
            / Decimal::from_units(LEVERAGE_DECIMALS))
        .floor();
        let index_now = ctx.pool.calc_linear_cumulative_index(ctx.now);

        let account_address = {
            let account = in_use(ctx.factory, id)?;
            let new_borrowed = account.borrowed_amount + amount;
            if new_borrowed > limit {
                return Err(CreditError::ParameterOutOfRange(format!(
                    "borrowed amount {} would exceed {}",
                    new_borrowed, limit
                )));
            }
            let index_open = account.cumulative_index_at_open;
            let denominator = index_now * account.borrowed_amount + amount * index_open;
            account.cumulative_index_at_open =
                (index_now * index_open * new_borrowed / denominator).round_dp(INDEX_DP);
            account.borrowed_amount = new_borrowed;
            account.address.clone()
        };

        ctx.pool.lend_credit_account(
            &mut *ctx.ledger,
            ctx.events,
            &self.address,
            amount,
            &account_address,
            ctx.now,
        )?;

        let health_factor = self.health_factor(&ctx.view(), owner)?;
        if health_factor < self.params.liquidation_threshold_bps {
            return Err(CreditError::ParameterOutOfRange(format!(
                "health factor {} would fall below {}",
                health_factor, self.params.liquidation_threshold_bps
            )));
        }

        info!(%owner, %amount, health_factor, "borrowed amount increased");
        ctx.events.push(CreditEvent::BorrowedAmountIncreased {
            owner: owner.clone(),
            amount,
        });
        Ok(())
    }

    /// Hand the owner's account to `new_owner`, who must not hold one.
    pub fn transfer_account_ownership(
        &mut self,
        factory: &mut AccountFactory,
        events: &mut Vec<CreditEvent>,
        owner: &Address,
        new_owner: &Address,
    ) -> Result<(), CreditError> {
        let id = self.credit_account_of(owner)?;
        if self.has_open_account(new_owner) {
            return Err(CreditError::AccountAlreadyOpen(new_owner.clone()));
        }
        in_use(factory, id)?.borrower = Some(new_owner.clone());
        self.credit_accounts.remove(owner);
        self.credit_accounts.insert(new_owner.clone(), id);

        info!(from = %owner, to = %new_owner, account = %id, "ownership transferred");
        events.push(CreditEvent::OwnershipTransferred {
            from: owner.clone(),
            to: new_owner.clone(),
        });
        Ok(())
    }

    /// Repay the debt from the account's own underlying and hand everything left to `to`.
    pub fn repay_credit_account(
        &mut self,
        ctx: &mut CreditContext<'_>,
        owner: &Address,
        to: &Address,
    ) -> Result<Decimal, CreditError> {
        let id = self.credit_account_of(owner)?;
        let remaining_funds = self.settle(ctx, id, owner, to)?;

        info!(%owner, %to, %remaining_funds, "credit account repaid");
        ctx.events.push(CreditEvent::AccountRepaid {
            owner: owner.clone(),
            to: to.clone(),
        });
        Ok(remaining_funds)
    }

    /// Convert holdings along `paths`, repay the debt and hand everything left to `to`.
    ///
    /// `paths[i]` converts allowed token `i` into the underlying. Entry 0 must
    /// be a skip.
    pub fn close_credit_account(
        &mut self,
        ctx: &mut CreditContext<'_>,
        owner: &Address,
        to: &Address,
        paths: &[ClosePath],
    ) -> Result<Decimal, CreditError> {
        let id = self.credit_account_of(owner)?;
        if paths.len() != self.filter.allowed_tokens_count() {
            return Err(CreditError::ParameterOutOfRange(format!(
                "expected {} close paths, got {}",
                self.filter.allowed_tokens_count(),
                paths.len()
            )));
        }
        if !paths[0].is_skip() {
            return Err(CreditError::ParameterOutOfRange(
                "the underlying needs no conversion".to_string(),
            ));
        }

        let account = in_use(ctx.factory, id)?.address.clone();
        for (index, close_path) in paths.iter().enumerate().skip(1) {
            if close_path.is_skip() {
                continue;
            }
            let token = self
                .filter
                .allowed_token(index)
                .map(|allowed| allowed.token.clone())
                .ok_or_else(|| {
                    CreditError::ParameterOutOfRange(format!("no allowed token at {}", index))
                })?;
            // Intermediate hops are never held by the account, so only the ends are checked.
            let path = &close_path.path;
            if path.len() < 2
                || path.first() != Some(&token)
                || path.last() != Some(&self.underlying)
            {
                return Err(CreditError::ParameterOutOfRange(format!(
                    "close path {} must lead from {} to {}",
                    index, token, self.underlying
                )));
            }
            let amount_in = ctx
                .ledger
                .balance_of(&token, &account)
                .saturating_sub(self.params.dust);
            if amount_in.is_positive() {
                self.sell(ctx, &account, amount_in, close_path.amount_out_min, path)?;
            }
        }

        let remaining_funds = self.settle(ctx, id, owner, to)?;

        info!(%owner, %to, %remaining_funds, "credit account closed");
        ctx.events.push(CreditEvent::AccountClosed {
            owner: owner.clone(),
            to: to.clone(),
            remaining_funds,
        });
        Ok(remaining_funds)
    }

    /// Liquidate an unhealthy position of `borrower`.
    ///
    /// The liquidator pays the pool and the borrower's surplus and receives
    /// every holding of the account at `to`. With `sell_collateral` the
    /// holdings are first converted into the underlying through the default
    /// router and the account's own underlying is spent before the
    /// liquidator's wallet.
    pub fn liquidate_credit_account(
        &mut self,
        ctx: &mut CreditContext<'_>,
        liquidator: &Address,
        borrower: &Address,
        to: &Address,
        sell_collateral: bool,
    ) -> Result<Decimal, CreditError> {
        let id = self.credit_account_of(borrower)?;
        let account = in_use(ctx.factory, id)?.clone();
        let index_now = ctx.pool.calc_linear_cumulative_index(ctx.now);
        let debt = account.borrowed_amount_with_interest(index_now);

        let health_factor = self.filter.calc_credit_account_health_factor(
            &*ctx.ledger,
            ctx.oracle,
            &account,
            debt,
            ctx.now,
        )?;
        let threshold = self.params.liquidation_threshold_bps;
        if health_factor >= threshold {
            return Err(CreditError::HealthFactorSufficient {
                health_factor,
                threshold,
            });
        }
        let total_value = self
            .filter
            .calc_total_value(&*ctx.ledger, ctx.oracle, &account, ctx.now)?;
        let payments = self.calc_close_payments(total_value, true, account.borrowed_amount, debt);

        self.credit_accounts.remove(borrower);
        self.filter.clear_enabled_tokens(&self.address, id)?;

        let mut account_funds = Decimal::zero();
        if sell_collateral {
            self.sell_holdings(ctx, &account.address)?;
            account_funds = ctx
                .ledger
                .balance_of(&self.underlying, &account.address)
                .saturating_sub(self.params.dust);
        }

        let pool_address = ctx.pool.address().clone();
        self.pay(
            ctx,
            &account.address,
            &mut account_funds,
            liquidator,
            &pool_address,
            payments.amount_to_pool,
        )?;
        ctx.pool.repay_credit_account(
            &mut *ctx.ledger,
            ctx.events,
            &self.address,
            account.borrowed_amount,
            payments.profit,
            ctx.now,
        )?;
        self.pay(
            ctx,
            &account.address,
            &mut account_funds,
            liquidator,
            borrower,
            payments.remaining_funds,
        )?;

        self.sweep(&mut *ctx.ledger, &account.address, to)?;
        ctx.factory.release(id)?;

        info!(
            %borrower,
            %liquidator,
            health_factor,
            %total_value,
            amount_to_pool = %payments.amount_to_pool,
            remaining_funds = %payments.remaining_funds,
            "credit account liquidated"
        );
        ctx.events.push(CreditEvent::AccountLiquidated {
            owner: borrower.clone(),
            liquidator: liquidator.clone(),
            remaining_funds: payments.remaining_funds,
        });
        Ok(payments.remaining_funds)
    }

    /// Split `total_value` between the pool and the borrower.
    pub fn calc_close_payments(
        &self,
        total_value: Decimal,
        is_liquidated: bool,
        borrowed_amount: Decimal,
        borrowed_amount_with_interest: Decimal,
    ) -> ClosePayments {
        let mut amount_to_pool = self.amount_owed(borrowed_amount, borrowed_amount_with_interest);

        let total_funds = if is_liquidated {
            amount_to_pool += percent_of(total_value, self.params.fee_liquidation_bps);
            percent_of(total_value, self.params.liquidation_discount_bps)
        } else {
            total_value
        };

        if total_funds >= amount_to_pool {
            ClosePayments {
                amount_to_pool,
                remaining_funds: total_funds - amount_to_pool,
                profit: amount_to_pool - borrowed_amount_with_interest,
            }
        } else {
            ClosePayments {
                amount_to_pool: total_funds,
                remaining_funds: Decimal::zero(),
                profit: total_funds - borrowed_amount_with_interest,
            }
        }
    }

    /// Principal plus interest owed by `borrower` at the view's time.
    pub fn borrowed_amount_with_interest(
        &self,
        view: &CreditView<'_>,
        borrower: &Address,
    ) -> Result<Decimal, CreditError> {
        let account = self.open_account(view.factory, borrower)?;
        Ok(account.borrowed_amount_with_interest(view.pool.calc_linear_cumulative_index(view.now)))
    }

    /// Health factor of `borrower`'s position in basis points.
    pub fn health_factor(&self, view: &CreditView<'_>, borrower: &Address) -> Result<u64, CreditError> {
        let account = self.open_account(view.factory, borrower)?;
        let debt =
            account.borrowed_amount_with_interest(view.pool.calc_linear_cumulative_index(view.now));
        self.filter
            .calc_credit_account_health_factor(view.ledger, view.oracle, account, debt, view.now)
    }

    /// Debt with interest plus the pool's cut of the interest.
    fn amount_owed(&self, borrowed_amount: Decimal, borrowed_amount_with_interest: Decimal) -> Decimal {
        let interest = borrowed_amount_with_interest.saturating_sub(borrowed_amount);
        borrowed_amount_with_interest + percent_of(interest, self.params.fee_interest_bps)
    }

    fn open_account<'f>(
        &self,
        factory: &'f AccountFactory,
        borrower: &Address,
    ) -> Result<&'f CreditAccount, CreditError> {
        let id = self.credit_account_of(borrower)?;
        factory
            .get(id)
            .filter(|account| account.is_in_use())
            .ok_or_else(|| CreditError::NoOpenAccount(borrower.clone()))
    }

    /// Pay the pool from the account's underlying, settle, sweep and release.
    fn settle(
        &mut self,
        ctx: &mut CreditContext<'_>,
        id: AccountId,
        owner: &Address,
        to: &Address,
    ) -> Result<Decimal, CreditError> {
        let account = in_use(ctx.factory, id)?.clone();
        let index_now = ctx.pool.calc_linear_cumulative_index(ctx.now);
        let debt = account.borrowed_amount_with_interest(index_now);
        let funds = ctx
            .ledger
            .balance_of(&self.underlying, &account.address)
            .saturating_sub(self.params.dust);
        let required = self.amount_owed(account.borrowed_amount, debt);
        if funds < required {
            return Err(CreditError::InsufficientFunds {
                required,
                available: funds,
            });
        }
        let payments = self.calc_close_payments(funds, false, account.borrowed_amount, debt);

        self.credit_accounts.remove(owner);
        self.filter.clear_enabled_tokens(&self.address, id)?;

        let pool_address = ctx.pool.address().clone();
        ctx.ledger.transfer(
            &self.underlying,
            &account.address,
            &pool_address,
            payments.amount_to_pool,
        )?;
        ctx.pool.repay_credit_account(
            &mut *ctx.ledger,
            ctx.events,
            &self.address,
            account.borrowed_amount,
            payments.profit,
            ctx.now,
        )?;
        self.sweep(&mut *ctx.ledger, &account.address, to)?;
        ctx.factory.release(id)?;
        Ok(payments.remaining_funds)
    }

    /// Pay `amount` to `to`, spending the account's funds before the payer's wallet.
    fn pay(
        &self,
        ctx: &mut CreditContext<'_>,
        account: &Address,
        account_funds: &mut Decimal,
        payer: &Address,
        to: &Address,
        amount: Decimal,
    ) -> Result<(), CreditError> {
        let from_account = (*account_funds).min(amount);
        if from_account.is_positive() {
            ctx.ledger
                .transfer(&self.underlying, account, to, from_account)?;
            *account_funds -= from_account;
        }
        let from_payer = amount - from_account;
        if from_payer.is_positive() {
            ctx.ledger
                .transfer_from(&self.underlying, &self.address, payer, to, from_payer)?;
        }
        Ok(())
    }

    /// Sell every non-underlying holding above dust through the default router.
    fn sell_holdings(&self, ctx: &mut CreditContext<'_>, account: &Address) -> Result<(), CreditError> {
        for index in 1..self.filter.allowed_tokens_count() {
            let Some(allowed) = self.filter.allowed_token(index) else {
                continue;
            };
            let amount_in = ctx
                .ledger
                .balance_of(&allowed.token, account)
                .saturating_sub(self.params.dust);
            if amount_in.is_positive() {
                let path = [allowed.token.clone(), self.underlying.clone()];
                self.sell(ctx, account, amount_in, Decimal::zero(), &path)?;
            }
        }
        Ok(())
    }

    /// Swap from the account through the default router, back into the account.
    fn sell(
        &self,
        ctx: &mut CreditContext<'_>,
        account: &Address,
        amount_in: Decimal,
        amount_out_min: Decimal,
        path: &[TokenId],
    ) -> Result<Decimal, CreditError> {
        let router_address = self
            .params
            .default_router
            .as_ref()
            .ok_or_else(|| CreditError::Router("no default router configured".to_string()))?;
        let router = self.router(ctx.routers, router_address)?;
        provide_allowance(&mut *ctx.ledger, account, router_address, &path[0], amount_in)?;
        let amount_out = router.swap_exact_tokens_for_tokens(
            &mut *ctx.ledger,
            account,
            amount_in,
            amount_out_min,
            path,
            account,
            ctx.now,
        )?;
        debug!(%account, token = %path[0], %amount_in, %amount_out, "holding converted");
        Ok(amount_out)
    }

    /// Move every allowed holding above dust from the account to `to`.
    fn sweep(
        &self,
        ledger: &mut dyn FungibleAsset,
        account: &Address,
        to: &Address,
    ) -> Result<(), CreditError> {
        for index in 0..self.filter.allowed_tokens_count() {
            let Some(allowed) = self.filter.allowed_token(index) else {
                continue;
            };
            let amount = ledger
                .balance_of(&allowed.token, account)
                .saturating_sub(self.params.dust);
            if amount.is_positive() {
                ledger.transfer(&allowed.token, account, to, amount)?;
            }
        }
        Ok(())
    }

    fn ensure_contract(&self, contract: &Address) -> Result<(), CreditError> {
        if !self.allowed_contracts.contains(contract) {
            return Err(CreditError::Unauthorized(format!(
                "{} is not an allowed contract",
                contract
            )));
        }
        Ok(())
    }

    fn router(
        &self,
        routers: &BTreeMap<Address, Arc<dyn SwapRouter>>,
        address: &Address,
    ) -> Result<Arc<dyn SwapRouter>, CreditError> {
        self.ensure_contract(address)?;
        routers
            .get(address)
            .cloned()
            .ok_or_else(|| CreditError::Unauthorized(format!("no router deployed at {}", address)))
    }

    /// Every token on a trade path other than the underlying must be whitelisted.
    fn check_path(&self, path: &[TokenId]) -> Result<(), CreditError> {
        if path.len() < 2 {
            return Err(CreditError::ParameterOutOfRange(format!(
                "swap path needs at least two tokens, got {}",
                path.len()
            )));
        }
        match path
            .iter()
            .find(|token| **token != self.underlying && !self.filter.is_token_allowed(token))
        {
            Some(token) => Err(CreditError::TokenNotAllowed(token.clone())),
            None => Ok(()),
        }
    }
}

fn in_use(factory: &mut AccountFactory, id: AccountId) -> Result<&mut CreditAccount, CreditError> {
    factory
        .get_mut(id)
        .ok_or_else(|| CreditError::ParameterOutOfRange(format!("account {} is not in use", id)))
}

/// Approve `spender` on `token` held by `owner` when the current allowance falls short.
fn provide_allowance(
    ledger: &mut dyn FungibleAsset,
    owner: &Address,
    spender: &Address,
    token: &TokenId,
    amount: Decimal,
) -> Result<(), CreditError> {
    if ledger.allowance(token, owner, spender) < amount {
        ledger.approve(token, owner, spender, Decimal::MAX)?;
    }
    Ok(())
}
