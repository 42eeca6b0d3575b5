//! Transaction boundary around the whole protocol.
//!
//! Each entry point runs against a draft copy of the system and replaces the
//! live state only when it succeeds, so a failed call leaves balances,
//! positions and the event log exactly as they were.

use super::clock::Clock;
use crate::config::Config;
use crate::domain::{AccountId, Address, CreditEvent, Decimal, EventRecord, TimeMs, TokenId, BPS};
use crate::engine::{
    AccountFactory, ClosePath, CreditAccount, CreditContext, CreditFilter, CreditManager,
    CreditManagerParams, CreditView, PoolService, TokenHolding,
};
use crate::error::CreditError;
use crate::ledger::TokenLedger;
use crate::oracle::{PriceFeed, PriceOracle};
use crate::swap::SwapRouter;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// One pool, its credit managers, and the ledger they share.
#[derive(Debug, Clone)]
pub struct CreditSystem {
    ledger: TokenLedger,
    oracle: PriceOracle,
    pool: PoolService,
    factory: AccountFactory,
    managers: Vec<CreditManager>,
    routers: BTreeMap<Address, Arc<dyn SwapRouter>>,
    clock: Arc<dyn Clock>,
    events: Vec<EventRecord>,
}

impl CreditSystem {
    pub fn new(config: &Config, clock: Arc<dyn Clock>) -> Result<Self, CreditError> {
        let pool = PoolService::new(
            config.underlying_token.clone(),
            config.share_token.clone(),
            config.treasury.clone(),
            Arc::new(config.interest_model),
            config.pool,
            clock.now(),
        );
        let mut ledger = TokenLedger::new();
        ledger.register_minter(pool.share_token(), pool.address())?;
        let factory = AccountFactory::new(Address::derive(
            "account-factory",
            pool.address().as_str().as_bytes(),
        ));

        info!(
            pool = %pool.address(),
            underlying = %config.underlying_token,
            share_token = %config.share_token,
            "credit system initialised"
        );
        Ok(Self {
            ledger,
            oracle: PriceOracle::new(config.oracle_staleness_ms),
            pool,
            factory,
            managers: Vec::new(),
            routers: BTreeMap::new(),
            clock,
            events: Vec::new(),
        })
    }

    pub fn now(&self) -> TimeMs {
        self.clock.now()
    }

    pub fn ledger(&self) -> &TokenLedger {
        &self.ledger
    }

    /// Wallet-side access to the ledger: funding, approvals, plain transfers.
    pub fn ledger_mut(&mut self) -> &mut TokenLedger {
        &mut self.ledger
    }

    pub fn pool(&self) -> &PoolService {
        &self.pool
    }

    pub fn factory(&self) -> &AccountFactory {
        &self.factory
    }

    pub fn oracle(&self) -> &PriceOracle {
        &self.oracle
    }

    pub fn managers(&self) -> &[CreditManager] {
        &self.managers
    }

    pub fn manager(&self, address: &Address) -> Result<&CreditManager, CreditError> {
        let index = self.manager_index(address)?;
        Ok(&self.managers[index])
    }

    /// Every event committed so far, oldest first.
    pub fn events(&self) -> &[EventRecord] {
        &self.events
    }

    pub fn add_price_feed(
        &mut self,
        tokens: &[TokenId],
        feeds: Vec<Arc<dyn PriceFeed>>,
    ) -> Result<(), CreditError> {
        self.transact("add_price_feed", |system, _, events| {
            system.oracle.add_price_feed(tokens, feeds)?;
            events.extend(
                tokens
                    .iter()
                    .map(|token| CreditEvent::PriceFeedAdded { token: token.clone() }),
            );
            Ok(())
        })
    }

    /// Deploy a router; managers still have to allow it before use.
    pub fn add_router(&mut self, router: Arc<dyn SwapRouter>) -> Address {
        let address = router.address().clone();
        info!(router = %address, "router deployed");
        self.routers.insert(address.clone(), router);
        address
    }

    /// Create a credit manager with its own filter and connect it to the pool.
    pub fn add_credit_manager(&mut self, params: CreditManagerParams) -> Result<Address, CreditError> {
        self.transact("add_credit_manager", |system, _, events| {
            let mut seed = system.pool.address().as_str().as_bytes().to_vec();
            seed.extend_from_slice(&(system.managers.len() as u32).to_le_bytes());
            let address = Address::derive("credit-manager", &seed);

            let filter = CreditFilter::new(system.pool.underlying().clone(), BPS);
            let mut manager = CreditManager::new(address.clone(), filter, params)?;
            if let Some(router) = manager.params().default_router.clone() {
                system.ensure_router(&router)?;
                manager.allow_contract(events, &router);
            }
            system.pool.connect_credit_manager(events, &address)?;
            system.managers.push(manager);
            Ok(address)
        })
    }

    pub fn allow_token(
        &mut self,
        manager: &Address,
        token: &TokenId,
        risk_weight_bps: u64,
    ) -> Result<(), CreditError> {
        self.transact("allow_token", |system, _, events| {
            let index = system.manager_index(manager)?;
            system.managers[index].allow_token(&system.oracle, events, token, risk_weight_bps)
        })
    }

    pub fn allow_contract(&mut self, manager: &Address, contract: &Address) -> Result<(), CreditError> {
        self.transact("allow_contract", |system, _, events| {
            let index = system.manager_index(manager)?;
            system.ensure_router(contract)?;
            system.managers[index].allow_contract(events, contract);
            Ok(())
        })
    }

    pub fn add_liquidity(
        &mut self,
        caller: &Address,
        amount: Decimal,
        on_behalf_of: &Address,
        referral_code: u32,
    ) -> Result<Decimal, CreditError> {
        self.transact("add_liquidity", |system, now, events| {
            system.pool.add_liquidity(
                &mut system.ledger,
                events,
                caller,
                amount,
                on_behalf_of,
                referral_code,
                now,
            )
        })
    }

    pub fn remove_liquidity(
        &mut self,
        caller: &Address,
        shares: Decimal,
        to: &Address,
    ) -> Result<Decimal, CreditError> {
        self.transact("remove_liquidity", |system, now, events| {
            system
                .pool
                .remove_liquidity(&mut system.ledger, events, caller, shares, to, now)
        })
    }

    pub fn open_credit_account(
        &mut self,
        manager: &Address,
        caller: &Address,
        amount: Decimal,
        on_behalf_of: &Address,
        leverage: u64,
        referral_code: u32,
    ) -> Result<AccountId, CreditError> {
        self.manager_step("open_credit_account", manager, |m, ctx| {
            m.open_credit_account(ctx, caller, amount, on_behalf_of, leverage, referral_code)
        })
    }

    pub fn approve(
        &mut self,
        manager: &Address,
        owner: &Address,
        router: &Address,
        token: &TokenId,
    ) -> Result<(), CreditError> {
        self.manager_step("approve", manager, |m, ctx| {
            m.approve(ctx, owner, router, token)
        })
    }

    pub fn execute_order(
        &mut self,
        manager: &Address,
        owner: &Address,
        router: &Address,
        amount_in: Decimal,
        amount_out_min: Decimal,
        path: &[TokenId],
    ) -> Result<Decimal, CreditError> {
        self.manager_step("execute_order", manager, |m, ctx| {
            m.execute_order(ctx, owner, router, amount_in, amount_out_min, path)
        })
    }

    pub fn add_collateral(
        &mut self,
        manager: &Address,
        caller: &Address,
        on_behalf_of: &Address,
        token: &TokenId,
        amount: Decimal,
    ) -> Result<(), CreditError> {
        self.manager_step("add_collateral", manager, |m, ctx| {
            m.add_collateral(ctx, caller, on_behalf_of, token, amount)
        })
    }

    pub fn increase_borrowed_amount(
        &mut self,
        manager: &Address,
        owner: &Address,
        amount: Decimal,
    ) -> Result<(), CreditError> {
        self.manager_step("increase_borrowed_amount", manager, |m, ctx| {
            m.increase_borrowed_amount(ctx, owner, amount)
        })
    }

    pub fn transfer_account_ownership(
        &mut self,
        manager: &Address,
        owner: &Address,
        new_owner: &Address,
    ) -> Result<(), CreditError> {
        self.manager_step("transfer_account_ownership", manager, |m, ctx| {
            m.transfer_account_ownership(ctx.factory, ctx.events, owner, new_owner)
        })
    }

    pub fn repay_credit_account(
        &mut self,
        manager: &Address,
        owner: &Address,
        to: &Address,
    ) -> Result<Decimal, CreditError> {
        self.manager_step("repay_credit_account", manager, |m, ctx| {
            m.repay_credit_account(ctx, owner, to)
        })
    }

    pub fn close_credit_account(
        &mut self,
        manager: &Address,
        owner: &Address,
        to: &Address,
        paths: &[ClosePath],
    ) -> Result<Decimal, CreditError> {
        self.manager_step("close_credit_account", manager, |m, ctx| {
            m.close_credit_account(ctx, owner, to, paths)
        })
    }

    pub fn liquidate_credit_account(
        &mut self,
        manager: &Address,
        liquidator: &Address,
        borrower: &Address,
        to: &Address,
        sell_collateral: bool,
    ) -> Result<Decimal, CreditError> {
        self.manager_step("liquidate_credit_account", manager, |m, ctx| {
            m.liquidate_credit_account(ctx, liquidator, borrower, to, sell_collateral)
        })
    }

    pub fn credit_account_of(
        &self,
        manager: &Address,
        borrower: &Address,
    ) -> Result<CreditAccount, CreditError> {
        let id = self.manager(manager)?.credit_account_of(borrower)?;
        self.factory
            .get(id)
            .cloned()
            .ok_or_else(|| CreditError::NoOpenAccount(borrower.clone()))
    }

    pub fn get_credit_account_token_by_id(
        &self,
        manager: &Address,
        borrower: &Address,
        index: usize,
    ) -> Result<TokenHolding, CreditError> {
        let account = self.credit_account_of(manager, borrower)?;
        self.manager(manager)?
            .filter()
            .get_credit_account_token_by_id(&self.ledger, &account, index)
    }

    /// Every allowed-token slot of `borrower`'s account, in index order.
    pub fn account_holdings(
        &self,
        manager: &Address,
        borrower: &Address,
    ) -> Result<Vec<TokenHolding>, CreditError> {
        let account = self.credit_account_of(manager, borrower)?;
        Ok(self.manager(manager)?.filter().holdings(&self.ledger, &account))
    }

    pub fn calc_credit_account_health_factor(
        &self,
        manager: &Address,
        borrower: &Address,
    ) -> Result<u64, CreditError> {
        self.manager(manager)?.health_factor(&self.view(), borrower)
    }

    pub fn borrowed_amount_with_interest(
        &self,
        manager: &Address,
        borrower: &Address,
    ) -> Result<Decimal, CreditError> {
        self.manager(manager)?
            .borrowed_amount_with_interest(&self.view(), borrower)
    }

    pub fn credit_managers_can_borrow(&self, manager: &Address) -> bool {
        self.pool.credit_managers_can_borrow(manager)
    }

    pub fn expected_liquidity(&self) -> Decimal {
        self.pool.expected_liquidity(self.now())
    }

    pub fn available_liquidity(&self) -> Decimal {
        self.pool.available_liquidity(&self.ledger)
    }

    pub fn share_rate(&self) -> Decimal {
        self.pool.share_rate(&self.ledger, self.now())
    }

    pub fn borrow_rate(&self) -> Decimal {
        self.pool.borrow_rate()
    }

    pub fn supply_rate(&self) -> Decimal {
        self.pool.supply_rate(&self.ledger, self.now())
    }

    fn view(&self) -> CreditView<'_> {
        CreditView {
            ledger: &self.ledger,
            pool: &self.pool,
            factory: &self.factory,
            oracle: &self.oracle,
            now: self.now(),
        }
    }

    fn manager_index(&self, address: &Address) -> Result<usize, CreditError> {
        self.managers
            .iter()
            .position(|m| m.address() == address)
            .ok_or_else(|| CreditError::Unauthorized(format!("{} is not a credit manager", address)))
    }

    fn ensure_router(&self, address: &Address) -> Result<(), CreditError> {
        if !self.routers.contains_key(address) {
            return Err(CreditError::Unauthorized(format!(
                "no router deployed at {}",
                address
            )));
        }
        Ok(())
    }

    /// Run `f` on a draft and commit the draft with its events only on success.
    fn transact<R>(
        &mut self,
        operation: &'static str,
        f: impl FnOnce(&mut Self, TimeMs, &mut Vec<CreditEvent>) -> Result<R, CreditError>,
    ) -> Result<R, CreditError> {
        let now = self.clock.now();
        let log = std::mem::take(&mut self.events);
        let mut draft = self.clone();
        self.events = log;

        let mut emitted = Vec::new();
        match f(&mut draft, now, &mut emitted) {
            Ok(value) => {
                draft.events = std::mem::take(&mut self.events);
                draft.events.extend(
                    emitted
                        .into_iter()
                        .map(|event| EventRecord { time_ms: now, event }),
                );
                *self = draft;
                Ok(value)
            }
            Err(err) => {
                warn!(operation, error = %err, "operation reverted");
                Err(err)
            }
        }
    }

    fn manager_step<R>(
        &mut self,
        operation: &'static str,
        manager: &Address,
        f: impl FnOnce(&mut CreditManager, &mut CreditContext<'_>) -> Result<R, CreditError>,
    ) -> Result<R, CreditError> {
        self.transact(operation, |system, now, events| {
            let index = system.manager_index(manager)?;
            let CreditSystem {
                ledger,
                oracle,
                pool,
                factory,
                managers,
                routers,
                ..
            } = system;
            let mut ctx = CreditContext {
                ledger,
                pool,
                factory,
                oracle,
                routers,
                events,
                now,
            };
            f(&mut managers[index], &mut ctx)
        })
    }
}
