//! Lending reserve: holds the underlying, mints share tokens, lends to credit managers.

use super::interest::InterestRateModel;
use crate::domain::{Address, CreditEvent, Decimal, TimeMs, TokenId, BPS, MS_PER_YEAR};
use crate::error::CreditError;
use crate::ledger::FungibleAsset;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Decimal places kept on the cumulative interest index.
pub(crate) const INDEX_DP: u32 = 18;

/// Tunables of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolParams {
    /// Share of every withdrawal paid to the treasury.
    pub withdraw_fee_bps: u64,
    /// Deposits may not push pool value above this.
    pub expected_liquidity_limit: Option<Decimal>,
}

/// Interest-bearing liquidity pool.
///
/// Pool value ("expected liquidity") is the idle balance plus everything lent
/// out plus interest accrued on it. Borrowed funds stay in pool value as a
/// liability of the credit managers.
#[derive(Debug, Clone)]
pub struct PoolService {
    address: Address,
    underlying: TokenId,
    share_token: TokenId,
    treasury: Address,
    interest_model: Arc<dyn InterestRateModel>,
    params: PoolParams,
    credit_managers: BTreeSet<Address>,

    total_borrowed: Decimal,
    expected_liquidity_lu: Decimal,
    cumulative_index_lu: Decimal,
    borrow_rate: Decimal,
    timestamp_lu: TimeMs,
}

impl PoolService {
    pub fn new(
        underlying: TokenId,
        share_token: TokenId,
        treasury: Address,
        interest_model: Arc<dyn InterestRateModel>,
        params: PoolParams,
        now: TimeMs,
    ) -> Self {
        let address = Address::derive("pool", underlying.as_str().as_bytes());
        let borrow_rate = interest_model.borrow_rate(Decimal::zero(), Decimal::zero());
        Self {
            address,
            underlying,
            share_token,
            treasury,
            interest_model,
            params,
            credit_managers: BTreeSet::new(),
            total_borrowed: Decimal::zero(),
            expected_liquidity_lu: Decimal::zero(),
            cumulative_index_lu: Decimal::one(),
            borrow_rate,
            timestamp_lu: now,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn underlying(&self) -> &TokenId {
        &self.underlying
    }

    pub fn share_token(&self) -> &TokenId {
        &self.share_token
    }

    pub fn treasury(&self) -> &Address {
        &self.treasury
    }

    pub fn total_borrowed(&self) -> Decimal {
        self.total_borrowed
    }

    /// Annual borrow rate fixed at the last update.
    pub fn borrow_rate(&self) -> Decimal {
        self.borrow_rate
    }

    /// Annual rate earned by share holders at the current utilization.
    pub fn supply_rate(&self, ledger: &dyn FungibleAsset, now: TimeMs) -> Decimal {
        self.interest_model
            .supply_rate(self.expected_liquidity(now), self.available_liquidity(ledger))
    }

    /// Interest index at `now`, advanced linearly from the last update.
    pub fn calc_linear_cumulative_index(&self, now: TimeMs) -> Decimal {
        let elapsed = Decimal::from_units(now.since(self.timestamp_lu) as u64);
        let year = Decimal::from_units(MS_PER_YEAR as u64);
        let growth = Decimal::one() + self.borrow_rate * elapsed / year;
        (self.cumulative_index_lu * growth).round_dp(INDEX_DP)
    }

    /// Pool value at `now`, including interest accrued since the last update.
    pub fn expected_liquidity(&self, now: TimeMs) -> Decimal {
        let index_now = self.calc_linear_cumulative_index(now);
        let accrued = self.total_borrowed * (index_now / self.cumulative_index_lu - Decimal::one());
        self.expected_liquidity_lu + accrued
    }

    /// Idle underlying held by the pool.
    pub fn available_liquidity(&self, ledger: &dyn FungibleAsset) -> Decimal {
        ledger.balance_of(&self.underlying, &self.address)
    }

    /// Underlying per share; 1 while no shares exist.
    pub fn share_rate(&self, ledger: &dyn FungibleAsset, now: TimeMs) -> Decimal {
        let supply = ledger.total_supply(&self.share_token);
        if supply.is_zero() {
            return Decimal::one();
        }
        self.expected_liquidity(now) / supply
    }

    /// Shares worth `amount` of underlying, rounded down.
    pub fn to_shares(&self, ledger: &dyn FungibleAsset, amount: Decimal, now: TimeMs) -> Decimal {
        let supply = ledger.total_supply(&self.share_token);
        let value = self.expected_liquidity(now);
        if supply.is_zero() || !value.is_positive() {
            return amount.floor();
        }
        (amount * supply / value).floor()
    }

    /// Underlying worth `shares`, rounded down.
    pub fn from_shares(&self, ledger: &dyn FungibleAsset, shares: Decimal, now: TimeMs) -> Decimal {
        let supply = ledger.total_supply(&self.share_token);
        if supply.is_zero() {
            return shares.floor();
        }
        (shares * self.expected_liquidity(now) / supply).floor()
    }

    pub fn credit_managers_can_borrow(&self, manager: &Address) -> bool {
        self.credit_managers.contains(manager)
    }

    /// Authorize `manager` to draw credit.
    pub fn connect_credit_manager(
        &mut self,
        events: &mut Vec<CreditEvent>,
        manager: &Address,
    ) -> Result<(), CreditError> {
        if !self.credit_managers.insert(manager.clone()) {
            return Err(CreditError::ParameterOutOfRange(format!(
                "credit manager {} already connected",
                manager
            )));
        }
        tracing::info!(pool = %self.address, %manager, "credit manager connected");
        events.push(CreditEvent::CreditManagerConnected {
            manager: manager.clone(),
        });
        Ok(())
    }

    /// Deposit `amount` of underlying from `caller`, minting shares to `on_behalf_of`.
    ///
    /// # Returns
    /// Number of shares minted.
    #[allow(clippy::too_many_arguments)]
    pub fn add_liquidity(
        &mut self,
        ledger: &mut dyn FungibleAsset,
        events: &mut Vec<CreditEvent>,
        caller: &Address,
        amount: Decimal,
        on_behalf_of: &Address,
        referral_code: u32,
        now: TimeMs,
    ) -> Result<Decimal, CreditError> {
        self.accrue(now);
        if !amount.is_positive() {
            return Err(CreditError::ParameterOutOfRange(
                "deposit amount must be positive".to_string(),
            ));
        }
        if let Some(limit) = self.params.expected_liquidity_limit {
            if self.expected_liquidity_lu + amount > limit {
                return Err(CreditError::ParameterOutOfRange(format!(
                    "deposit would exceed expected liquidity limit {}",
                    limit
                )));
            }
        }

        let shares = self.to_shares(ledger, amount, now);
        if !shares.is_positive() {
            return Err(CreditError::ParameterOutOfRange(
                "deposit too small to mint a share".to_string(),
            ));
        }

        ledger.transfer_from(&self.underlying, &self.address, caller, &self.address, amount)?;
        ledger.mint(&self.address, &self.share_token, on_behalf_of, shares)?;
        self.expected_liquidity_lu += amount;
        self.update_borrow_rate(&*ledger);

        tracing::info!(%caller, %on_behalf_of, %amount, %shares, "liquidity added");
        events.push(CreditEvent::LiquidityAdded {
            sender: caller.clone(),
            on_behalf_of: on_behalf_of.clone(),
            amount,
            shares,
            referral_code,
        });
        Ok(shares)
    }

    /// Burn `shares` of `caller` and pay their value, minus the withdraw fee, to `to`.
    ///
    /// # Returns
    /// Amount of underlying sent to `to`.
    pub fn remove_liquidity(
        &mut self,
        ledger: &mut dyn FungibleAsset,
        events: &mut Vec<CreditEvent>,
        caller: &Address,
        shares: Decimal,
        to: &Address,
        now: TimeMs,
    ) -> Result<Decimal, CreditError> {
        self.accrue(now);
        if !shares.is_positive() {
            return Err(CreditError::ParameterOutOfRange(
                "share amount must be positive".to_string(),
            ));
        }

        let amount = self.from_shares(ledger, shares, now);
        let available = self.available_liquidity(&*ledger);
        if available < amount {
            return Err(CreditError::InsufficientPoolLiquidity {
                requested: amount,
                available,
            });
        }
        let fee = percent_of(amount, self.params.withdraw_fee_bps);
        let sent = amount - fee;

        ledger.burn(&self.address, &self.share_token, caller, shares)?;
        ledger.transfer(&self.underlying, &self.address, to, sent)?;
        if fee.is_positive() {
            ledger.transfer(&self.underlying, &self.address, &self.treasury, fee)?;
        }
        self.expected_liquidity_lu -= amount;
        self.update_borrow_rate(&*ledger);

        tracing::info!(%caller, %to, %amount, %shares, %fee, "liquidity removed");
        events.push(CreditEvent::LiquidityRemoved {
            sender: caller.clone(),
            to: to.clone(),
            amount: sent,
            shares,
            fee,
        });
        Ok(sent)
    }

    /// Lend `amount` to `account` on behalf of a connected credit manager.
    pub fn lend_credit_account(
        &mut self,
        ledger: &mut dyn FungibleAsset,
        events: &mut Vec<CreditEvent>,
        caller: &Address,
        amount: Decimal,
        account: &Address,
        now: TimeMs,
    ) -> Result<(), CreditError> {
        self.ensure_manager(caller)?;
        self.accrue(now);

        let available = self.available_liquidity(&*ledger);
        if available < amount {
            return Err(CreditError::ExceedsAvailableLiquidity {
                requested: amount,
                available,
            });
        }

        ledger.transfer(&self.underlying, &self.address, account, amount)?;
        self.total_borrowed += amount;
        self.update_borrow_rate(&*ledger);

        tracing::info!(manager = %caller, %account, %amount, "credit lent");
        events.push(CreditEvent::Borrow {
            manager: caller.clone(),
            account: account.clone(),
            amount,
        });
        Ok(())
    }

    /// Settle a loan after the manager has already transferred the repayment.
    ///
    /// `profit` is what the pool received beyond principal plus interest. A
    /// negative profit is a loss: treasury shares worth the loss are burned and
    /// whatever the treasury cannot absorb is reported as `UncoveredLoss`.
    #[allow(clippy::too_many_arguments)]
    pub fn repay_credit_account(
        &mut self,
        ledger: &mut dyn FungibleAsset,
        events: &mut Vec<CreditEvent>,
        caller: &Address,
        borrowed_amount: Decimal,
        profit: Decimal,
        now: TimeMs,
    ) -> Result<(), CreditError> {
        self.ensure_manager(caller)?;
        self.accrue(now);
        if borrowed_amount > self.total_borrowed {
            return Err(CreditError::ParameterOutOfRange(format!(
                "repaying {} but only {} is borrowed",
                borrowed_amount, self.total_borrowed
            )));
        }

        if profit.is_positive() {
            let shares = self.to_shares(&*ledger, profit, now);
            if shares.is_positive() {
                ledger.mint(&self.address, &self.share_token, &self.treasury, shares)?;
            }
            self.expected_liquidity_lu += profit;
        } else if profit.is_negative() {
            let loss = profit.abs();
            let wanted = self.to_shares(&*ledger, loss, now);
            let treasury_shares = ledger.balance_of(&self.share_token, &self.treasury);
            let burned = if treasury_shares < wanted {
                let uncovered = loss - self.from_shares(&*ledger, treasury_shares, now);
                tracing::warn!(manager = %caller, %loss, %uncovered, "loss not covered by treasury");
                events.push(CreditEvent::UncoveredLoss {
                    manager: caller.clone(),
                    loss: uncovered,
                });
                treasury_shares
            } else {
                wanted
            };
            if burned.is_positive() {
                ledger.burn(&self.address, &self.share_token, &self.treasury, burned)?;
            }
            self.expected_liquidity_lu -= loss;
        }

        self.total_borrowed -= borrowed_amount;
        self.update_borrow_rate(&*ledger);

        tracing::info!(manager = %caller, %borrowed_amount, %profit, "credit repaid");
        events.push(CreditEvent::Repay {
            manager: caller.clone(),
            borrowed_amount,
            profit,
        });
        Ok(())
    }

    fn ensure_manager(&self, caller: &Address) -> Result<(), CreditError> {
        if !self.credit_managers.contains(caller) {
            return Err(CreditError::Unauthorized(format!(
                "{} is not a connected credit manager",
                caller
            )));
        }
        Ok(())
    }

    /// Fold interest accrued since the last update into pool value.
    ///
    /// A second call at the same timestamp changes nothing.
    fn accrue(&mut self, now: TimeMs) {
        if now <= self.timestamp_lu {
            return;
        }
        let index_now = self.calc_linear_cumulative_index(now);
        self.expected_liquidity_lu = self.expected_liquidity(now);
        tracing::debug!(
            pool = %self.address,
            index = %index_now,
            expected_liquidity = %self.expected_liquidity_lu,
            "interest accrued"
        );
        self.cumulative_index_lu = index_now;
        self.timestamp_lu = now;
    }

    /// Re-derive the borrow rate from utilization after a balance change.
    fn update_borrow_rate(&mut self, ledger: &dyn FungibleAsset) {
        self.borrow_rate = self
            .interest_model
            .borrow_rate(self.expected_liquidity_lu, self.available_liquidity(ledger));
    }
}

/// `amount × bps / 10000`, rounded down to base units.
pub fn percent_of(amount: Decimal, bps: u64) -> Decimal {
    (amount * Decimal::from_units(bps) / Decimal::from_units(BPS)).floor()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::interest::LinearInterestRateModel;
    use crate::ledger::TokenLedger;

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    fn units(n: u64) -> Decimal {
        Decimal::from_units(n)
    }

    fn usdc() -> TokenId {
        TokenId::new("USDC")
    }

    fn lp() -> Address {
        Address::new("0xlp")
    }

    fn manager() -> Address {
        Address::new("0xmanager")
    }

    fn setup(params: PoolParams) -> (PoolService, TokenLedger, Vec<CreditEvent>) {
        let pool = PoolService::new(
            usdc(),
            TokenId::new("dUSDC"),
            Address::new("0xtreasury"),
            Arc::new(LinearInterestRateModel::default()),
            params,
            TimeMs::new(0),
        );
        let mut ledger = TokenLedger::new();
        ledger.register_minter(pool.share_token(), pool.address()).unwrap();
        ledger.mint(&lp(), &usdc(), &lp(), units(1_000_000)).unwrap();
        ledger
            .approve(&usdc(), &lp(), pool.address(), Decimal::MAX)
            .unwrap();
        (pool, ledger, Vec::new())
    }

    #[test]
    fn test_first_deposit_mints_one_to_one() {
        let (mut pool, mut ledger, mut events) = setup(PoolParams::default());
        let shares = pool
            .add_liquidity(&mut ledger, &mut events, &lp(), units(1000), &lp(), 0, TimeMs::new(0))
            .unwrap();

        assert_eq!(shares, units(1000));
        assert_eq!(ledger.balance_of(pool.share_token(), &lp()), units(1000));
        assert_eq!(pool.expected_liquidity(TimeMs::new(0)), units(1000));
        assert!(matches!(events[0], CreditEvent::LiquidityAdded { .. }));
    }

    #[test]
    fn test_deposit_without_allowance_fails() {
        let (mut pool, mut ledger, mut events) = setup(PoolParams::default());
        let stranger = Address::new("0xstranger");
        ledger.mint(&stranger, &usdc(), &stranger, units(10)).unwrap();

        let err = pool
            .add_liquidity(&mut ledger, &mut events, &stranger, units(10), &stranger, 0, TimeMs::new(0))
            .unwrap_err();
        assert!(matches!(err, CreditError::InsufficientAllowance { .. }));
    }

    #[test]
    fn test_unconnected_manager_cannot_borrow() {
        let (mut pool, mut ledger, mut events) = setup(PoolParams::default());
        pool.add_liquidity(&mut ledger, &mut events, &lp(), units(1000), &lp(), 0, TimeMs::new(0))
            .unwrap();

        let err = pool
            .lend_credit_account(
                &mut ledger,
                &mut events,
                &manager(),
                units(10),
                &Address::new("0xaccount"),
                TimeMs::new(0),
            )
            .unwrap_err();
        assert!(matches!(err, CreditError::Unauthorized(_)));
        assert!(!pool.credit_managers_can_borrow(&manager()));
    }

    #[test]
    fn test_lend_beyond_idle_balance_fails() {
        let (mut pool, mut ledger, mut events) = setup(PoolParams::default());
        pool.connect_credit_manager(&mut events, &manager()).unwrap();
        pool.add_liquidity(&mut ledger, &mut events, &lp(), units(100), &lp(), 0, TimeMs::new(0))
            .unwrap();

        let err = pool
            .lend_credit_account(
                &mut ledger,
                &mut events,
                &manager(),
                units(101),
                &Address::new("0xaccount"),
                TimeMs::new(0),
            )
            .unwrap_err();
        assert_eq!(
            err,
            CreditError::ExceedsAvailableLiquidity {
                requested: units(101),
                available: units(100),
            }
        );
    }

    #[test]
    fn test_interest_accrues_into_pool_value() {
        let (mut pool, mut ledger, mut events) = setup(PoolParams::default());
        let account = Address::new("0xaccount");
        pool.connect_credit_manager(&mut events, &manager()).unwrap();
        pool.add_liquidity(&mut ledger, &mut events, &lp(), units(1000), &lp(), 0, TimeMs::new(0))
            .unwrap();
        pool.lend_credit_account(&mut ledger, &mut events, &manager(), units(500), &account, TimeMs::new(0))
            .unwrap();

        // 50% utilization -> 2.5% a year on 500 borrowed.
        assert_eq!(pool.borrow_rate(), Decimal::from_str_canonical("0.025").unwrap());
        let one_year = TimeMs::new(MS_PER_YEAR);
        assert_eq!(
            pool.calc_linear_cumulative_index(one_year),
            Decimal::from_str_canonical("1.025").unwrap()
        );
        assert_eq!(
            pool.expected_liquidity(one_year),
            Decimal::from_str_canonical("1012.5").unwrap()
        );
    }

    #[test]
    fn test_accrual_is_idempotent_within_a_step() {
        let (mut pool, mut ledger, mut events) = setup(PoolParams::default());
        let account = Address::new("0xaccount");
        pool.connect_credit_manager(&mut events, &manager()).unwrap();
        pool.add_liquidity(&mut ledger, &mut events, &lp(), units(1000), &lp(), 0, TimeMs::new(0))
            .unwrap();
        pool.lend_credit_account(&mut ledger, &mut events, &manager(), units(500), &account, TimeMs::new(0))
            .unwrap();

        let later = TimeMs::new(30 * DAY_MS);
        pool.accrue(later);
        let once = (pool.expected_liquidity(later), pool.calc_linear_cumulative_index(later));
        pool.accrue(later);
        let twice = (pool.expected_liquidity(later), pool.calc_linear_cumulative_index(later));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_remove_liquidity_blocked_by_outstanding_loans() {
        let (mut pool, mut ledger, mut events) = setup(PoolParams::default());
        let account = Address::new("0xaccount");
        pool.connect_credit_manager(&mut events, &manager()).unwrap();
        pool.add_liquidity(&mut ledger, &mut events, &lp(), units(1000), &lp(), 0, TimeMs::new(0))
            .unwrap();
        pool.lend_credit_account(&mut ledger, &mut events, &manager(), units(900), &account, TimeMs::new(0))
            .unwrap();

        let err = pool
            .remove_liquidity(&mut ledger, &mut events, &lp(), units(500), &lp(), TimeMs::new(0))
            .unwrap_err();
        assert_eq!(
            err,
            CreditError::InsufficientPoolLiquidity {
                requested: units(500),
                available: units(100),
            }
        );
    }

    #[test]
    fn test_withdraw_fee_goes_to_treasury() {
        let params = PoolParams {
            withdraw_fee_bps: 100,
            expected_liquidity_limit: None,
        };
        let (mut pool, mut ledger, mut events) = setup(params);
        pool.add_liquidity(&mut ledger, &mut events, &lp(), units(1000), &lp(), 0, TimeMs::new(0))
            .unwrap();
        let sent = pool
            .remove_liquidity(&mut ledger, &mut events, &lp(), units(500), &lp(), TimeMs::new(0))
            .unwrap();

        assert_eq!(sent, units(495));
        assert_eq!(ledger.balance_of(&usdc(), pool.treasury()), units(5));
        assert_eq!(pool.expected_liquidity(TimeMs::new(0)), units(500));
    }

    #[test]
    fn test_expected_liquidity_limit() {
        let params = PoolParams {
            withdraw_fee_bps: 0,
            expected_liquidity_limit: Some(units(500)),
        };
        let (mut pool, mut ledger, mut events) = setup(params);
        let err = pool
            .add_liquidity(&mut ledger, &mut events, &lp(), units(501), &lp(), 0, TimeMs::new(0))
            .unwrap_err();
        assert!(matches!(err, CreditError::ParameterOutOfRange(_)));
    }

    #[test]
    fn test_profit_mints_treasury_shares() {
        let (mut pool, mut ledger, mut events) = setup(PoolParams::default());
        let account = Address::new("0xaccount");
        pool.connect_credit_manager(&mut events, &manager()).unwrap();
        pool.add_liquidity(&mut ledger, &mut events, &lp(), units(1000), &lp(), 0, TimeMs::new(0))
            .unwrap();
        pool.lend_credit_account(&mut ledger, &mut events, &manager(), units(100), &account, TimeMs::new(0))
            .unwrap();

        // Account returns principal plus 10 of profit.
        ledger.mint(&account, &usdc(), &account, units(10)).unwrap();
        ledger.transfer(&usdc(), &account, pool.address(), units(110)).unwrap();
        pool.repay_credit_account(&mut ledger, &mut events, &manager(), units(100), units(10), TimeMs::new(0))
            .unwrap();

        assert_eq!(pool.total_borrowed(), Decimal::zero());
        assert_eq!(pool.expected_liquidity(TimeMs::new(0)), units(1010));
        assert_eq!(ledger.balance_of(pool.share_token(), pool.treasury()), units(10));
    }

    #[test]
    fn test_uncovered_loss_is_reported() {
        let (mut pool, mut ledger, mut events) = setup(PoolParams::default());
        let account = Address::new("0xaccount");
        pool.connect_credit_manager(&mut events, &manager()).unwrap();
        pool.add_liquidity(&mut ledger, &mut events, &lp(), units(1000), &lp(), 0, TimeMs::new(0))
            .unwrap();
        pool.lend_credit_account(&mut ledger, &mut events, &manager(), units(100), &account, TimeMs::new(0))
            .unwrap();

        ledger.transfer(&usdc(), &account, pool.address(), units(80)).unwrap();
        pool.repay_credit_account(&mut ledger, &mut events, &manager(), units(100), -units(20), TimeMs::new(0))
            .unwrap();

        assert_eq!(pool.expected_liquidity(TimeMs::new(0)), units(980));
        assert!(events.iter().any(|e| matches!(
            e,
            CreditEvent::UncoveredLoss { loss, .. } if *loss == units(20)
        )));
    }

    #[test]
    fn test_percent_of_rounds_down() {
        assert_eq!(percent_of(units(999), 100), units(9));
        assert_eq!(percent_of(units(1000), 9500), units(950));
    }
}
