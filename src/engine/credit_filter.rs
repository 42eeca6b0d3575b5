//! Collateral whitelist and valuation for one credit manager.

use super::account_factory::CreditAccount;
use crate::domain::{AccountId, Address, Decimal, TimeMs, TokenId, BPS};
use crate::error::CreditError;
use crate::ledger::FungibleAsset;
use crate::oracle::PriceOracle;
use std::collections::{BTreeMap, BTreeSet};

/// A whitelisted collateral token and the share of its value that counts as collateral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedToken {
    pub token: TokenId,
    pub risk_weight_bps: u64,
}

/// One slot of a credit account's holdings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHolding {
    pub token: TokenId,
    pub balance: Decimal,
    pub risk_weight_bps: u64,
    pub enabled: bool,
}

/// Risk engine: which tokens a position may hold and what they are worth.
///
/// Allowed tokens form an ordered array; index 0 is always the underlying.
/// Enumeration and valuation follow that order.
#[derive(Debug, Clone)]
pub struct CreditFilter {
    underlying: TokenId,
    manager: Option<Address>,
    allowed_tokens: Vec<AllowedToken>,
    enabled_tokens: BTreeMap<AccountId, BTreeSet<usize>>,
}

impl CreditFilter {
    pub fn new(underlying: TokenId, underlying_risk_weight_bps: u64) -> Self {
        Self {
            allowed_tokens: vec![AllowedToken {
                token: underlying.clone(),
                risk_weight_bps: underlying_risk_weight_bps,
            }],
            underlying,
            manager: None,
            enabled_tokens: BTreeMap::new(),
        }
    }

    pub fn underlying(&self) -> &TokenId {
        &self.underlying
    }

    pub fn credit_manager(&self) -> Option<&Address> {
        self.manager.as_ref()
    }

    /// Bind this filter to its single credit manager.
    pub fn connect_credit_manager(&mut self, manager: &Address) -> Result<(), CreditError> {
        if let Some(existing) = &self.manager {
            return Err(CreditError::Unauthorized(format!(
                "credit filter already bound to {}",
                existing
            )));
        }
        self.manager = Some(manager.clone());
        Ok(())
    }

    /// Whitelist `token` with the given risk weight, or update the weight of a listed token.
    ///
    /// # Returns
    /// The token's index in the allowed array.
    pub fn allow_token(
        &mut self,
        oracle: &PriceOracle,
        token: &TokenId,
        risk_weight_bps: u64,
    ) -> Result<usize, CreditError> {
        if risk_weight_bps == 0 || risk_weight_bps > BPS {
            return Err(CreditError::ParameterOutOfRange(format!(
                "risk weight must be in (0, {}], got {}",
                BPS, risk_weight_bps
            )));
        }
        if !oracle.has_feed(token) {
            return Err(CreditError::NoFeedRegistered(token.clone()));
        }

        if let Some(index) = self.index_of(token) {
            self.allowed_tokens[index].risk_weight_bps = risk_weight_bps;
            return Ok(index);
        }
        self.allowed_tokens.push(AllowedToken {
            token: token.clone(),
            risk_weight_bps,
        });
        Ok(self.allowed_tokens.len() - 1)
    }

    pub fn allowed_tokens_count(&self) -> usize {
        self.allowed_tokens.len()
    }

    pub fn allowed_token(&self, index: usize) -> Option<&AllowedToken> {
        self.allowed_tokens.get(index)
    }

    pub fn index_of(&self, token: &TokenId) -> Option<usize> {
        self.allowed_tokens.iter().position(|t| &t.token == token)
    }

    pub fn is_token_allowed(&self, token: &TokenId) -> bool {
        self.index_of(token).is_some()
    }

    /// Start a freshly opened account with only the underlying enabled.
    pub fn init_enabled_tokens(&mut self, caller: &Address, account: AccountId) -> Result<(), CreditError> {
        self.ensure_manager(caller)?;
        self.enabled_tokens.insert(account, BTreeSet::from([0]));
        Ok(())
    }

    /// Fail with `TokenNotAllowed` unless `token` is whitelisted; otherwise count it as collateral.
    pub fn check_and_enable_token(
        &mut self,
        caller: &Address,
        account: AccountId,
        token: &TokenId,
    ) -> Result<(), CreditError> {
        self.ensure_manager(caller)?;
        let index = self
            .index_of(token)
            .ok_or_else(|| CreditError::TokenNotAllowed(token.clone()))?;
        self.enabled_tokens.entry(account).or_default().insert(index);
        Ok(())
    }

    /// Forget the enabled set of an account being returned to the factory.
    pub fn clear_enabled_tokens(&mut self, caller: &Address, account: AccountId) -> Result<(), CreditError> {
        self.ensure_manager(caller)?;
        self.enabled_tokens.remove(&account);
        Ok(())
    }

    pub fn is_enabled(&self, account: AccountId, index: usize) -> bool {
        self.enabled_tokens
            .get(&account)
            .is_some_and(|set| set.contains(&index))
    }

    /// Holding at `index` of the allowed array.
    pub fn get_credit_account_token_by_id(
        &self,
        ledger: &dyn FungibleAsset,
        account: &CreditAccount,
        index: usize,
    ) -> Result<TokenHolding, CreditError> {
        let allowed = self.allowed_tokens.get(index).ok_or_else(|| {
            CreditError::ParameterOutOfRange(format!(
                "token index {} out of range ({} allowed)",
                index,
                self.allowed_tokens.len()
            ))
        })?;
        Ok(TokenHolding {
            token: allowed.token.clone(),
            balance: ledger.balance_of(&allowed.token, &account.address),
            risk_weight_bps: allowed.risk_weight_bps,
            enabled: self.is_enabled(account.id, index),
        })
    }

    /// Every slot of the allowed array, in index order.
    pub fn holdings(&self, ledger: &dyn FungibleAsset, account: &CreditAccount) -> Vec<TokenHolding> {
        self.allowed_tokens
            .iter()
            .enumerate()
            .map(|(index, allowed)| TokenHolding {
                token: allowed.token.clone(),
                balance: ledger.balance_of(&allowed.token, &account.address),
                risk_weight_bps: allowed.risk_weight_bps,
                enabled: self.is_enabled(account.id, index),
            })
            .collect()
    }

    /// Oracle value of the enabled holdings, in underlying units.
    pub fn calc_total_value(
        &self,
        ledger: &dyn FungibleAsset,
        oracle: &PriceOracle,
        account: &CreditAccount,
        now: TimeMs,
    ) -> Result<Decimal, CreditError> {
        self.sum_enabled(ledger, oracle, account, now, |_| Decimal::one())
    }

    /// Oracle value of the enabled holdings, each scaled by its risk weight.
    pub fn calc_threshold_weighted_value(
        &self,
        ledger: &dyn FungibleAsset,
        oracle: &PriceOracle,
        account: &CreditAccount,
        now: TimeMs,
    ) -> Result<Decimal, CreditError> {
        self.sum_enabled(ledger, oracle, account, now, |allowed| {
            Decimal::from_bps(allowed.risk_weight_bps)
        })
    }

    /// Weighted collateral over `debt`, in whole basis points.
    ///
    /// An account without debt reports `u64::MAX`.
    pub fn calc_credit_account_health_factor(
        &self,
        ledger: &dyn FungibleAsset,
        oracle: &PriceOracle,
        account: &CreditAccount,
        debt: Decimal,
        now: TimeMs,
    ) -> Result<u64, CreditError> {
        if !debt.is_positive() {
            return Ok(u64::MAX);
        }
        let weighted = self.calc_threshold_weighted_value(ledger, oracle, account, now)?;
        let health_factor = (weighted * Decimal::from_units(BPS) / debt)
            .floor()
            .to_u64()
            .ok_or(CreditError::MathOverflow("health factor"))?;
        tracing::debug!(account = %account.address, %weighted, %debt, health_factor, "health factor");
        Ok(health_factor)
    }

    fn sum_enabled(
        &self,
        ledger: &dyn FungibleAsset,
        oracle: &PriceOracle,
        account: &CreditAccount,
        now: TimeMs,
        weight: impl Fn(&AllowedToken) -> Decimal,
    ) -> Result<Decimal, CreditError> {
        let mut total = Decimal::zero();
        for (index, allowed) in self.allowed_tokens.iter().enumerate() {
            if !self.is_enabled(account.id, index) {
                continue;
            }
            let balance = ledger.balance_of(&allowed.token, &account.address);
            if balance.is_zero() {
                continue;
            }
            let value = oracle.convert(balance, &allowed.token, &self.underlying, now)?;
            total = total
                .checked_add(value * weight(allowed))
                .ok_or(CreditError::MathOverflow("collateral value"))?;
        }
        Ok(total)
    }

    fn ensure_manager(&self, caller: &Address) -> Result<(), CreditError> {
        match &self.manager {
            Some(manager) if manager == caller => Ok(()),
            _ => Err(CreditError::Unauthorized(format!(
                "{} is not the credit manager of this filter",
                caller
            ))),
        }
    }
}
