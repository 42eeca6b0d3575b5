//! Recyclable credit accounts addressed by stable handles.

use crate::domain::{AccountId, Address, Decimal, TimeMs};
use crate::error::CreditError;
use std::collections::VecDeque;

/// A leveraged sub-account. Its token holdings live on the ledger under `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditAccount {
    pub id: AccountId,
    pub address: Address,
    /// Owner of the position; None while the account sits in the free list.
    pub borrower: Option<Address>,
    /// Credit manager the account is lent to.
    pub manager: Option<Address>,
    /// Principal drawn from the pool.
    pub borrowed_amount: Decimal,
    /// Pool interest index when the principal was recorded.
    pub cumulative_index_at_open: Decimal,
    pub since: TimeMs,
    in_use: bool,
}

impl CreditAccount {
    fn fresh(id: AccountId, address: Address) -> Self {
        Self {
            id,
            address,
            borrower: None,
            manager: None,
            borrowed_amount: Decimal::zero(),
            cumulative_index_at_open: Decimal::one(),
            since: TimeMs::default(),
            in_use: false,
        }
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use
    }

    /// Principal plus interest at `index_now`, rounded up to base units.
    pub fn borrowed_amount_with_interest(&self, index_now: Decimal) -> Decimal {
        (self.borrowed_amount * index_now / self.cumulative_index_at_open).ceil()
    }
}

/// Arena of credit accounts with a FIFO free list.
///
/// Every account is either in the free list or in use, never both.
#[derive(Debug, Clone)]
pub struct AccountFactory {
    address: Address,
    accounts: Vec<CreditAccount>,
    free: VecDeque<AccountId>,
}

impl AccountFactory {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            accounts: Vec::new(),
            free: VecDeque::new(),
        }
    }

    /// Hand out a free account, allocating a new one when none is free.
    pub fn take(&mut self, manager: &Address, now: TimeMs) -> AccountId {
        let id = match self.free.pop_front() {
            Some(id) => id,
            None => self.allocate(),
        };
        let account = &mut self.accounts[id.0 as usize];
        account.in_use = true;
        account.manager = Some(manager.clone());
        account.since = now;
        tracing::debug!(account = %account.address, id = %id, "credit account taken");
        id
    }

    /// Clear the account's position fields and return it to the free list.
    ///
    /// Token balances are not touched; the manager sweeps them before release.
    pub fn release(&mut self, id: AccountId) -> Result<(), CreditError> {
        let account = self
            .accounts
            .get_mut(id.0 as usize)
            .ok_or_else(|| CreditError::ParameterOutOfRange(format!("unknown account {}", id)))?;
        if !account.in_use {
            return Err(CreditError::ParameterOutOfRange(format!(
                "account {} is already free",
                id
            )));
        }
        *account = CreditAccount::fresh(id, account.address.clone());
        self.free.push_back(id);
        tracing::debug!(id = %id, "credit account returned");
        Ok(())
    }

    pub fn get(&self, id: AccountId) -> Option<&CreditAccount> {
        self.accounts.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: AccountId) -> Option<&mut CreditAccount> {
        self.accounts
            .get_mut(id.0 as usize)
            .filter(|account| account.in_use)
    }

    pub fn is_free(&self, id: AccountId) -> bool {
        self.get(id).is_some_and(|account| !account.in_use)
    }

    pub fn count_total(&self) -> usize {
        self.accounts.len()
    }

    pub fn count_free(&self) -> usize {
        self.free.len()
    }

    fn allocate(&mut self) -> AccountId {
        let id = AccountId(self.accounts.len() as u32);
        let mut seed = self.address.as_str().as_bytes().to_vec();
        seed.extend_from_slice(&id.0.to_le_bytes());
        let address = Address::derive("credit-account", &seed);
        self.accounts.push(CreditAccount::fresh(id, address));
        id
    }
}
