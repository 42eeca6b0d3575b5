//! Events emitted by the pool, the credit managers and the oracle.

use crate::domain::{AccountId, Address, Decimal, TimeMs, TokenId};
use serde::{Deserialize, Serialize};

/// Externally observable state change, carrying enough data for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CreditEvent {
    LiquidityAdded {
        sender: Address,
        on_behalf_of: Address,
        amount: Decimal,
        shares: Decimal,
        referral_code: u32,
    },
    LiquidityRemoved {
        sender: Address,
        to: Address,
        amount: Decimal,
        shares: Decimal,
        fee: Decimal,
    },
    Borrow {
        manager: Address,
        account: Address,
        amount: Decimal,
    },
    Repay {
        manager: Address,
        borrowed_amount: Decimal,
        profit: Decimal,
    },
    /// A loss the treasury could not absorb; depositors bear it.
    UncoveredLoss {
        manager: Address,
        loss: Decimal,
    },
    CreditManagerConnected {
        manager: Address,
    },
    PriceFeedAdded {
        token: TokenId,
    },
    TokenAllowed {
        manager: Address,
        token: TokenId,
        risk_weight_bps: u64,
    },
    ContractAllowed {
        manager: Address,
        contract: Address,
    },
    AccountOpened {
        sender: Address,
        on_behalf_of: Address,
        account: Address,
        account_id: AccountId,
        amount: Decimal,
        borrowed_amount: Decimal,
        referral_code: u32,
    },
    OrderExecuted {
        owner: Address,
        router: Address,
    },
    CollateralAdded {
        on_behalf_of: Address,
        token: TokenId,
        amount: Decimal,
    },
    BorrowedAmountIncreased {
        owner: Address,
        amount: Decimal,
    },
    OwnershipTransferred {
        from: Address,
        to: Address,
    },
    AccountRepaid {
        owner: Address,
        to: Address,
    },
    AccountClosed {
        owner: Address,
        to: Address,
        remaining_funds: Decimal,
    },
    AccountLiquidated {
        owner: Address,
        liquidator: Address,
        remaining_funds: Decimal,
    },
}

/// An event together with the ledger time of the step that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub time_ms: TimeMs,
    #[serde(flatten)]
    pub event: CreditEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_tag() {
        let record = EventRecord {
            time_ms: TimeMs::new(1000),
            event: CreditEvent::OrderExecuted {
                owner: Address::new("0xowner"),
                router: Address::new("0xrouter"),
            },
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["event"], "order_executed");
        assert_eq!(json["owner"], "0xowner");
        assert_eq!(json["time_ms"], 1000);
    }
}
