//! Domain types shared by every component of the credit engine.
//!
//! This module provides:
//! - Lossless numeric handling via Decimal wrapper
//! - Domain primitives: TimeMs, Address, TokenId, AccountId
//! - The event log vocabulary

pub mod decimal;
pub mod events;
pub mod primitives;

pub use decimal::{Decimal, BPS};
pub use events::{CreditEvent, EventRecord};
pub use primitives::{AccountId, Address, TimeMs, TokenId, MS_PER_YEAR};
