//! Domain primitives: TimeMs, Address, TokenId, AccountId.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Milliseconds in a 365-day year; the period rates are quoted against.
pub const MS_PER_YEAR: i64 = 365 * 24 * 60 * 60 * 1000;

/// Time in milliseconds since Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TimeMs(pub i64);

impl TimeMs {
    /// Create a TimeMs from milliseconds.
    pub fn new(ms: i64) -> Self {
        TimeMs(ms)
    }

    /// Get the underlying milliseconds value.
    pub fn as_ms(&self) -> i64 {
        self.0
    }

    /// Milliseconds elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn since(&self, earlier: TimeMs) -> i64 {
        (self.0 - earlier.0).max(0)
    }
}

/// Ledger address of a wallet or protocol component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    /// Create an Address from a string.
    pub fn new(addr: impl Into<String>) -> Self {
        Address(addr.into())
    }

    /// Deterministic address for a protocol-created object.
    ///
    /// `0x` followed by the first 20 bytes of `sha256(label || seed)`.
    pub fn derive(label: &str, seed: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(label.as_bytes());
        hasher.update(seed);
        let hash = hasher.finalize();
        Address(format!("0x{}", hex::encode(&hash[..20])))
    }

    /// Get the address as a string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token identifier (e.g., "USDC", "WETH").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TokenId(pub String);

impl TokenId {
    /// Create a TokenId from a string.
    pub fn new(token: impl Into<String>) -> Self {
        TokenId(token.into())
    }

    /// Get the token as a string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable handle of a credit account inside the account factory arena.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct AccountId(pub u32);

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic() {
        let a = Address::derive("credit-account", &7u32.to_le_bytes());
        let b = Address::derive("credit-account", &7u32.to_le_bytes());
        let c = Address::derive("credit-account", &8u32.to_le_bytes());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("0x"));
        assert_eq!(a.as_str().len(), 42);
    }

    #[test]
    fn test_derive_separates_labels() {
        let pool = Address::derive("pool", b"USDC");
        let manager = Address::derive("credit-manager", b"USDC");
        assert_ne!(pool, manager);
    }

    #[test]
    fn test_time_since_never_negative() {
        let t1 = TimeMs::new(1000);
        let t2 = TimeMs::new(2500);
        assert_eq!(t2.since(t1), 1500);
        assert_eq!(t1.since(t2), 0);
    }

    #[test]
    fn test_token_display() {
        assert_eq!(TokenId::new("WETH").to_string(), "WETH");
        assert_eq!(AccountId(3).to_string(), "#3");
    }
}
