//! Lossless decimal numeric type backed by rust_decimal.
//!
//! Token amounts are carried as integral base units; prices, rates and the
//! interest index carry fractional precision.

use rust_decimal::Decimal as RustDecimal;
use rust_decimal::RoundingStrategy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Basis-point denominator (10000 = 100%).
pub const BPS: u64 = 10_000;

/// Token amount, price or rate. Serializes as a JSON number.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Decimal(#[serde(with = "rust_decimal::serde::float")] RustDecimal);

impl Decimal {
    /// Largest representable value, used as an unbounded allowance.
    pub const MAX: Decimal = Decimal(RustDecimal::MAX);

    /// Parse a Decimal from a string losslessly.
    ///
    /// # Errors
    /// Returns an error if the string is not a valid decimal number.
    pub fn from_str_canonical(s: &str) -> Result<Self, rust_decimal::Error> {
        RustDecimal::from_str(s).map(Decimal)
    }

    /// Format the Decimal as a canonical string (no exponent notation).
    pub fn to_canonical_string(&self) -> String {
        let normalized = self.0.normalize();
        format!("{}", normalized)
    }

    pub fn zero() -> Self {
        Decimal(RustDecimal::ZERO)
    }

    pub fn one() -> Self {
        Decimal(RustDecimal::ONE)
    }

    /// Whole number of base units.
    pub fn from_units(units: u64) -> Self {
        Decimal(RustDecimal::from(units))
    }

    /// A basis-point quantity as a fraction (`bps / 10000`).
    pub fn from_bps(bps: u64) -> Self {
        Decimal(RustDecimal::from(bps) / RustDecimal::from(BPS))
    }

    /// Returns true if the value is exactly zero.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Returns true if the value is > 0.
    pub fn is_positive(&self) -> bool {
        !self.is_zero() && self.0.is_sign_positive()
    }

    /// Returns true if the value is < 0.
    pub fn is_negative(&self) -> bool {
        !self.is_zero() && self.0.is_sign_negative()
    }

    /// Absolute value.
    pub fn abs(&self) -> Self {
        Decimal(self.0.abs())
    }

    /// Round toward negative infinity to a whole number of base units.
    pub fn floor(&self) -> Self {
        Decimal(self.0.floor())
    }

    /// Round toward positive infinity to a whole number of base units.
    pub fn ceil(&self) -> Self {
        Decimal(self.0.ceil())
    }

    /// Round to `dp` decimal places, away from zero on ties.
    pub fn round_dp(&self, dp: u32) -> Self {
        Decimal(
            self.0
                .round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero),
        )
    }

    /// `self - rhs`, clamped at zero.
    pub fn saturating_sub(&self, rhs: Decimal) -> Self {
        if rhs >= *self {
            Decimal::zero()
        } else {
            Decimal(self.0 - rhs.0)
        }
    }

    pub fn checked_add(&self, rhs: Decimal) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Decimal)
    }

    pub fn checked_mul(&self, rhs: Decimal) -> Option<Self> {
        self.0.checked_mul(rhs.0).map(Decimal)
    }

    /// Returns None on division by zero or overflow.
    pub fn checked_div(&self, rhs: Decimal) -> Option<Self> {
        self.0.checked_div(rhs.0).map(Decimal)
    }

    /// Integer part, or None when negative or too large.
    pub fn to_u64(&self) -> Option<u64> {
        use rust_decimal::prelude::ToPrimitive;
        self.0.trunc().to_u64()
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_canonical_string())
    }
}

impl FromStr for Decimal {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_canonical(s)
    }
}

impl std::ops::Add for Decimal {
    type Output = Decimal;

    fn add(self, rhs: Decimal) -> Decimal {
        Decimal(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Decimal {
    type Output = Decimal;

    fn sub(self, rhs: Decimal) -> Decimal {
        Decimal(self.0 - rhs.0)
    }
}

impl std::ops::Mul for Decimal {
    type Output = Decimal;

    fn mul(self, rhs: Decimal) -> Decimal {
        Decimal(self.0 * rhs.0)
    }
}

impl std::ops::Div for Decimal {
    type Output = Decimal;

    fn div(self, rhs: Decimal) -> Decimal {
        Decimal(self.0 / rhs.0)
    }
}

impl std::ops::Neg for Decimal {
    type Output = Decimal;

    fn neg(self) -> Decimal {
        Decimal(-self.0)
    }
}

impl std::ops::AddAssign for Decimal {
    fn add_assign(&mut self, rhs: Decimal) {
        self.0 += rhs.0;
    }
}

impl std::ops::SubAssign for Decimal {
    fn sub_assign(&mut self, rhs: Decimal) {
        self.0 -= rhs.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    #[test]
    fn test_decimal_canonical_no_exponent() {
        let decimal = d("123.4500");
        let formatted = decimal.to_canonical_string();
        assert!(!formatted.contains('e'));
        assert_eq!(formatted, "123.45");
    }

    #[test]
    fn test_decimal_arithmetic() {
        let a = d("10.5");
        let b = d("2.5");

        assert_eq!((a + b).to_canonical_string(), "13");
        assert_eq!((a - b).to_canonical_string(), "8");
        assert_eq!((a * b).to_canonical_string(), "26.25");
        assert_eq!((a / b).to_canonical_string(), "4.2");
    }

    #[test]
    fn test_decimal_json_serialization() {
        let json = serde_json::to_value(d("123.456")).unwrap();
        assert!(json.is_number());
        assert_eq!(json.to_string(), "123.456");
    }

    #[test]
    fn test_floor_and_ceil_to_base_units() {
        assert_eq!(d("41.9").floor(), d("41"));
        assert_eq!(d("41.1").ceil(), d("42"));
        assert_eq!(d("42").ceil(), d("42"));
    }

    #[test]
    fn test_saturating_sub_clamps_at_zero() {
        assert_eq!(d("5").saturating_sub(d("7")), Decimal::zero());
        assert_eq!(d("7").saturating_sub(d("5")), d("2"));
    }

    #[test]
    fn test_from_bps() {
        assert_eq!(Decimal::from_bps(9500), d("0.95"));
        assert_eq!(Decimal::from_bps(BPS), Decimal::one());
    }

    #[test]
    fn test_checked_div_by_zero_is_none() {
        assert!(d("1").checked_div(Decimal::zero()).is_none());
        assert_eq!(d("1").checked_div(d("4")), Some(d("0.25")));
    }

    #[test]
    fn test_to_u64_truncates() {
        assert_eq!(d("12499.99").to_u64(), Some(12499));
        assert_eq!(d("-1").to_u64(), None);
    }

    #[test]
    fn test_decimal_ordering() {
        assert!(d("10") < d("20"));
        assert_eq!(d("10").max(d("20")), d("20"));
    }
}
