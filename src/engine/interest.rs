//! Utilization-driven interest rate model.

use crate::domain::Decimal;
use crate::error::CreditError;
use std::fmt;

/// Maps pool utilization to annual borrow and supply rates.
pub trait InterestRateModel: Send + Sync + fmt::Debug {
    /// Annual borrow rate for a pool whose value is `expected_liquidity` and
    /// whose idle balance is `available_liquidity`.
    fn borrow_rate(&self, expected_liquidity: Decimal, available_liquidity: Decimal) -> Decimal;

    /// Annual rate earned by depositors: borrow rate scaled by utilization.
    fn supply_rate(&self, expected_liquidity: Decimal, available_liquidity: Decimal) -> Decimal {
        let utilization = utilization(expected_liquidity, available_liquidity);
        self.borrow_rate(expected_liquidity, available_liquidity) * utilization
    }
}

/// Borrowed share of the pool, clamped to [0, 1].
pub fn utilization(expected_liquidity: Decimal, available_liquidity: Decimal) -> Decimal {
    if !expected_liquidity.is_positive() || available_liquidity >= expected_liquidity {
        return Decimal::zero();
    }
    let borrowed = expected_liquidity - available_liquidity.max(Decimal::zero());
    (borrowed / expected_liquidity).min(Decimal::one())
}

/// Two-slope curve: gentle below the optimal utilization, steep above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearInterestRateModel {
    optimal_utilization: Decimal,
    base_rate: Decimal,
    slope1: Decimal,
    slope2: Decimal,
}

impl LinearInterestRateModel {
    /// # Errors
    /// `ParameterOutOfRange` unless `0 < optimal < 1` and every rate is non-negative.
    pub fn new(
        optimal_utilization: Decimal,
        base_rate: Decimal,
        slope1: Decimal,
        slope2: Decimal,
    ) -> Result<Self, CreditError> {
        if !optimal_utilization.is_positive() || optimal_utilization >= Decimal::one() {
            return Err(CreditError::ParameterOutOfRange(format!(
                "optimal utilization must be in (0, 1), got {}",
                optimal_utilization
            )));
        }
        if base_rate.is_negative() || slope1.is_negative() || slope2.is_negative() {
            return Err(CreditError::ParameterOutOfRange(
                "interest rates must be non-negative".to_string(),
            ));
        }
        Ok(Self {
            optimal_utilization,
            base_rate,
            slope1,
            slope2,
        })
    }

    pub fn optimal_utilization(&self) -> Decimal {
        self.optimal_utilization
    }

    pub fn base_rate(&self) -> Decimal {
        self.base_rate
    }

    pub fn slope1(&self) -> Decimal {
        self.slope1
    }

    pub fn slope2(&self) -> Decimal {
        self.slope2
    }

    /// Rate at utilization `u` (already clamped to [0, 1]).
    pub fn rate_at(&self, u: Decimal) -> Decimal {
        if u < self.optimal_utilization {
            self.base_rate + self.slope1 * u / self.optimal_utilization
        } else {
            let excess = u - self.optimal_utilization;
            let span = Decimal::one() - self.optimal_utilization;
            self.base_rate + self.slope1 + self.slope2 * excess / span
        }
    }

    /// Ceiling of the curve, reached at 100% utilization.
    pub fn max_rate(&self) -> Decimal {
        self.base_rate + self.slope1 + self.slope2
    }
}

impl Default for LinearInterestRateModel {
    /// 80% kink, 0% base, 4% first slope, 75% second slope.
    fn default() -> Self {
        Self {
            optimal_utilization: Decimal::from_bps(8_000),
            base_rate: Decimal::zero(),
            slope1: Decimal::from_bps(400),
            slope2: Decimal::from_bps(7_500),
        }
    }
}

impl InterestRateModel for LinearInterestRateModel {
    fn borrow_rate(&self, expected_liquidity: Decimal, available_liquidity: Decimal) -> Decimal {
        self.rate_at(utilization(expected_liquidity, available_liquidity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    #[test]
    fn test_empty_pool_pays_base_rate() {
        let model = LinearInterestRateModel::new(d("0.8"), d("0.01"), d("0.04"), d("0.75")).unwrap();
        assert_eq!(model.borrow_rate(Decimal::zero(), Decimal::zero()), d("0.01"));
        assert_eq!(model.borrow_rate(d("100"), d("100")), d("0.01"));
    }

    #[test]
    fn test_below_kink() {
        let model = LinearInterestRateModel::default();
        // 40% utilization -> half of slope1
        assert_eq!(model.borrow_rate(d("100"), d("60")), d("0.02"));
    }

    #[test]
    fn test_continuous_at_kink() {
        let model = LinearInterestRateModel::default();
        let just_below = model.rate_at(d("0.79999999"));
        let at = model.rate_at(d("0.8"));
        assert_eq!(at, d("0.04"));
        assert!(at - just_below < d("0.000001"));
    }

    #[test]
    fn test_full_utilization_is_bounded() {
        let model = LinearInterestRateModel::default();
        assert_eq!(model.borrow_rate(d("100"), Decimal::zero()), model.max_rate());
        // Negative idle balance can't push utilization past 1.
        assert_eq!(model.borrow_rate(d("100"), d("-5")), model.max_rate());
    }

    #[test]
    fn test_monotonic_in_utilization() {
        let model = LinearInterestRateModel::default();
        let mut last = Decimal::zero();
        for available in (0..=100).rev() {
            let rate = model.borrow_rate(d("100"), Decimal::from_units(available));
            assert!(rate >= last, "rate decreased at available={}", available);
            last = rate;
        }
    }

    #[test]
    fn test_supply_rate_scales_with_utilization() {
        let model = LinearInterestRateModel::default();
        // 50% utilization, borrow rate 2.5%
        assert_eq!(model.supply_rate(d("100"), d("50")), d("0.0125"));
    }

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(LinearInterestRateModel::new(d("1"), d("0"), d("0.04"), d("0.75")).is_err());
        assert!(LinearInterestRateModel::new(d("0.8"), d("-0.01"), d("0.04"), d("0.75")).is_err());
    }
}
