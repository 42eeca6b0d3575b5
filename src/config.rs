use crate::domain::{Address, Decimal, TokenId};
use crate::engine::{CreditManagerParams, LinearInterestRateModel, PoolParams};
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub underlying_token: TokenId,
    pub share_token: TokenId,
    pub treasury: Address,
    pub pool: PoolParams,
    pub interest_model: LinearInterestRateModel,
    pub credit_manager: CreditManagerParams,
    pub oracle_staleness_ms: i64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let underlying_token = env_map
            .get("UNDERLYING_TOKEN")
            .map(TokenId::new)
            .ok_or_else(|| ConfigError::MissingEnv("UNDERLYING_TOKEN".to_string()))?;

        let treasury = env_map
            .get("TREASURY_ADDRESS")
            .map(Address::new)
            .ok_or_else(|| ConfigError::MissingEnv("TREASURY_ADDRESS".to_string()))?;

        let share_token = env_map
            .get("SHARE_TOKEN")
            .map(TokenId::new)
            .unwrap_or_else(|| TokenId::new(format!("d{}", underlying_token)));
        if share_token == underlying_token {
            return Err(ConfigError::InvalidValue(
                "SHARE_TOKEN".to_string(),
                "must differ from UNDERLYING_TOKEN".to_string(),
            ));
        }

        let pool = PoolParams {
            withdraw_fee_bps: parse_bps(&env_map, "WITHDRAW_FEE_BPS", 0)?,
            expected_liquidity_limit: env_map
                .get("EXPECTED_LIQUIDITY_LIMIT")
                .map(|raw| parse_value::<Decimal>("EXPECTED_LIQUIDITY_LIMIT", raw))
                .transpose()?,
        };

        let defaults = LinearInterestRateModel::default();
        let interest_model = LinearInterestRateModel::new(
            parse_or(&env_map, "IRM_OPTIMAL_UTILIZATION", defaults.optimal_utilization())?,
            parse_or(&env_map, "IRM_BASE_RATE", defaults.base_rate())?,
            parse_or(&env_map, "IRM_SLOPE1", defaults.slope1())?,
            parse_or(&env_map, "IRM_SLOPE2", defaults.slope2())?,
        )
        .map_err(|e| ConfigError::InvalidValue("IRM_*".to_string(), e.to_string()))?;

        let manager_defaults = CreditManagerParams::default();
        let credit_manager = CreditManagerParams {
            min_amount: parse_or(&env_map, "CREDIT_MIN_AMOUNT", manager_defaults.min_amount)?,
            max_amount: parse_or(&env_map, "CREDIT_MAX_AMOUNT", manager_defaults.max_amount)?,
            max_leverage: parse_or(&env_map, "CREDIT_MAX_LEVERAGE", manager_defaults.max_leverage)?,
            liquidation_threshold_bps: parse_or(
                &env_map,
                "LIQUIDATION_THRESHOLD_BPS",
                manager_defaults.liquidation_threshold_bps,
            )?,
            fee_interest_bps: parse_bps(&env_map, "FEE_INTEREST_BPS", manager_defaults.fee_interest_bps)?,
            fee_liquidation_bps: parse_bps(
                &env_map,
                "FEE_LIQUIDATION_BPS",
                manager_defaults.fee_liquidation_bps,
            )?,
            liquidation_discount_bps: parse_bps(
                &env_map,
                "LIQUIDATION_DISCOUNT_BPS",
                manager_defaults.liquidation_discount_bps,
            )?,
            dust: parse_or(&env_map, "ACCOUNT_DUST", manager_defaults.dust)?,
            default_router: None,
        };
        credit_manager
            .validate()
            .map_err(|e| ConfigError::InvalidValue("CREDIT_*".to_string(), e.to_string()))?;

        let oracle_staleness_ms = parse_or(&env_map, "ORACLE_STALENESS_MS", 3_600_000i64)?;
        if oracle_staleness_ms < 0 {
            return Err(ConfigError::InvalidValue(
                "ORACLE_STALENESS_MS".to_string(),
                "must not be negative".to_string(),
            ));
        }

        Ok(Config {
            underlying_token,
            share_token,
            treasury,
            pool,
            interest_model,
            credit_manager,
            oracle_staleness_ms,
        })
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse::<T>().map_err(|_| {
        ConfigError::InvalidValue(key.to_string(), format!("cannot parse {:?}", raw))
    })
}

fn parse_or<T: FromStr>(
    env_map: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match env_map.get(key) {
        Some(raw) => parse_value(key, raw),
        None => Ok(default),
    }
}

fn parse_bps(env_map: &HashMap<String, String>, key: &str, default: u64) -> Result<u64, ConfigError> {
    let bps = parse_or(env_map, key, default)?;
    if bps > crate::domain::BPS {
        return Err(ConfigError::InvalidValue(
            key.to_string(),
            format!("must be at most 10000 basis points, got {}", bps),
        ));
    }
    Ok(bps)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_required_env() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("UNDERLYING_TOKEN".to_string(), "USDC".to_string());
        map.insert("TREASURY_ADDRESS".to_string(), "0xtreasury".to_string());
        map
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_env_map(setup_required_env()).unwrap();
        assert_eq!(config.share_token, TokenId::new("dUSDC"));
        assert_eq!(config.credit_manager.liquidation_threshold_bps, 10_000);
        assert_eq!(config.credit_manager.fee_interest_bps, 1_000);
        assert_eq!(config.credit_manager.dust, Decimal::one());
        assert_eq!(config.pool.expected_liquidity_limit, None);
        assert_eq!(config.interest_model, LinearInterestRateModel::default());
    }

    #[test]
    fn test_missing_underlying_token() {
        let mut env_map = setup_required_env();
        env_map.remove("UNDERLYING_TOKEN");
        match Config::from_env_map(env_map) {
            Err(ConfigError::MissingEnv(s)) => assert_eq!(s, "UNDERLYING_TOKEN"),
            _ => panic!("Expected MissingEnv error"),
        }
    }

    #[test]
    fn test_missing_treasury() {
        let mut env_map = setup_required_env();
        env_map.remove("TREASURY_ADDRESS");
        match Config::from_env_map(env_map) {
            Err(ConfigError::MissingEnv(s)) => assert_eq!(s, "TREASURY_ADDRESS"),
            _ => panic!("Expected MissingEnv error"),
        }
    }

    #[test]
    fn test_invalid_leverage() {
        let mut env_map = setup_required_env();
        env_map.insert("CREDIT_MAX_LEVERAGE".to_string(), "four".to_string());
        match Config::from_env_map(env_map) {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "CREDIT_MAX_LEVERAGE"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_bps_above_one_hundred_percent() {
        let mut env_map = setup_required_env();
        env_map.insert("LIQUIDATION_DISCOUNT_BPS".to_string(), "10001".to_string());
        match Config::from_env_map(env_map) {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "LIQUIDATION_DISCOUNT_BPS"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_interest_model_validated() {
        let mut env_map = setup_required_env();
        env_map.insert("IRM_OPTIMAL_UTILIZATION".to_string(), "1.5".to_string());
        assert!(matches!(
            Config::from_env_map(env_map),
            Err(ConfigError::InvalidValue(_, _))
        ));
    }

    #[test]
    fn test_overrides() {
        let mut env_map = setup_required_env();
        env_map.insert("SHARE_TOKEN".to_string(), "gUSDC".to_string());
        env_map.insert("EXPECTED_LIQUIDITY_LIMIT".to_string(), "5000000".to_string());
        env_map.insert("ACCOUNT_DUST".to_string(), "0".to_string());
        env_map.insert("ORACLE_STALENESS_MS".to_string(), "60000".to_string());

        let config = Config::from_env_map(env_map).unwrap();
        assert_eq!(config.share_token, TokenId::new("gUSDC"));
        assert_eq!(
            config.pool.expected_liquidity_limit,
            Some(Decimal::from_units(5_000_000))
        );
        assert_eq!(config.credit_manager.dust, Decimal::zero());
        assert_eq!(config.oracle_staleness_ms, 60_000);
    }
}
