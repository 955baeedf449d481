//! Settlement configuration
//!
//! Loaded from `SETTLEMENT_*` environment variables (a `.env` file is read
//! first when present) or from a JSON file. Missing values fall back to the
//! defaults below.
//!
//! | Variable | Default |
//! |---|---|
//! | `SETTLEMENT_MAX_CONCURRENT_PAYMENTS` | 8 |
//! | `SETTLEMENT_PAYMENT_TIMEOUT_SECS` | 30 |
//! | `SETTLEMENT_MAX_PAYMENT_RETRIES` | 3 |
//! | `SETTLEMENT_RETRY_BASE_DELAY_MS` | 1000 |
//! | `SETTLEMENT_RETRY_MAX_DELAY_MS` | 30000 |
//! | `SETTLEMENT_DATA_DIR` | `./settlement_data` |

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::{RetryPolicy, DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_DELAY_MS, DEFAULT_MAX_RETRIES};
use crate::settlement::executor::{
    ExecutorSettings, DEFAULT_MAX_CONCURRENT_PAYMENTS, DEFAULT_PAYMENT_TIMEOUT_SECS,
};

pub const ENV_PREFIX: &str = "SETTLEMENT_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    pub max_concurrent_payments: usize,
    pub payment_timeout_secs: u64,
    pub max_payment_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub data_dir: PathBuf,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            max_concurrent_payments: DEFAULT_MAX_CONCURRENT_PAYMENTS,
            payment_timeout_secs: DEFAULT_PAYMENT_TIMEOUT_SECS,
            max_payment_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_BASE_DELAY_MS,
            retry_max_delay_ms: DEFAULT_MAX_DELAY_MS,
            data_dir: PathBuf::from("./settlement_data"),
        }
    }
}

impl SettlementConfig {
    /// Defaults overridden by `SETTLEMENT_*` variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with a custom variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            max_concurrent_payments: parse_var(&lookup, "MAX_CONCURRENT_PAYMENTS", defaults.max_concurrent_payments)?,
            payment_timeout_secs: parse_var(&lookup, "PAYMENT_TIMEOUT_SECS", defaults.payment_timeout_secs)?,
            max_payment_retries: parse_var(&lookup, "MAX_PAYMENT_RETRIES", defaults.max_payment_retries)?,
            retry_base_delay_ms: parse_var(&lookup, "RETRY_BASE_DELAY_MS", defaults.retry_base_delay_ms)?,
            retry_max_delay_ms: parse_var(&lookup, "RETRY_MAX_DELAY_MS", defaults.retry_max_delay_ms)?,
            data_dir: lookup(&format!("{}DATA_DIR", ENV_PREFIX))
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_payments == 0 {
            return Err(ConfigError::Invalid("max_concurrent_payments must be at least 1".into()));
        }
        if self.payment_timeout_secs == 0 {
            return Err(ConfigError::Invalid("payment_timeout_secs must be at least 1".into()));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(ConfigError::Invalid("retry_max_delay_ms is below retry_base_delay_ms".into()));
        }
        Ok(())
    }

    pub fn payment_timeout(&self) -> Duration {
        Duration::from_secs(self.payment_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_payment_retries,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            max_concurrent_payments: self.max_concurrent_payments,
            payment_timeout: self.payment_timeout(),
            retry: self.retry_policy(),
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    let key = format!("{}{}", ENV_PREFIX, name);
    match lookup(&key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = SettlementConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, SettlementConfig::default());

        let settings = config.executor_settings();
        assert_eq!(settings.max_concurrent_payments, 8);
        assert_eq!(settings.payment_timeout, Duration::from_secs(30));
        assert_eq!(settings.retry.delay_for(2), Duration::from_secs(4));
    }

    #[test]
    fn test_env_overrides_and_bad_values() {
        let config = SettlementConfig::from_lookup(lookup(&[
            ("SETTLEMENT_MAX_CONCURRENT_PAYMENTS", "2"),
            ("SETTLEMENT_DATA_DIR", "/tmp/payouts"),
        ]))
        .unwrap();
        assert_eq!(config.max_concurrent_payments, 2);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/payouts"));

        let err = SettlementConfig::from_lookup(lookup(&[("SETTLEMENT_PAYMENT_TIMEOUT_SECS", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "SETTLEMENT_PAYMENT_TIMEOUT_SECS"));

        let err = SettlementConfig::from_lookup(lookup(&[("SETTLEMENT_MAX_CONCURRENT_PAYMENTS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_json_file_with_partial_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settlement.json");
        std::fs::write(&path, r#"{ "max_payment_retries": 5, "retry_base_delay_ms": 10 }"#).unwrap();

        let config = SettlementConfig::from_json_file(&path).unwrap();
        assert_eq!(config.max_payment_retries, 5);
        assert_eq!(config.retry_policy().delay_for(1), Duration::from_millis(20));
        assert_eq!(config.payment_timeout_secs, 30);
    }
}
