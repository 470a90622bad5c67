use crate::errors::ConfigError;
use crate::payments::{DepositSettings, TestProviderSettings};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

/// Service configuration, read from the environment (after `.env` is loaded)
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// `None` runs on the in-memory store.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub port: u16,
    /// `None` logs events instead of publishing them.
    pub kafka_brokers: Option<String>,
    pub kafka_topic: String,
    pub deposits: DepositSettings,
    pub test_provider: TestProviderSettings,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = DepositSettings::default();

        let deposits = DepositSettings {
            max_amount: parse_or(&get, "DEPOSIT_MAX_AMOUNT", defaults.max_amount)?,
            currency: get("DEPOSIT_CURRENCY").unwrap_or(defaults.currency),
            success_url: get("DEPOSIT_SUCCESS_URL").or(defaults.success_url),
            cancel_url: get("DEPOSIT_CANCEL_URL").or(defaults.cancel_url),
            provider_timeout: Duration::from_secs(parse_or(&get, "PROVIDER_TIMEOUT_SECS", 30u64)?),
        };
        if deposits.max_amount <= Decimal::ZERO {
            return Err(ConfigError::InvalidValue {
                name: "DEPOSIT_MAX_AMOUNT",
                reason: "must be positive".to_string(),
            });
        }

        Ok(Self {
            database_url: get("DATABASE_URL"),
            database_max_connections: parse_or(&get, "DATABASE_MAX_CONNECTIONS", 10u32)?,
            port: parse_or(&get, "PORT", 3000u16)?,
            kafka_brokers: get("KAFKA_BROKERS"),
            kafka_topic: get("KAFKA_TOPIC").unwrap_or_else(|| "storefront-events".to_string()),
            deposits,
            test_provider: TestProviderSettings {
                enabled: parse_or(&get, "TEST_PROVIDER_ENABLED", true)?,
                auto_complete: parse_or(&get, "TEST_PROVIDER_AUTO_COMPLETE", true)?,
                webhook_secret: get("TEST_PROVIDER_WEBHOOK_SECRET"),
            },
        })
    }
}

impl AppConfig {
    /// Settings that are fine for local development but unsafe in production.
    /// Logged at startup.
    pub fn insecure_settings(&self) -> Vec<&'static str> {
        let mut found = Vec::new();
        // Disabled providers still take webhooks.
        if self.test_provider.webhook_secret.is_none() {
            found.push(
                "TEST_PROVIDER_WEBHOOK_SECRET not set, test provider webhooks are accepted unsigned",
            );
        }
        found
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(name) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            name,
            reason: format!("{:?}: {}", raw, e),
        }),
        None => Ok(default),
    }
}
