//! Configuration loading and representation.
//!
//! Everything is read from environment variables; unset variables fall back to
//! defaults suitable for local development.

use std::time::Duration;

use thiserror::Error;

use dispensary_inventory::DEFAULT_LOW_STOCK_THRESHOLD;

pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_EVENT_CHANNEL: &str = "inventory.events";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} has an invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime settings of the ledger service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// `DATABASE_URL`; absent means the in-memory store.
    pub database_url: Option<String>,
    /// `LEDGER_LOCK_TIMEOUT_MS`
    pub lock_timeout: Duration,
    /// `LEDGER_DEFAULT_LOW_STOCK_THRESHOLD`
    pub default_low_stock_threshold: i64,
    /// `LEDGER_MAX_DB_CONNECTIONS`
    pub max_connections: u32,
    /// `REDIS_URL`; only used with the `redis` feature.
    pub redis_url: Option<String>,
    /// `LEDGER_EVENT_CHANNEL`
    pub event_channel: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            default_low_stock_threshold: DEFAULT_LOW_STOCK_THRESHOLD,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            redis_url: None,
            event_channel: DEFAULT_EVENT_CHANNEL.to_string(),
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let lock_timeout_ms: u64 = parse_or(
            "LEDGER_LOCK_TIMEOUT_MS",
            non_empty("LEDGER_LOCK_TIMEOUT_MS"),
            DEFAULT_LOCK_TIMEOUT_MS,
        )?;
        if lock_timeout_ms == 0 {
            return Err(invalid(
                "LEDGER_LOCK_TIMEOUT_MS",
                "0",
                "lock waits must be bounded",
            ));
        }

        let default_low_stock_threshold: i64 = parse_or(
            "LEDGER_DEFAULT_LOW_STOCK_THRESHOLD",
            non_empty("LEDGER_DEFAULT_LOW_STOCK_THRESHOLD"),
            defaults.default_low_stock_threshold,
        )?;
        if default_low_stock_threshold < 0 {
            return Err(invalid(
                "LEDGER_DEFAULT_LOW_STOCK_THRESHOLD",
                &default_low_stock_threshold.to_string(),
                "must not be negative",
            ));
        }

        let max_connections: u32 = parse_or(
            "LEDGER_MAX_DB_CONNECTIONS",
            non_empty("LEDGER_MAX_DB_CONNECTIONS"),
            defaults.max_connections,
        )?;
        if max_connections == 0 {
            return Err(invalid("LEDGER_MAX_DB_CONNECTIONS", "0", "must be at least 1"));
        }

        Ok(Self {
            database_url: non_empty("DATABASE_URL"),
            lock_timeout: Duration::from_millis(lock_timeout_ms),
            default_low_stock_threshold,
            max_connections,
            redis_url: non_empty("REDIS_URL"),
            event_channel: non_empty("LEDGER_EVENT_CHANNEL").unwrap_or(defaults.event_channel),
        })
    }
}

fn parse_or<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(name, &value, &e.to_string())),
    }
}

fn invalid(name: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
