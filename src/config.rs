//! Environment-driven service configuration.
//!
//! Every binary loads one [`ServiceConfig`] at startup. Unset variables fall
//! back to single-host defaults; malformed values are configuration errors,
//! not panics.

use std::env;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub log_dir: String,
    pub log_file: String,
    /// "hourly", "daily", or anything else for a single never-rotated file.
    pub rotation: String,
    pub log_level: String,
    pub use_json: bool,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// This service's own store.
    pub redis_url: String,
    pub bind_addr: String,
    /// Peer service bases, scheme included.
    pub stock_rpc_addr: String,
    pub payment_rpc_addr: String,
    pub order_addr: String,
    /// Reconciliation consumer replicas per leg service.
    pub stream_consumers: i64,
    pub snapshot_interval_secs: u64,
    pub log: LogConfig,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

impl ServiceConfig {
    pub fn from_env(service: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            redis_url: env_or("REDIS_URL", "redis://127.0.0.1:6379/0"),
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8000"),
            stock_rpc_addr: env_or("STOCK_RPC_ADDR", "http://127.0.0.1:50051"),
            payment_rpc_addr: env_or("PAYMENT_RPC_ADDR", "http://127.0.0.1:50052"),
            order_addr: env_or("ORDER_ADDR", "http://127.0.0.1:8000"),
            stream_consumers: env_parse("NUM_STREAM_CONSUMERS", 1)?,
            snapshot_interval_secs: env_parse("SNAPSHOT_INTERVAL_SECS", 10)?,
            log: LogConfig {
                log_dir: env_or("LOG_DIR", "logs"),
                log_file: env_or("LOG_FILE", &format!("{service}.log")),
                rotation: env_or("LOG_ROTATION", "daily"),
                log_level: env_or("LOG_LEVEL", "info"),
                use_json: env_parse("LOG_JSON", false)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_without_env() {
        let config = ServiceConfig::from_env("stock").unwrap();
        assert_eq!(config.log.log_file, "stock.log");
        assert!(config.stream_consumers >= 1);
    }

    #[test]
    fn test_env_parse_rejects_garbage() {
        unsafe { env::set_var("CHECKOUT_FABRIC_TEST_KEY", "not-a-number") };
        let result: Result<i64, _> = env_parse("CHECKOUT_FABRIC_TEST_KEY", 1);
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
        unsafe { env::remove_var("CHECKOUT_FABRIC_TEST_KEY") };
    }
}
