//! Application configuration loaded from environment.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::services::checkout::PricingPolicy;

/// Application configuration loaded from `.env` and environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g. `0.0.0.0:3001`).
    pub server_addr: SocketAddr,
    /// PostgreSQL connection URL. Rooms are kept in process memory when unset.
    pub database_url: Option<String>,
    /// Redis connection URL for cross-process room broadcasts. Fan-out stays local when unset.
    pub redis_url: Option<String>,
    /// HS256 secret shared with the identity provider that issues bearer tokens.
    pub jwt_secret: String,
    /// Log level: `error`, `warn`, `info`, `debug`, `trace`.
    pub log_level: String,
    /// Allowed CORS origin of the storefront client.
    pub client_url: Option<String>,
    /// Upper bound for a single Room Store call.
    pub store_timeout: Duration,
    pub pricing: PricingPolicy,
}

impl Config {
    /// Load configuration from environment. Call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let server_addr = std::env::var("SERVER_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:3001".to_string());
        let server_addr: SocketAddr = server_addr
            .parse()
            .map_err(|_| ConfigLoadError::InvalidServerAddr)?;

        let database_url = non_empty_var("DATABASE_URL");
        let redis_url = non_empty_var("REDIS_URL");
        let jwt_secret = std::env::var("JWT_SECRET")
            .unwrap_or_else(|_| "cartroom_jwt_secret_change_in_production_32chars".to_string());
        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let client_url = non_empty_var("CLIENT_URL");

        let store_timeout_ms: u64 = parse_var("STORE_TIMEOUT_MS", 5000)?;
        let defaults = PricingPolicy::default();
        let pricing = PricingPolicy {
            tax_rate: parse_var("TAX_RATE", defaults.tax_rate)?,
            free_shipping_threshold: parse_var(
                "FREE_SHIPPING_THRESHOLD",
                defaults.free_shipping_threshold,
            )?,
            shipping_fee: parse_var("SHIPPING_FEE", defaults.shipping_fee)?,
        };

        Ok(Self {
            server_addr,
            database_url,
            redis_url,
            jwt_secret,
            log_level,
            client_url,
            store_timeout: Duration::from_millis(store_timeout_ms),
            pricing,
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigLoadError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigLoadError::InvalidNumber(key)),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Invalid SERVER_ADDR")]
    InvalidServerAddr,
    #[error("Invalid numeric value for {0}")]
    InvalidNumber(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_var_falls_back_to_default_when_unset() {
        let v: u64 = parse_var("CARTROOM_TEST_SURELY_UNSET_VAR", 42).unwrap();
        assert_eq!(v, 42);
    }
}
