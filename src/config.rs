//! Application configuration
//!
//! One `AppConfig` deserialized from YAML with environment overrides for
//! secrets. Components receive the pieces they need through constructor
//! parameters; nothing reads configuration globally at runtime.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::exchange::rate_limit::RateLimitThresholds;
use crate::exchange::rest::RestClientConfig;
use crate::reconciler::ReconcilerConfig;
use crate::types::{Scope, TradingMode};

/// Environment variable overriding `api_key`.
pub const ENV_API_KEY: &str = "PERPETUA_API_KEY";
/// Environment variable overriding `api_secret`.
pub const ENV_API_SECRET: &str = "PERPETUA_API_SECRET";
/// Environment variable overriding `database_url`.
pub const ENV_DATABASE_URL: &str = "PERPETUA_DATABASE_URL";

fn default_mode() -> TradingMode {
    TradingMode::Testnet
}

fn default_account_id() -> String {
    "main".to_string()
}

fn default_symbol() -> String {
    "XRPUSDT".to_string()
}

fn default_database_url() -> String {
    "sqlite://perpetua.db".to_string()
}

fn default_rest_base_url() -> String {
    "https://testnet.binancefuture.com".to_string()
}

fn default_ws_base_url() -> String {
    "wss://stream.binancefuture.com".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_log_file() -> String {
    "perpetua.log".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_normal_poll_secs() -> u64 {
    30
}

fn default_fallback_poll_secs() -> u64 {
    5
}

fn default_ledger_poll_secs() -> u64 {
    2
}

fn default_projector_poll_millis() -> u64 {
    500
}

fn default_weight_warn() -> u32 {
    1800
}

fn default_weight_slow() -> u32 {
    2100
}

fn default_weight_stop() -> u32 {
    2300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    // Trading context
    #[serde(default = "default_mode")]
    pub mode: TradingMode,
    #[serde(default = "default_account_id")]
    pub account_id: String,
    #[serde(default = "default_symbol")]
    pub symbol: String,

    // Storage
    #[serde(default = "default_database_url")]
    pub database_url: String,

    // Exchange endpoints and credentials
    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,
    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    // Rate-limit thresholds (request weight per minute)
    #[serde(default = "default_weight_warn")]
    pub rate_limit_warn: u32,
    #[serde(default = "default_weight_slow")]
    pub rate_limit_slow: u32,
    #[serde(default = "default_weight_stop")]
    pub rate_limit_stop: u32,

    // Poll cadences
    #[serde(default = "default_normal_poll_secs")]
    pub reconcile_normal_secs: u64,
    #[serde(default = "default_fallback_poll_secs")]
    pub reconcile_fallback_secs: u64,
    #[serde(default = "default_projector_poll_millis")]
    pub projector_poll_millis: u64,
    #[serde(default = "default_ledger_poll_secs")]
    pub ledger_poll_secs: u64,

    // Logging
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    #[serde(default = "default_rotation")]
    pub rotation: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub use_json: bool,
    #[serde(default = "default_true")]
    pub enable_tracing: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty config deserializes with defaults")
    }
}

impl AppConfig {
    /// Load from a YAML file and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let mut config: AppConfig = serde_yaml::from_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Secrets never live in the YAML file in production; the environment
    /// wins whenever it is set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var(ENV_API_KEY) {
            self.api_key = key;
        }
        if let Ok(secret) = std::env::var(ENV_API_SECRET) {
            self.api_secret = secret;
        }
        if let Ok(url) = std::env::var(ENV_DATABASE_URL) {
            self.database_url = url;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rate_limit_warn >= self.rate_limit_slow
            || self.rate_limit_slow >= self.rate_limit_stop
        {
            anyhow::bail!(
                "rate limit thresholds must be ordered warn < slow < stop (got {} / {} / {})",
                self.rate_limit_warn,
                self.rate_limit_slow,
                self.rate_limit_stop
            );
        }
        if self.symbol.is_empty() {
            anyhow::bail!("symbol must not be empty");
        }
        Ok(())
    }

    pub fn scope(&self) -> Scope {
        Scope::binance_futures(self.account_id.clone(), self.mode)
    }

    pub fn rest_client_config(&self) -> RestClientConfig {
        RestClientConfig {
            base_url: self.rest_base_url.clone(),
            api_key: self.api_key.clone(),
            api_secret: self.api_secret.clone(),
            timeout: Duration::from_secs(self.request_timeout_secs),
            max_retries: self.max_retries,
            rate_limits: RateLimitThresholds {
                warn: self.rate_limit_warn,
                slow: self.rate_limit_slow,
                stop: self.rate_limit_stop,
            },
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            normal_interval: Duration::from_secs(self.reconcile_normal_secs),
            fallback_interval: Duration::from_secs(self.reconcile_fallback_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.mode, TradingMode::Testnet);
        assert_eq!(config.symbol, "XRPUSDT");
        assert_eq!(config.reconcile_normal_secs, 30);
        assert_eq!(config.reconcile_fallback_secs, 5);
        assert_eq!(config.request_timeout_secs, 30);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_yaml() {
        let config: AppConfig = serde_yaml::from_str(
            r#"
            mode: production
            symbol: BTCUSDT
            rest_base_url: https://fapi.binance.com
            "#,
        )
        .unwrap();
        assert_eq!(config.mode, TradingMode::Production);
        assert_eq!(config.symbol, "BTCUSDT");
        // untouched fields keep their defaults
        assert_eq!(config.account_id, "main");
    }

    #[test]
    fn test_threshold_ordering_enforced() {
        let mut config = AppConfig::default();
        config.rate_limit_slow = config.rate_limit_stop;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_scope_matches_mode() {
        let config = AppConfig::default();
        let scope = config.scope();
        assert_eq!(scope.exchange, "BINANCE");
        assert_eq!(scope.venue, "FUTURES");
        assert_eq!(scope.mode, "testnet");
    }
}
