use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use thiserror::Error;

use crate::cache::DEFAULT_EVENT_TTL;
use crate::currency::RateOverrides;
use crate::ledger::DEFAULT_MAX_RETRIES;
use crate::money::MONETARY_SCALE;
use crate::payment::webhook::DEFAULT_TOLERANCE_SECS;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub gateway: GatewayConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub payment: PaymentConfig,
    /// Rate table overrides, `{FROM: {TO: rate}}`
    #[serde(default)]
    pub rates: RateOverrides,
    /// PostgreSQL ledger store; in-memory when absent
    #[serde(default)]
    pub postgres_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuthConfig {
    /// HS256 secret for caller tokens
    pub jwt_secret: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LedgerConfig {
    pub max_retries: u32,
    pub monetary_scale: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            monetary_scale: MONETARY_SCALE,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PaymentProvider {
    #[default]
    Mock,
    Http,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PaymentConfig {
    pub provider: PaymentProvider,
    pub base_url: String,
    pub api_key: String,
    pub webhook_secret: String,
    pub timeout_ms: u64,
    pub webhook_tolerance_secs: i64,
    /// Header carrying the webhook signature
    pub signature_header: String,
    /// How long processed webhook event ids are remembered
    #[serde(default = "default_event_ttl_secs")]
    pub webhook_event_ttl_secs: u64,
    #[serde(default = "default_event_capacity")]
    pub webhook_event_capacity: usize,
}

fn default_event_ttl_secs() -> u64 {
    DEFAULT_EVENT_TTL.as_secs()
}

fn default_event_capacity() -> usize {
    100_000
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            provider: PaymentProvider::Mock,
            base_url: "http://localhost:12111".to_string(),
            api_key: String::new(),
            webhook_secret: "whsec_dev".to_string(),
            timeout_ms: 10_000,
            webhook_tolerance_secs: DEFAULT_TOLERANCE_SECS,
            signature_header: "x-payment-signature".to_string(),
            webhook_event_ttl_secs: default_event_ttl_secs(),
            webhook_event_capacity: default_event_capacity(),
        }
    }
}

impl PaymentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn webhook_event_ttl(&self) -> Duration {
        Duration::from_secs(self.webhook_event_ttl_secs)
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
            path: config_path.clone(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.jwt_secret.is_empty() {
            return Err(ConfigError::Invalid("auth.jwt_secret is empty".to_string()));
        }
        if self.ledger.monetary_scale != MONETARY_SCALE {
            return Err(ConfigError::Invalid(format!(
                "ledger.monetary_scale must be {}",
                MONETARY_SCALE
            )));
        }
        if self.payment.timeout_ms == 0 {
            return Err(ConfigError::Invalid("payment.timeout_ms must be > 0".to_string()));
        }
        if self.payment.provider == PaymentProvider::Http && self.payment.api_key.is_empty() {
            return Err(ConfigError::Invalid(
                "payment.api_key required for the http provider".to_string(),
            ));
        }
        Ok(())
    }
}
