//! Run settings loaded from TOML.
//!
//! Every field is optional. API keys may also come from the
//! `AVRETURNS_API_KEYS` environment variable (comma separated), which takes
//! precedence over the file.

use crate::keys::{KeyPool, PoolError};
use crate::provider::{
    HttpApi, PriceFetcher, TransportError, DEFAULT_BASE_URL, MAX_TRANSPORT_RETRIES,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable that overrides `api_keys`.
pub const API_KEYS_ENV: &str = "AVRETURNS_API_KEYS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no api keys configured (set api_keys or {env})", env = API_KEYS_ENV)]
    NoApiKeys,

    #[error("max_hits_per_minute must be positive")]
    InvalidThreshold,

    #[error("max_transport_retries must be at most {max}, got {0}", max = MAX_TRANSPORT_RETRIES)]
    TooManyRetries(u32),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Http(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub api_keys: Vec<String>,
    pub base_url: String,
    pub max_hits_per_minute: u32,
    pub cooldown_secs: u64,
    pub http_timeout_secs: u64,
    pub max_transport_retries: u32,
    pub bucket: String,
    pub store_root: PathBuf,
    pub holdings_csv: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            max_hits_per_minute: 5,
            cooldown_secs: 60,
            http_timeout_secs: 30,
            max_transport_retries: 2,
            bucket: "pricing".to_string(),
            store_root: PathBuf::from("store"),
            holdings_csv: PathBuf::from("holdings.csv"),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse settings from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Replace `api_keys` with the comma-separated list in `value`, if any.
    pub fn apply_key_override(&mut self, value: Option<&str>) {
        let Some(value) = value else { return };
        let keys: Vec<String> = value
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(String::from)
            .collect();
        if !keys.is_empty() {
            self.api_keys = keys;
        }
    }

    /// Apply overrides from the process environment.
    pub fn with_env(mut self) -> Self {
        let value = std::env::var(API_KEYS_ENV).ok();
        self.apply_key_override(value.as_deref());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_keys.iter().all(|k| k.trim().is_empty()) {
            return Err(ConfigError::NoApiKeys);
        }
        if self.max_hits_per_minute == 0 {
            return Err(ConfigError::InvalidThreshold);
        }
        if self.max_transport_retries > MAX_TRANSPORT_RETRIES {
            return Err(ConfigError::TooManyRetries(self.max_transport_retries));
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Key pool that sleeps through cooldowns.
    pub fn key_pool(&self) -> Result<KeyPool, ConfigError> {
        self.validate()?;
        let keys = self
            .api_keys
            .iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        Ok(KeyPool::with_sleep(
            keys,
            self.max_hits_per_minute,
            self.cooldown(),
        )?)
    }

    /// Fetcher backed by the HTTP endpoint.
    pub fn price_fetcher(&self) -> Result<PriceFetcher, ConfigError> {
        let api = HttpApi::new(self.base_url.clone(), self.http_timeout())?;
        Ok(PriceFetcher::new(Box::new(api))
            .with_transport_retries(self.max_transport_retries, Duration::from_millis(500)))
    }
}
