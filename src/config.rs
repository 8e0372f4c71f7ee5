//! Gateway configuration, loaded from TOML. Every field has a default.

use ethers::types::{H256, U256};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;

use crate::{
    lock::LockSettings,
    state::ChannelSettings,
    validator::PriceTable,
};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which [`AtomicStorage`](crate::storage::AtomicStorage) backs the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Single replica, in-process.
    #[default]
    Memory,
    /// Database file shared by every replica.
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub kind: StorageKind,
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Memory,
            path: PathBuf::from("./paygate.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub lease_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        let defaults = LockSettings::default();
        Self {
            max_attempts: defaults.max_attempts,
            initial_backoff_ms: defaults.initial_backoff.as_millis() as u64,
            max_backoff_ms: defaults.max_backoff.as_millis() as u64,
            lease_ms: defaults.lease.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// When false every call is forwarded without payment checks.
    pub enabled: bool,
    /// Base URL of the ledger indexer. Required when enabled.
    pub endpoint: Option<String>,
    pub refresh_interval_secs: u64,
    pub expiration_threshold_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: None,
            refresh_interval_secs: 30,
            expiration_threshold_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Price of one call in the channel's smallest unit.
    pub price: u64,
    /// Request path to price, overriding `price`.
    pub method_prices: HashMap<String, u64>,
}

impl PricingConfig {
    pub fn table(&self) -> PriceTable {
        PriceTable {
            default_price: U256::from(self.price),
            method_prices: self
                .method_prices
                .iter()
                .map(|(path, price)| (path.clone(), U256::from(*price)))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FreeCallConfig {
    pub enabled: bool,
    pub quota: u64,
}

impl Default for FreeCallConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            quota: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen_addr: String,
    /// Service group this gateway accepts channels for, 0x-prefixed hex.
    pub group_id: String,
    pub storage: StorageConfig,
    pub lock: LockConfig,
    pub ledger: LedgerConfig,
    pub pricing: PricingConfig,
    pub free_call: FreeCallConfig,
    /// Extra compare-and-swap attempts before a concurrency violation.
    pub cas_retries: u32,
    /// Bound on any single storage or ledger round-trip.
    pub operation_timeout_ms: u64,
    pub log_level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7000".to_string(),
            group_id: format!("0x{}", hex::encode([0u8; 32])),
            storage: StorageConfig::default(),
            lock: LockConfig::default(),
            ledger: LedgerConfig::default(),
            pricing: PricingConfig::default(),
            free_call: FreeCallConfig::default(),
            cas_retries: 1,
            operation_timeout_ms: 2_000,
            log_level: "info".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks everything, including that an enabled ledger has an endpoint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_settings()?;
        if self.ledger.enabled && self.ledger.endpoint.is_none() {
            return Err(ConfigError::Invalid(
                "ledger.endpoint is required when the ledger is enabled".into(),
            ));
        }
        Ok(())
    }

    /// Checks everything except where the ledger is reached.
    pub fn validate_settings(&self) -> Result<(), ConfigError> {
        self.group_id()?;
        if self.lock.max_attempts == 0 {
            return Err(ConfigError::Invalid("lock.max_attempts must be at least 1".into()));
        }
        if self.lock.initial_backoff_ms > self.lock.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "lock.initial_backoff_ms exceeds lock.max_backoff_ms".into(),
            ));
        }
        // Locks are not renewed, so a lease must cover the longest authorization.
        let critical_section = self.critical_section_bound();
        if Duration::from_millis(self.lock.lease_ms) <= critical_section {
            return Err(ConfigError::Invalid(format!(
                "lock.lease_ms must exceed the longest authorization ({}ms)",
                critical_section.as_millis()
            )));
        }
        Ok(())
    }

    /// Longest time one authorization can hold its lock: every attempt makes a
    /// storage read, a ledger read and a storage write, each bounded by
    /// `operation_timeout_ms`.
    pub fn critical_section_bound(&self) -> Duration {
        self.operation_timeout()
            .saturating_mul(3)
            .saturating_mul(self.cas_retries.saturating_add(1))
    }

    pub fn group_id(&self) -> Result<H256, ConfigError> {
        let bytes = hex::decode(self.group_id.trim_start_matches("0x"))
            .map_err(|e| ConfigError::Invalid(format!("group_id: {e}")))?;
        if bytes.len() != 32 {
            return Err(ConfigError::Invalid("group_id must be 32 bytes".into()));
        }
        Ok(H256::from_slice(&bytes))
    }

    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            max_attempts: self.lock.max_attempts,
            initial_backoff: Duration::from_millis(self.lock.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.lock.max_backoff_ms),
            lease: Duration::from_millis(self.lock.lease_ms),
        }
    }

    pub fn channel_settings(&self) -> Result<ChannelSettings, ConfigError> {
        Ok(ChannelSettings {
            group_id: self.group_id()?,
            refresh_interval_secs: self.ledger.refresh_interval_secs,
            expiration_threshold_secs: self.ledger.expiration_threshold_secs,
        })
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}
