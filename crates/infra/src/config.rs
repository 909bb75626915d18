//! Configuration loading and representation.
//!
//! Sources, later ones winning:
//! 1. built-in defaults (every field has one)
//! 2. an optional TOML/YAML/JSON file
//! 3. `CHRONICLE__<SECTION>__<FIELD>` environment variables
//!    (e.g. `CHRONICLE__REPLAY__BATCH_SIZE=500`)
//!
//! The encryption master key is never part of the file: it is read from
//! `CHRONICLE_ENCRYPTION_KEY` (64 hex characters).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use chronicle_security::{AesCtrHmacEncryption, EncryptionService};

pub const ENCRYPTION_KEY_ENV: &str = "CHRONICLE_ENCRYPTION_KEY";
const ENV_PREFIX: &str = "CHRONICLE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid encryption key in CHRONICLE_ENCRYPTION_KEY: {0}")]
    InvalidKey(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChronicleConfig {
    pub store: StoreConfig,
    pub subscription: SubscriptionConfig,
    pub replay: ReplayConfig,
    pub bus: BusConfig,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Producer identity reported to the bus and in logs.
    pub client_id: String,
    pub encrypt_sensitive_data: bool,
    /// Aggregate type → topic, on top of the built-in table.
    pub topic_overrides: HashMap<String, String>,
    /// Prefix of generated consumer group ids (`<prefix>-<8 hex>`).
    pub consumer_group_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            client_id: "chronicle".to_string(),
            encrypt_sensitive_data: true,
            topic_overrides: HashMap::new(),
            consumer_group_prefix: "chronicle-consumer".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub poll_batch_size: usize,
    pub poll_interval_ms: u64,
    /// Partitions a single subscription works on at the same time.
    pub partitions_consumed_concurrently: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            poll_batch_size: 100,
            poll_interval_ms: 250,
            partitions_consumed_concurrently: 3,
        }
    }
}

impl SubscriptionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub aggregate_lock_ttl_secs: u64,
    pub type_lock_ttl_secs: u64,
    pub view_lock_ttl_secs: u64,
    pub recovery_lock_ttl_secs: u64,
    /// Page size of bulk type replay.
    pub batch_size: u32,
    /// Page size of view rebuilds.
    pub view_page_size: u32,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            aggregate_lock_ttl_secs: 5 * 60,
            type_lock_ttl_secs: 60 * 60,
            view_lock_ttl_secs: 60 * 60,
            recovery_lock_ttl_secs: 24 * 60 * 60,
            batch_size: 100,
            view_page_size: 100,
        }
    }
}

impl ReplayConfig {
    pub fn aggregate_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.aggregate_lock_ttl_secs)
    }

    pub fn type_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.type_lock_ttl_secs)
    }

    pub fn view_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.view_lock_ttl_secs)
    }

    pub fn recovery_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.recovery_lock_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub partitions_per_topic: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            partitions_per_topic: 3,
        }
    }
}

impl ChronicleConfig {
    /// Load defaults, then `path` (if given and present), then the environment.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path).required(false));
        }
        let loaded: ChronicleConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replay.batch_size == 0 || self.replay.view_page_size == 0 {
            return Err(ConfigError::Invalid("replay page sizes must be positive".to_string()));
        }
        if self.subscription.poll_batch_size == 0 {
            return Err(ConfigError::Invalid("poll_batch_size must be positive".to_string()));
        }
        if self.subscription.partitions_consumed_concurrently == 0 {
            return Err(ConfigError::Invalid(
                "partitions_consumed_concurrently must be positive".to_string(),
            ));
        }
        if self.bus.partitions_per_topic == 0 {
            return Err(ConfigError::Invalid("partitions_per_topic must be positive".to_string()));
        }
        Ok(())
    }
}

/// Encryption service from `CHRONICLE_ENCRYPTION_KEY`, if the variable is set.
pub fn encryption_from_env() -> Result<Option<Arc<dyn EncryptionService>>, ConfigError> {
    match std::env::var(ENCRYPTION_KEY_ENV) {
        Ok(hex_key) => encryption_from_hex(&hex_key).map(Some),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::InvalidKey(e.to_string())),
    }
}

pub fn encryption_from_hex(hex_key: &str) -> Result<Arc<dyn EncryptionService>, ConfigError> {
    let service = AesCtrHmacEncryption::from_hex(hex_key)
        .map_err(|e| ConfigError::InvalidKey(e.to_string()))?;
    Ok(Arc::new(service))
}
