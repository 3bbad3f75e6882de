// src/config.rs

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dedup::DedupConfig;
use crate::error::{ConfigError, FetchError};
use crate::retry::RetryPolicy;

/// Everything the engine needs from its host process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub concurrency: ConcurrencyLimits,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub fallback: FallbackPolicy,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Wall-clock ceiling for the pre-commit stages of one transaction.
    #[serde(default = "default_transaction_timeout_secs")]
    pub transaction_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyLimits {
    /// Segment fetches in flight across all transactions.
    #[serde(default = "default_max_segment_fetches")]
    pub max_segment_fetches: usize,
    /// Transactions driven at the same time.
    #[serde(default = "default_max_transactions")]
    pub max_transactions: usize,
    /// Shared bandwidth cap; 0 disables it.
    #[serde(default)]
    pub max_bytes_per_sec: u64,
}

/// When a failed direct download may fall back to segmented assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackPolicy {
    /// Fall back once transient failures have used up the retry budget.
    #[serde(default = "default_true")]
    pub on_exhausted_retries: bool,
    /// Terminal statuses that still warrant trying the manifest.
    #[serde(default = "default_fallback_statuses")]
    pub on_statuses: Vec<u16>,
    #[serde(default = "default_true")]
    pub on_content_type_mismatch: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Per-transaction scratch directories live here.
    #[serde(default = "default_temp_root")]
    pub temp_root: PathBuf,
    /// Destination templates resolve below this directory.
    #[serde(default = "default_destination_root")]
    pub destination_root: PathBuf,
}

fn default_transaction_timeout_secs() -> u64 {
    3600
}
fn default_user_agent() -> String {
    concat!("odm-media/", env!("CARGO_PKG_VERSION")).to_string()
}
fn default_max_segment_fetches() -> usize {
    4
}
fn default_max_transactions() -> usize {
    2
}
fn default_true() -> bool {
    true
}
fn default_fallback_statuses() -> Vec<u16> {
    vec![401, 403, 404, 410]
}
fn default_database_path() -> PathBuf {
    PathBuf::from("odm-media.db")
}
fn default_temp_root() -> PathBuf {
    PathBuf::from("downloads/.odm-tmp")
}
fn default_destination_root() -> PathBuf {
    PathBuf::from("downloads")
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            max_segment_fetches: default_max_segment_fetches(),
            max_transactions: default_max_transactions(),
            max_bytes_per_sec: 0,
        }
    }
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            on_exhausted_retries: true,
            on_statuses: default_fallback_statuses(),
            on_content_type_mismatch: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            temp_root: default_temp_root(),
            destination_root: default_destination_root(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencyLimits::default(),
            retry: RetryPolicy::default(),
            dedup: DedupConfig::default(),
            fallback: FallbackPolicy::default(),
            storage: StorageConfig::default(),
            transaction_timeout_secs: default_transaction_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl FallbackPolicy {
    /// Whether the last direct-download error permits the segmented tier.
    pub fn allows(&self, last_error: &FetchError, exhausted_transient: bool) -> bool {
        if exhausted_transient {
            return self.on_exhausted_retries;
        }
        match last_error {
            FetchError::Status(code) => self.on_statuses.contains(code),
            FetchError::UnexpectedContentType(_) => self.on_content_type_mismatch,
            _ => false,
        }
    }
}

impl EngineConfig {
    /// Loads a TOML config file; absent keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Storage paths rooted at one directory; used by embedders and tests.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            storage: StorageConfig {
                database_path: root.join("odm-media.db"),
                temp_root: root.join("tmp"),
                destination_root: root.join("library"),
            },
            ..Self::default()
        }
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency.max_segment_fetches == 0 {
            return Err(ConfigError::Invalid(
                "concurrency.max_segment_fetches must be at least 1".into(),
            ));
        }
        if self.concurrency.max_transactions == 0 {
            return Err(ConfigError::Invalid(
                "concurrency.max_transactions must be at least 1".into(),
            ));
        }
        if self.transaction_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "transaction_timeout_secs must be positive".into(),
            ));
        }
        self.retry.validate()?;
        self.dedup.validate()?;
        Ok(())
    }
}
