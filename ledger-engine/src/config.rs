//! Configuration for the ledger engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Digits after the decimal point of the wallet currency (2 for INR)
    pub minor_digits: u32,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Deposit/transfer ceilings
    pub limits: LimitsConfig,

    /// Version-conflict retry policy
    pub retry: RetryConfig,

    /// Background reconciliation
    pub reconciler: ReconcilerConfig,

    /// Transaction history paging
    pub history: HistoryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/ledger"),
            service_name: "ledger-engine".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            minor_digits: 2,
            rocksdb: RocksDBConfig::default(),
            limits: LimitsConfig::default(),
            retry: RetryConfig::default(),
            reconciler: ReconcilerConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            enable_statistics: false,
        }
    }
}

/// Ceiling for one operation kind
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitPolicy {
    /// When false the kind is unlimited
    pub enabled: bool,

    /// Maximum total amount per window (minor units)
    pub max_amount_per_window: i64,

    /// Maximum operations per window
    pub max_count_per_window: u32,

    /// Maximum amount of a single operation (minor units)
    pub max_single_amount: i64,
}

impl Default for LimitPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_amount_per_window: 10_000_000, // ₹1,00,000
            max_count_per_window: 100,
            max_single_amount: 10_000_000,
        }
    }
}

impl LimitPolicy {
    /// Policy that never denies
    pub fn unlimited() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Longest accepted limit window, one leap year
pub const MAX_WINDOW_HOURS: i64 = 24 * 366;

/// Limit guard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Rolling window length (hours)
    pub window_hours: i64,

    /// Add-money ceiling
    pub deposit: LimitPolicy,

    /// Outgoing transfer ceiling
    pub transfer: LimitPolicy,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            window_hours: 24,
            deposit: LimitPolicy {
                enabled: true,
                max_amount_per_window: 1_000_000, // ₹10,000 per day
                max_count_per_window: 10,
                max_single_amount: 1_000_000,
            },
            transfer: LimitPolicy::default(),
        }
    }
}

/// Retry configuration for version conflicts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,

    /// Delay before the first retry (milliseconds)
    pub initial_delay_ms: u64,

    /// Cap on any single delay (milliseconds)
    pub max_delay_ms: u64,

    /// Exponential growth factor
    pub backoff_multiplier: f64,

    /// Fraction of the delay randomised either way
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 2,
            max_delay_ms: 100,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

/// Reconciler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Run the periodic background pass
    pub enabled: bool,

    /// Seconds between background passes
    pub interval_secs: u64,

    /// Append adjustment entries for drifted accounts
    pub auto_correct: bool,

    /// Mailbox capacity of the reconciler task
    pub mailbox_capacity: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600,
            auto_correct: false,
            mailbox_capacity: 64,
        }
    }
}

/// History paging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Largest page size a caller may request
    pub max_page_size: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { max_page_size: 100 }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Some(limit) = env_parse::<i64>("LEDGER_DEPOSIT_DAILY_LIMIT")? {
            config.limits.deposit.max_amount_per_window = limit;
        }

        if let Some(limit) = env_parse::<i64>("LEDGER_TRANSFER_DAILY_LIMIT")? {
            config.limits.transfer.max_amount_per_window = limit;
        }

        if let Some(secs) = env_parse::<u64>("LEDGER_RECONCILE_INTERVAL_SECS")? {
            config.reconciler.interval_secs = secs;
        }

        if let Some(auto) = env_parse::<bool>("LEDGER_AUTO_CORRECT")? {
            config.reconciler.auto_correct = auto;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.limits.window_hours <= 0 || self.limits.window_hours > MAX_WINDOW_HOURS {
            return Err(crate::Error::Config(format!(
                "limits.window_hours must be between 1 and {}, got {}",
                MAX_WINDOW_HOURS, self.limits.window_hours
            )));
        }
        for (name, policy) in [
            ("deposit", &self.limits.deposit),
            ("transfer", &self.limits.transfer),
        ] {
            if policy.enabled
                && (policy.max_amount_per_window <= 0 || policy.max_single_amount <= 0)
            {
                return Err(crate::Error::Config(format!(
                    "limits.{} amounts must be positive",
                    name
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(crate::Error::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.reconciler.enabled && self.reconciler.interval_secs == 0 {
            return Err(crate::Error::Config(
                "reconciler.interval_secs must be positive".to_string(),
            ));
        }
        if self.history.max_page_size == 0 {
            return Err(crate::Error::Config(
                "history.max_page_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> crate::Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| crate::Error::Config(format!("{} has invalid value {:?}", key, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "ledger-engine");
        assert_eq!(config.limits.window_hours, 24);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            data_dir = "/var/lib/quickpe"

            [limits.deposit]
            max_amount_per_window = 40000

            [reconciler]
            auto_correct = true
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/quickpe"));
        assert_eq!(config.limits.deposit.max_amount_per_window, 40_000);
        assert!(config.limits.deposit.enabled);
        assert!(config.reconciler.auto_correct);
        assert_eq!(config.reconciler.interval_secs, 3600);
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_validate_bounds_window_hours() {
        let mut config = Config::default();
        config.limits.window_hours = MAX_WINDOW_HOURS;
        assert!(config.validate().is_ok());

        config.limits.window_hours = i64::MAX / 2;
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));

        let parsed: Config = toml::from_str(
            r#"
            [limits]
            window_hours = 4611686018427387903
            "#,
        )
        .unwrap();
        assert!(matches!(parsed.validate(), Err(crate::Error::Config(_))));
    }
}
