//! Transfer manager configuration
//!
//! Configuration is plain data with `Default` values matching the
//! production parameters, and can be loaded from or saved to TOML.

use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Sending pipeline parameters
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Persistent state location
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Sending pipeline parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Maximum outgoing throughput in bytes per second (0 = unlimited)
    #[serde(default = "default_max_throughput")]
    pub max_throughput: u64,

    /// Timeout handed to the network for each batch send
    #[serde(default = "default_send_timeout", with = "duration_ms")]
    pub send_timeout: Duration,

    /// Time a sent part may stay unconfirmed before it is resent
    #[serde(default = "default_resend_wait", with = "duration_ms")]
    pub resend_wait: Duration,

    /// Minimum number of parts per batch
    #[serde(default = "default_min_parts_per_batch")]
    pub min_parts_per_batch: usize,

    /// Maximum number of parts per batch
    #[serde(default = "default_max_parts_per_batch")]
    pub max_parts_per_batch: usize,

    /// Capacity of the unsent part queue
    #[serde(default = "default_queue_len")]
    pub batch_queue_len: usize,

    /// Capacity of the batch send queue
    #[serde(default = "default_queue_len")]
    pub send_queue_len: usize,

    /// Capacity of the resend-check queue
    #[serde(default = "default_queue_len")]
    pub sent_queue_len: usize,

    /// Number of concurrent sending workers
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Idle time after which a partial batch is sent
    #[serde(default = "default_batch_poll_interval", with = "duration_ms")]
    pub batch_poll_interval: Duration,

    /// How long to wait for a round to resolve
    #[serde(default = "default_round_results_timeout", with = "duration_ms")]
    pub round_results_timeout: Duration,
}

/// Persistent state location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding transfer state
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_max_throughput() -> u64 {
    150_000 // 150 kB/s
}

fn default_send_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_resend_wait() -> Duration {
    Duration::from_secs(30)
}

fn default_min_parts_per_batch() -> usize {
    1
}

fn default_max_parts_per_batch() -> usize {
    11
}

fn default_queue_len() -> usize {
    10_000
}

fn default_worker_threads() -> usize {
    4
}

fn default_batch_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_round_results_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_state_dir() -> PathBuf {
    std::env::temp_dir().join("shardcast")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_throughput: default_max_throughput(),
            send_timeout: default_send_timeout(),
            resend_wait: default_resend_wait(),
            min_parts_per_batch: default_min_parts_per_batch(),
            max_parts_per_batch: default_max_parts_per_batch(),
            batch_queue_len: default_queue_len(),
            send_queue_len: default_queue_len(),
            sent_queue_len: default_queue_len(),
            worker_threads: default_worker_threads(),
            batch_poll_interval: default_batch_poll_interval(),
            round_results_timeout: default_round_results_timeout(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl TransferConfig {
    /// Delay between batch emissions that keeps the average outgoing rate
    /// under `max_throughput`, for messages of `max_message_length` bytes.
    #[must_use]
    pub fn batch_delay(&self, max_message_length: usize) -> Duration {
        if self.max_throughput == 0 {
            return Duration::ZERO;
        }

        let avg_parts = (self.min_parts_per_batch + self.max_parts_per_batch) as f64 / 2.0;
        let avg_send_size = avg_parts * max_message_length as f64;
        Duration::from_secs_f64(avg_send_size / self.max_throughput as f64)
    }

    /// Validate pipeline parameters
    ///
    /// # Errors
    ///
    /// Returns `TransferError::InvalidConfig` describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.min_parts_per_batch == 0 {
            return Err(TransferError::invalid_config(
                "min_parts_per_batch must be at least 1",
            ));
        }
        if self.max_parts_per_batch < self.min_parts_per_batch {
            return Err(TransferError::invalid_config(
                "max_parts_per_batch must not be below min_parts_per_batch",
            ));
        }
        if self.worker_threads == 0 {
            return Err(TransferError::invalid_config(
                "worker_threads must be at least 1",
            ));
        }
        if self.batch_queue_len == 0 || self.send_queue_len == 0 || self.sent_queue_len == 0 {
            return Err(TransferError::invalid_config(
                "queue lengths must be at least 1",
            ));
        }
        if self.batch_poll_interval.is_zero() {
            return Err(TransferError::invalid_config(
                "batch_poll_interval must be non-zero",
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns `TransferError::InvalidConfig` if any section is invalid.
    pub fn validate(&self) -> Result<()> {
        self.transfer.validate()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(TransferError::InvalidConfig(
                format!(
                    "Invalid log level: {}. Must be one of: {}",
                    self.logging.level,
                    valid_log_levels.join(", ")
                )
                .into(),
            ));
        }

        Ok(())
    }
}

/// Durations are stored as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = TransferConfig::default();
        assert_eq!(config.min_parts_per_batch, 1);
        assert_eq!(config.max_parts_per_batch, 11);
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.batch_queue_len, 10_000);
        assert_eq!(config.round_results_timeout, Duration::from_secs(15));
        assert_eq!(config.batch_poll_interval, Duration::from_millis(100));
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_batch_delay() {
        let config = TransferConfig {
            max_throughput: 6_000,
            min_parts_per_batch: 1,
            max_parts_per_batch: 11,
            ..Default::default()
        };
        // 6 parts of 1000 bytes at 6000 B/s
        assert_eq!(config.batch_delay(1_000), Duration::from_secs(1));

        let unlimited = TransferConfig {
            max_throughput: 0,
            ..Default::default()
        };
        assert_eq!(unlimited.batch_delay(1_000), Duration::ZERO);
    }

    #[test]
    fn test_validate_rejects_bad_batch_bounds() {
        let config = TransferConfig {
            min_parts_per_batch: 5,
            max_parts_per_batch: 2,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TransferError::InvalidConfig(_))
        ));

        let config = TransferConfig {
            worker_threads: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/shardcast.toml");

        let mut config = Config::default();
        config.transfer.resend_wait = Duration::from_millis(2_500);
        config.transfer.max_throughput = 42;
        config.storage.state_dir = temp_dir.path().join("state");

        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [transfer]
            resend_wait = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.transfer.resend_wait, Duration::from_millis(500));
        assert_eq!(config.transfer.max_parts_per_batch, 11);
        assert_eq!(config.logging.level, "info");
    }
}
