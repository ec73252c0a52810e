use crate::pool::{PoolOptions, PopOrder, Transport};
use crate::utils::error::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Pool tuning. Durations are milliseconds; 0 disables the limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default)]
    pub min_idle_conns: usize,
    #[serde(default = "default_pop_order")]
    pub pop_order: String, // "lifo" or "fifo"
    #[serde(default)]
    pub max_conn_age_ms: u64,
    #[serde(default = "default_pool_timeout_ms")]
    pub pool_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_idle_check_frequency_ms")]
    pub idle_check_frequency_ms: u64,
    #[serde(default = "default_dial_retry_interval_ms")]
    pub dial_retry_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default = "default_target_address")]
    pub address: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
    #[serde(default = "default_hold_ms")]
    pub hold_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String, // "json" or "pretty"
}

// Default values
fn default_pool_size() -> usize {
    10
}

fn default_pop_order() -> String {
    "lifo".to_string()
}

fn default_pool_timeout_ms() -> u64 {
    4_000
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_idle_check_frequency_ms() -> u64 {
    60_000
}

fn default_dial_retry_interval_ms() -> u64 {
    1_000
}

fn default_target_address() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_workers() -> usize {
    16
}

fn default_duration_secs() -> u64 {
    10
}

fn default_hold_ms() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            min_idle_conns: 0,
            pop_order: default_pop_order(),
            max_conn_age_ms: 0,
            pool_timeout_ms: default_pool_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            idle_check_frequency_ms: default_idle_check_frequency_ms(),
            dial_retry_interval_ms: default_dial_retry_interval_ms(),
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            address: default_target_address(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            duration_secs: default_duration_secs(),
            hold_ms: default_hold_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn optional_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl PoolSettings {
    pub fn pop_order(&self) -> Result<PopOrder> {
        match self.pop_order.as_str() {
            "lifo" => Ok(PopOrder::Lifo),
            "fifo" => Ok(PopOrder::Fifo),
            other => Err(PoolError::Config(format!(
                "Invalid pop_order: {}. Must be 'lifo' or 'fifo'",
                other
            ))),
        }
    }

    /// Apply these settings on top of options that already carry a dialer.
    pub fn apply<T: Transport>(&self, opts: PoolOptions<T>) -> Result<PoolOptions<T>> {
        Ok(opts
            .pool_size(self.pool_size)
            .min_idle_conns(self.min_idle_conns)
            .pop_order(self.pop_order()?)
            .max_conn_age(optional_millis(self.max_conn_age_ms))
            .pool_timeout(Duration::from_millis(self.pool_timeout_ms))
            .idle_timeout(optional_millis(self.idle_timeout_ms))
            .idle_check_frequency(optional_millis(self.idle_check_frequency_ms))
            .dial_retry_interval(Duration::from_millis(self.dial_retry_interval_ms)))
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| PoolError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| PoolError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.pool.pool_size == 0 {
            return Err(PoolError::Config(
                "pool.pool_size must be greater than 0".to_string(),
            ));
        }

        if self.pool.min_idle_conns > self.pool.pool_size {
            return Err(PoolError::Config(format!(
                "pool.min_idle_conns ({}) cannot exceed pool.pool_size ({})",
                self.pool.min_idle_conns, self.pool.pool_size
            )));
        }

        self.pool.pop_order()?;

        if self.pool.dial_retry_interval_ms == 0 {
            return Err(PoolError::Config(
                "pool.dial_retry_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.target.address.trim().is_empty() {
            return Err(PoolError::Config(
                "target.address cannot be empty".to_string(),
            ));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(PoolError::Config(format!(
                "Invalid log format: {}. Must be 'pretty' or 'json'",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example<P: AsRef<Path>>(path: P) -> Result<()> {
        let example = r#"[pool]
pool_size = 10
min_idle_conns = 2
pop_order = "lifo"  # Options: "lifo", "fifo"
max_conn_age_ms = 0  # 0 disables
pool_timeout_ms = 4000
idle_timeout_ms = 300000  # 0 disables
idle_check_frequency_ms = 60000  # 0 disables the reaper
dial_retry_interval_ms = 1000

[target]
address = "127.0.0.1:6379"
connect_timeout_ms = 5000

[load]
workers = 16
duration_secs = 10
hold_ms = 5

[logging]
level = "info"  # Options: "trace", "debug", "info", "warn", "error"
format = "pretty"  # Options: "pretty", "json"
"#;

        std::fs::write(path.as_ref(), example).map_err(|e| {
            PoolError::Config(format!("Failed to write example config: {}", e))
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pool.pool_size, 10);
        assert_eq!(config.pool.pop_order().unwrap(), PopOrder::Lifo);
        assert_eq!(config.target.address, "127.0.0.1:6379");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.pool.pool_size = 0;
        assert!(config.validate().is_err());

        config.pool.pool_size = 2;
        config.pool.min_idle_conns = 3;
        assert!(config.validate().is_err());

        config.pool.min_idle_conns = 2;
        assert!(config.validate().is_ok());

        config.pool.pop_order = "random".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.target.address = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_example_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connpool.toml");

        Config::create_example(&path).unwrap();
        let config = Config::from_file(&path).unwrap();

        assert_eq!(config.pool.min_idle_conns, 2);
        assert_eq!(config.load.workers, 16);
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
[pool]
pool_size = 3
idle_timeout_ms = 0
"#,
        )
        .unwrap();

        assert_eq!(config.pool.pool_size, 3);
        assert_eq!(config.pool.pool_timeout_ms, 4_000);
        assert_eq!(config.load.hold_ms, 5);
        assert_eq!(optional_millis(config.pool.idle_timeout_ms), None);
        assert_eq!(
            optional_millis(config.pool.idle_check_frequency_ms),
            Some(Duration::from_secs(60))
        );
    }
}
