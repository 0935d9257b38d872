//! Configuration management for Courier
//!
//! Defaults, TOML files and `COURIER_<SECTION>_<KEY>` environment overrides,
//! all funnelled through [`Config::validate`].

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Realtime gateway limits
    pub gateway: GatewayConfig,

    /// Pending-ack retry scheduler
    pub retry: RetryConfig,

    /// Presence monitor
    pub presence: PresenceConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Gateway configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Largest accepted batch acknowledgment
    pub max_batch_size: usize,

    /// Messages returned per chat by incremental sync
    pub sync_page_size: usize,

    /// Upper bound on any single backend call
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
}

/// Retry scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Tick interval; acks younger than this are not looked at
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Backoff base: retry N waits `base_interval * 2^N`
    #[serde(with = "humantime_serde")]
    pub base_interval: Duration,

    /// Attempts before an ack is given up
    pub max_retries: u32,

    /// Age after which a new-message ack also goes out as a push notification
    #[serde(with = "humantime_serde")]
    pub push_fallback_after: Duration,

    /// Minimum spacing between two pushes for the same ack
    #[serde(with = "humantime_serde")]
    pub push_min_interval: Duration,

    /// How often the retention sweep runs
    #[serde(with = "humantime_serde")]
    pub purge_interval: Duration,

    /// Acks older than this are purged regardless of retry count
    #[serde(with = "humantime_serde")]
    pub retention: Duration,

    /// Acks loaded per tick
    pub batch_size: usize,

    /// Upper bound on any single backend or push call
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
}

/// Presence monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// How often stale users are swept
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Heartbeat period clients are expected to keep
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Silence after which a user is flipped offline
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Upper bound on any single backend call
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include timestamps
    pub with_timestamp: bool,

    /// Include target module
    pub with_target: bool,
}

/// Metrics configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Register metric descriptions at startup
    pub enabled: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            sync_page_size: 50,
            io_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            base_interval: Duration::from_secs(3),
            max_retries: 5,
            push_fallback_after: Duration::from_secs(30),
            push_min_interval: Duration::from_secs(300),
            purge_interval: Duration::from_secs(3600),
            retention: Duration::from_secs(24 * 3600),
            batch_size: 500,
            io_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Earliest age at which the final attempt can run:
    /// `base_interval * (2^max_retries - 1)`, saturating
    pub fn last_attempt_after(&self) -> Duration {
        let factor = 1u32
            .checked_shl(self.max_retries)
            .map_or(u32::MAX, |f| f - 1);
        self.base_interval
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(75),
            io_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn parse_var<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Env {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn duration_var(key: &str) -> Result<Option<Duration>, ConfigError> {
    match env::var(key) {
        Ok(raw) => humantime_serde::re::humantime::parse_duration(&raw)
            .map(Some)
            .map_err(|e| ConfigError::Env {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: COURIER_<SECTION>_<KEY>
    /// Example: COURIER_RETRY_BASE_INTERVAL=3s
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay environment variables on top of the current values
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        // Gateway config
        if let Some(v) = parse_var("COURIER_GATEWAY_MAX_BATCH_SIZE")? {
            self.gateway.max_batch_size = v;
        }
        if let Some(v) = parse_var("COURIER_GATEWAY_SYNC_PAGE_SIZE")? {
            self.gateway.sync_page_size = v;
        }
        if let Some(v) = duration_var("COURIER_GATEWAY_IO_TIMEOUT")? {
            self.gateway.io_timeout = v;
        }

        // Retry config
        if let Some(v) = duration_var("COURIER_RETRY_POLL_INTERVAL")? {
            self.retry.poll_interval = v;
        }
        if let Some(v) = duration_var("COURIER_RETRY_BASE_INTERVAL")? {
            self.retry.base_interval = v;
        }
        if let Some(v) = parse_var("COURIER_RETRY_MAX_RETRIES")? {
            self.retry.max_retries = v;
        }
        if let Some(v) = duration_var("COURIER_RETRY_PUSH_FALLBACK_AFTER")? {
            self.retry.push_fallback_after = v;
        }
        if let Some(v) = duration_var("COURIER_RETRY_PUSH_MIN_INTERVAL")? {
            self.retry.push_min_interval = v;
        }
        if let Some(v) = duration_var("COURIER_RETRY_RETENTION")? {
            self.retry.retention = v;
        }

        // Presence config
        if let Some(v) = duration_var("COURIER_PRESENCE_SWEEP_INTERVAL")? {
            self.presence.sweep_interval = v;
        }
        if let Some(v) = duration_var("COURIER_PRESENCE_HEARTBEAT_INTERVAL")? {
            self.presence.heartbeat_interval = v;
        }
        if let Some(v) = duration_var("COURIER_PRESENCE_TIMEOUT")? {
            self.presence.timeout = v;
        }

        // Logging config
        if let Ok(level) = env::var("COURIER_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(v) = parse_var("COURIER_LOG_JSON")? {
            self.logging.json_format = v;
        }

        // Metrics config
        if let Some(v) = parse_var("COURIER_METRICS_ENABLED")? {
            self.metrics.enabled = v;
        }

        Ok(())
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(name: &str, value: Duration) -> Result<(), ConfigError> {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
            Ok(())
        }

        // Validate gateway config
        if self.gateway.max_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "max_batch_size must be greater than 0".to_string(),
            ));
        }
        if self.gateway.sync_page_size == 0 {
            return Err(ConfigError::Invalid(
                "sync_page_size must be greater than 0".to_string(),
            ));
        }
        positive("gateway.io_timeout", self.gateway.io_timeout)?;

        // Validate retry config
        positive("retry.poll_interval", self.retry.poll_interval)?;
        positive("retry.base_interval", self.retry.base_interval)?;
        positive("retry.purge_interval", self.retry.purge_interval)?;
        positive("retry.io_timeout", self.retry.io_timeout)?;
        if self.retry.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "max_retries must be greater than 0".to_string(),
            ));
        }
        if self.retry.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "retry batch_size must be greater than 0".to_string(),
            ));
        }
        if self.retry.push_fallback_after <= self.retry.base_interval {
            return Err(ConfigError::Invalid(
                "push_fallback_after must be longer than base_interval".to_string(),
            ));
        }
        if self.retry.push_min_interval <= self.retry.base_interval {
            return Err(ConfigError::Invalid(
                "push_min_interval must be longer than base_interval".to_string(),
            ));
        }
        // Pushes only go out on a retry attempt
        if self.retry.push_fallback_after > self.retry.last_attempt_after() {
            return Err(ConfigError::Invalid(format!(
                "push_fallback_after ({:?}) is past the last retry attempt ({:?})",
                self.retry.push_fallback_after,
                self.retry.last_attempt_after()
            )));
        }
        if self.retry.retention <= self.retry.push_fallback_after {
            return Err(ConfigError::Invalid(
                "retention must be longer than push_fallback_after".to_string(),
            ));
        }

        // Validate presence config
        positive("presence.sweep_interval", self.presence.sweep_interval)?;
        positive("presence.heartbeat_interval", self.presence.heartbeat_interval)?;
        positive("presence.io_timeout", self.presence.io_timeout)?;
        if self.presence.timeout <= self.presence.heartbeat_interval {
            return Err(ConfigError::Invalid(
                "presence timeout must exceed heartbeat_interval".to_string(),
            ));
        }

        // Validate logging config
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let contents = self.to_toml()?;
        let path = path.as_ref();
        std::fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
