//! Configuration loading and representation.
//!
//! Configuration is read from a TOML file (path from `COURIER_CONFIG`, falling
//! back to `config/courier.toml`). Every section has defaults, so a missing file
//! or a partial file is valid. `REDIS_URL` overrides the broker URL.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Environment variable holding the config file path.
pub const CONFIG_PATH_ENV: &str = "COURIER_CONFIG";

/// Config file used when `COURIER_CONFIG` is not set.
pub const DEFAULT_CONFIG_PATH: &str = "config/courier.toml";

/// Environment variable overriding `broker.url`.
pub const REDIS_URL_ENV: &str = "REDIS_URL";

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration {0:?} (expected e.g. \"100ms\", \"5s\", \"2m\")")]
    Duration(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSettings,
    pub log: LogSettings,
    pub broker: BrokerSettings,
    pub queue: QueueSettings,

    /// File the configuration was read from (`None` when defaults were used).
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl AppConfig {
    /// Load configuration from the file named by `COURIER_CONFIG` (or the
    /// default path), then apply environment overrides.
    ///
    /// A missing file is not an error: defaults are returned.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };

        config.apply_overrides(std::env::var(REDIS_URL_ENV).ok());
        config.queue.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let mut config = Self::from_toml_str(&raw)?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.queue.validate()?;
        Ok(config)
    }

    /// Apply environment-sourced overrides.
    pub fn apply_overrides(&mut self, redis_url: Option<String>) {
        if let Some(url) = redis_url.filter(|u| !u.trim().is_empty()) {
            self.broker.url = Some(url);
        }
    }
}

/// Application identity.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub name: String,
    pub version: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            name: "courier".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

/// Logging settings. `RUST_LOG`, when set, takes precedence over `level`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Redis URL (e.g. `redis://localhost:6379`). `None` selects the in-memory broker.
    pub url: Option<String>,
}

/// Queue subsystem settings: connection-wide policy plus per-queue entries
/// keyed by logical queue name.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    #[serde(alias = "rmq")]
    pub connection: ConnectionSettings,
    pub queues: HashMap<String, QueueItemSettings>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        let queues = [
            ("email", "email_queue", 5, 100),
            ("notification", "notification_queue", 3, 50),
            ("data_processing", "data_processing_queue", 8, 200),
        ]
        .into_iter()
        .map(|(logical, name, consumers, prefetch)| {
            (
                logical.to_string(),
                QueueItemSettings {
                    name: name.to_string(),
                    num_consumers: Some(consumers),
                    prefetch_limit: Some(prefetch),
                },
            )
        })
        .collect();

        Self {
            connection: ConnectionSettings::default(),
            queues,
        }
    }
}

impl QueueSettings {
    /// Resolve the effective policy for a logical queue name.
    pub fn queue_config(&self, logical_name: &str) -> Option<QueueConfig> {
        let item = self.queues.get(logical_name)?;
        let conn = &self.connection;

        let broker_name = if item.name.trim().is_empty() {
            logical_name.to_string()
        } else {
            item.name.clone()
        };

        Some(QueueConfig {
            logical_name: logical_name.to_string(),
            broker_name,
            num_consumers: item.num_consumers.unwrap_or(conn.num_consumers),
            prefetch_limit: item.prefetch_limit.unwrap_or(conn.prefetch_limit),
            poll_interval: conn.poll_duration,
            retry_limit: conn.retry_limit,
            retry_delay: conn.retry_delay,
        })
    }

    /// Check the settings for values the queue subsystem cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let conn = &self.connection;

        if conn.tag.trim().is_empty() {
            return Err(ConfigError::Invalid("connection tag must not be empty".into()));
        }
        if conn.poll_duration.is_zero() {
            return Err(ConfigError::Invalid("poll_duration must be greater than zero".into()));
        }
        if conn.report_batch_size == 0 {
            return Err(ConfigError::Invalid("report_batch_size must be at least 1".into()));
        }

        for logical in self.queues.keys() {
            if logical.trim().is_empty() {
                return Err(ConfigError::Invalid("queue names must not be empty".into()));
            }
            // Resolution cannot fail here: the key comes from the map.
            let Some(resolved) = self.queue_config(logical) else {
                continue;
            };
            if resolved.num_consumers == 0 {
                return Err(ConfigError::Invalid(format!(
                    "queue {logical}: num_consumers must be at least 1"
                )));
            }
            if resolved.prefetch_limit == 0 {
                return Err(ConfigError::Invalid(format!(
                    "queue {logical}: prefetch_limit must be at least 1"
                )));
            }
        }

        Ok(())
    }
}

/// Connection-wide queue policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Client identity used for broker connection and consumer names.
    pub tag: String,
    /// Fallback worker count for queues that do not set one.
    pub num_consumers: usize,
    /// Fallback prefetch limit for queues that do not set one.
    pub prefetch_limit: usize,
    /// How often an idle fetcher asks the broker for more work.
    #[serde(deserialize_with = "duration_str::deserialize")]
    pub poll_duration: Duration,
    /// Number of processed deliveries between consumer summary log lines.
    pub report_batch_size: usize,
    pub retry_limit: u32,
    #[serde(deserialize_with = "duration_str::deserialize")]
    pub retry_delay: Duration,
    /// Per-queue wait for in-flight deliveries during shutdown.
    #[serde(deserialize_with = "duration_str::deserialize")]
    pub drain_timeout: Duration,
    /// Wait for all consumers to stop during shutdown.
    #[serde(deserialize_with = "duration_str::deserialize")]
    pub shutdown_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            tag: "courier-queue".to_string(),
            num_consumers: 10,
            prefetch_limit: 1000,
            poll_duration: Duration::from_millis(100),
            report_batch_size: 100,
            retry_limit: 3,
            retry_delay: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-queue entry as written in configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueueItemSettings {
    /// Broker-side queue name; empty means "same as the logical name".
    pub name: String,
    pub num_consumers: Option<usize>,
    pub prefetch_limit: Option<usize>,
}

/// Resolved, immutable policy for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub logical_name: String,
    pub broker_name: String,
    pub num_consumers: usize,
    pub prefetch_limit: usize,
    pub poll_interval: Duration,
    pub retry_limit: u32,
    pub retry_delay: Duration,
}

/// Parse a human duration such as `"250ms"`, `"5s"`, `"1.5m"` or `"2h"`.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let s = raw.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| ConfigError::Duration(raw.to_string()))?;

    let secs_per_unit = match unit.trim() {
        "ms" => 0.001,
        "s" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        _ => return Err(ConfigError::Duration(raw.to_string())),
    };

    Duration::try_from_secs_f64(value * secs_per_unit)
        .map_err(|_| ConfigError::Duration(raw.to_string()))
}

mod duration_str {
    use super::*;
    use serde::de::{self, Deserializer, Visitor};

    struct DurationVisitor;

    impl Visitor<'_> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a duration string like \"5s\" or an integer number of milliseconds")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            parse_duration(v).map_err(E::custom)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_millis(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_millis)
                .map_err(|_| E::custom("duration must not be negative"))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        d.deserialize_any(DurationVisitor)
    }
}
