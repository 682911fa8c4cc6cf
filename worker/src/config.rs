//! Configuration management for the worker.
//!
//! Loads configuration from environment variables with sensible defaults.
//! `DATABASE_URL` and `CLASSIFIER_API_KEY` are required; everything else
//! falls back to a default.
//!
//! | Variable | Default |
//! |---|---|
//! | `DATABASE_URL` | required |
//! | `DB_MAX_CONNECTIONS` | `25` |
//! | `REDPANDA_BROKERS` | `localhost:9092` |
//! | `CONSUMER_GROUP` | `hound` |
//! | `PUBLISH_TIMEOUT_SECS` | `5` |
//! | `HTTP_ADDR` | `0.0.0.0:8080` |
//! | `METRICS_ADDR` | unset (metrics disabled) |
//! | `CLASSIFIER_API_KEY` | required |
//! | `CLASSIFIER_MODEL` | `claude-3-5-haiku-latest` |
//! | `CLASSIFIER_API_URL` | `https://api.anthropic.com/v1` |
//! | `MAX_DELIVERY_ATTEMPTS` | `5` (0 = unbounded) |
//! | `RETRY_INITIAL_DELAY_MS` | `200` |
//! | `RETRY_MAX_DELAY_MS` | `10000` |

use hound_runtime::RetryPolicy;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("Environment variable not set: {0}")]
    Missing(&'static str),

    /// A variable is set but cannot be parsed.
    #[error("Invalid value for {var}: '{value}'")]
    Invalid {
        /// Variable name
        var: &'static str,
        /// Offending value
        value: String,
    },

    /// Values parse but do not make sense together.
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// `PostgreSQL` configuration
    pub database: DatabaseConfig,
    /// Redpanda configuration
    pub broker: BrokerConfig,
    /// HTTP listeners
    pub server: ServerConfig,
    /// Intent classifier configuration
    pub classifier: ClassifierConfig,
    /// Redelivery policy
    pub retry: RetryConfig,
}

/// `PostgreSQL` configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

/// Redpanda configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker addresses (comma-separated)
    pub brokers: String,
    /// Consumer group prefix
    pub consumer_group: String,
    /// How long a publish may wait for broker confirmation
    pub publish_timeout: Duration,
}

/// HTTP listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Webhook and health endpoint address
    pub http_addr: SocketAddr,
    /// Prometheus scrape endpoint address, if metrics are enabled
    pub metrics_addr: Option<SocketAddr>,
}

/// Intent classifier configuration.
#[derive(Clone)]
pub struct ClassifierConfig {
    /// API key
    pub api_key: String,
    /// Model name
    pub model: String,
    /// Base URL of the messages API
    pub api_url: String,
}

impl std::fmt::Debug for ClassifierConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassifierConfig")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("api_url", &self.api_url)
            .finish()
    }
}

/// Redelivery configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Deliveries before a message is dead-lettered (0 = unbounded)
    pub max_attempts: u32,
    /// Delay before the first redelivery
    pub initial_delay: Duration,
    /// Cap on the redelivery delay
    pub max_delay: Duration,
}

impl WorkerConfig {
    /// Load configuration from the process environment.
    ///
    /// Call `dotenvy::dotenv()` first to pick up a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing, a value does
    /// not parse, or validation fails.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let config = Self {
            database: DatabaseConfig {
                url: env.required("DATABASE_URL")?,
                max_connections: env.parse_or("DB_MAX_CONNECTIONS", 25)?,
            },
            broker: BrokerConfig {
                brokers: env.string_or("REDPANDA_BROKERS", "localhost:9092"),
                consumer_group: env.string_or("CONSUMER_GROUP", "hound"),
                publish_timeout: Duration::from_secs(env.parse_or("PUBLISH_TIMEOUT_SECS", 5)?),
            },
            server: ServerConfig {
                http_addr: env.parse_or("HTTP_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
                metrics_addr: env.parse_optional("METRICS_ADDR")?,
            },
            classifier: ClassifierConfig {
                api_key: env.required("CLASSIFIER_API_KEY")?,
                model: env.string_or("CLASSIFIER_MODEL", "claude-3-5-haiku-latest"),
                api_url: env.string_or("CLASSIFIER_API_URL", "https://api.anthropic.com/v1"),
            },
            retry: RetryConfig {
                max_attempts: env.parse_or("MAX_DELIVERY_ATTEMPTS", 5)?,
                initial_delay: Duration::from_millis(env.parse_or("RETRY_INITIAL_DELAY_MS", 200)?),
                max_delay: Duration::from_millis(env.parse_or("RETRY_MAX_DELAY_MS", 10_000)?),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::Validation`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.database.validate()?;
        self.broker.validate()?;
        self.server.validate()?;
        self.classifier.validate()?;
        self.retry.validate()
    }
}

impl DatabaseConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for an empty URL or a zero-sized pool.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::Validation("DATABASE_URL is empty".to_string()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Validation(
                "DB_MAX_CONNECTIONS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl BrokerConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for empty brokers or group, or a zero timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.trim().is_empty() {
            return Err(ConfigError::Validation("REDPANDA_BROKERS is empty".to_string()));
        }
        if self.consumer_group.trim().is_empty() {
            return Err(ConfigError::Validation("CONSUMER_GROUP is empty".to_string()));
        }
        if self.publish_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "PUBLISH_TIMEOUT_SECS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl ServerConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if both listeners share an address.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.metrics_addr == Some(self.http_addr) {
            return Err(ConfigError::Validation(format!(
                "METRICS_ADDR and HTTP_ADDR are both {}",
                self.http_addr
            )));
        }
        Ok(())
    }
}

impl ClassifierConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for an empty key, model or URL.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::Validation("CLASSIFIER_API_KEY is empty".to_string()));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::Validation("CLASSIFIER_MODEL is empty".to_string()));
        }
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            return Err(ConfigError::Validation(format!(
                "CLASSIFIER_API_URL is not an http(s) URL: {}",
                self.api_url
            )));
        }
        Ok(())
    }
}

impl RetryConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the initial delay exceeds the cap.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_delay > self.max_delay {
            return Err(ConfigError::Validation(format!(
                "RETRY_INITIAL_DELAY_MS ({}) exceeds RETRY_MAX_DELAY_MS ({})",
                self.initial_delay.as_millis(),
                self.max_delay.as_millis()
            )));
        }
        Ok(())
    }

    /// The consumer redelivery policy.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(self.max_attempts)
            .initial_delay(self.initial_delay)
            .max_delay(self.max_delay)
            .build()
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Set and non-blank.
    fn get(&self, var: &str) -> Option<String> {
        (self.lookup)(var).filter(|value| !value.trim().is_empty())
    }

    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        self.get(var).ok_or(ConfigError::Missing(var))
    }

    fn string_or(&self, var: &str, default: &str) -> String {
        self.get(var).unwrap_or_else(|| default.to_string())
    }

    fn parse_optional<T: FromStr>(&self, var: &'static str) -> Result<Option<T>, ConfigError> {
        self.get(var)
            .map(|value| {
                value.trim().parse().map_err(|_| ConfigError::Invalid {
                    var,
                    value: value.clone(),
                })
            })
            .transpose()
    }

    fn parse_or<T: FromStr>(&self, var: &'static str, default: T) -> Result<T, ConfigError> {
        Ok(self.parse_optional(var)?.unwrap_or(default))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)] // Test code can use unwrap/panic
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        WorkerConfig::from_lookup(|var| vars.get(var).cloned())
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("DATABASE_URL", "postgres://localhost/hound"),
        ("CLASSIFIER_API_KEY", "sk-test"),
    ];

    #[test]
    fn defaults_apply_when_only_required_vars_are_set() {
        let config = load(&REQUIRED).unwrap();

        assert_eq!(config.database.max_connections, 25);
        assert_eq!(config.broker.brokers, "localhost:9092");
        assert_eq!(config.broker.consumer_group, "hound");
        assert_eq!(config.broker.publish_timeout, Duration::from_secs(5));
        assert_eq!(config.server.http_addr, "0.0.0.0:8080".parse().unwrap());
        assert!(config.server.metrics_addr.is_none());
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(200));
        assert_eq!(config.retry.max_delay, Duration::from_secs(10));
    }

    #[test]
    fn missing_database_url_is_reported() {
        let err = load(&[("CLASSIFIER_API_KEY", "sk-test")]).unwrap_err();
        assert_eq!(err, ConfigError::Missing("DATABASE_URL"));
    }

    #[test]
    fn blank_api_key_counts_as_missing() {
        let err = load(&[REQUIRED[0], ("CLASSIFIER_API_KEY", "  ")]).unwrap_err();
        assert_eq!(err, ConfigError::Missing("CLASSIFIER_API_KEY"));
    }

    #[test]
    fn unparseable_numbers_are_invalid() {
        let err = load(&[REQUIRED[0], REQUIRED[1], ("DB_MAX_CONNECTIONS", "lots")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                var: "DB_MAX_CONNECTIONS",
                value: "lots".to_string(),
            }
        );
    }

    #[test]
    fn zero_pool_fails_validation() {
        let err = load(&[REQUIRED[0], REQUIRED[1], ("DB_MAX_CONNECTIONS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn backoff_bounds_must_be_ordered() {
        let err = load(&[
            REQUIRED[0],
            REQUIRED[1],
            ("RETRY_INITIAL_DELAY_MS", "5000"),
            ("RETRY_MAX_DELAY_MS", "100"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn listeners_must_not_collide() {
        let err = load(&[
            REQUIRED[0],
            REQUIRED[1],
            ("HTTP_ADDR", "127.0.0.1:8080"),
            ("METRICS_ADDR", "127.0.0.1:8080"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn retry_policy_carries_configured_values() {
        let config = load(&[REQUIRED[0], REQUIRED[1], ("MAX_DELIVERY_ATTEMPTS", "0")]).unwrap();
        let policy = config.retry.policy();
        assert_eq!(policy.max_attempts, 0);
        assert_eq!(policy.initial_delay, Duration::from_millis(200));
    }

    #[test]
    fn api_key_is_not_printed() {
        let config = load(&REQUIRED).unwrap();
        let printed = format!("{:?}", config.classifier);
        assert!(!printed.contains("sk-test"));
    }
}
