//! Application configuration.
//!
//! [`AppConfig`] is built in code with [`AppConfig::builder`] or loaded from
//! environment variables with [`AppConfig::from_env`] (a `.env` file is read
//! first when present).
//!
//! | Variable            | Meaning                                          | Default       |
//! |---------------------|--------------------------------------------------|---------------|
//! | `APP_NAME`          | Application name used in logs                    | `event-router`|
//! | `BOOTSTRAP_SERVERS` | Comma-separated broker addresses                 | required      |
//! | `GROUP_ID`          | Consumer group                                   | required      |
//! | `LISTEN_TOPICS`     | Comma-separated topics to consume                | required      |
//! | `CONSUMER_<KEY>`    | Extra consumer setting `<key>` (lowercased)      | none          |
//! | `SHUTDOWN_GRACE_MS` | Drain window for in-flight handlers              | `5000`        |
//! | `RETRY_MAX`         | Transport retries before giving up               | `5`           |
//! | `LOG_FILTER`        | `tracing` filter when `RUST_LOG` is unset        | `info`        |

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Consumer setting key holding the consumer group.
pub const GROUP_ID: &str = "group_id";

/// Default drain window for in-flight suspending handlers.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `consumer_config` has no `group_id`
    #[error("consumer_config must include 'group_id'")]
    MissingGroupId,

    /// No bootstrap server configured
    #[error("At least one bootstrap server is required")]
    NoBootstrapServers,

    /// No topic to consume
    #[error("At least one listen topic is required")]
    NoListenTopics,

    /// A value could not be parsed
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue {
        /// Setting name
        key: String,
        /// Offending value
        value: String,
    },

    /// A required environment variable is not set
    #[error("Missing environment variable {0}")]
    MissingVariable(String),
}

/// A consumer setting value: string or integer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// Integer setting
    Int(i64),
    /// String setting
    Str(String),
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// Backoff settings for transport errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries before a transport error becomes terminal
    pub max_retries: usize,
    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,
    /// Cap on the delay between retries, in milliseconds
    pub max_delay_ms: u64,
    /// Growth factor between retries
    pub multiplier: f64,
    /// Randomise each delay within its upper half
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Router configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application name, attached to log lines
    pub app_name: String,
    /// Broker addresses
    pub bootstrap_servers: Vec<String>,
    /// Consumer settings; must include `group_id`
    pub consumer_config: BTreeMap<String, ConfigValue>,
    /// Topics to consume, in subscription order, without duplicates
    pub listen_topics: Vec<String>,
    /// Drain window for in-flight suspending handlers, in milliseconds
    pub shutdown_grace_ms: u64,
    /// Transport retry settings
    pub retry: RetryConfig,
    /// `tracing` filter directive used when `RUST_LOG` is unset
    pub log_filter: String,
}

impl AppConfig {
    /// Start building a configuration.
    #[must_use]
    pub fn builder() -> AppConfigBuilder {
        AppConfigBuilder::default()
    }

    /// Load configuration from the process environment, reading `.env` first.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a required variable is missing, a value
    /// does not parse, or validation fails.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is the normal case in production.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok(), std::env::vars())
    }

    /// Load configuration through `lookup`, with `vars` supplying the
    /// `CONSUMER_*` pass-through settings.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F, I>(lookup: F, vars: I) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
        I: IntoIterator<Item = (String, String)>,
    {
        let require =
            |name: &str| lookup(name).ok_or_else(|| ConfigError::MissingVariable(name.to_string()));

        let mut builder = Self::builder()
            .bootstrap_servers(split_list(&require("BOOTSTRAP_SERVERS")?))
            .group_id(require("GROUP_ID")?)
            .listen_topics(split_list(&require("LISTEN_TOPICS")?));

        if let Some(name) = lookup("APP_NAME") {
            builder = builder.app_name(name);
        }
        if let Some(ms) = lookup("SHUTDOWN_GRACE_MS") {
            let grace = Duration::from_millis(parse("SHUTDOWN_GRACE_MS", &ms)?);
            builder = builder.shutdown_grace_period(grace);
        }
        if let Some(max) = lookup("RETRY_MAX") {
            builder = builder.retry(RetryConfig {
                max_retries: parse("RETRY_MAX", &max)?,
                ..RetryConfig::default()
            });
        }
        if let Some(filter) = lookup("LOG_FILTER") {
            builder = builder.log_filter(filter);
        }

        for (name, value) in vars {
            if let Some(key) = name.strip_prefix("CONSUMER_") {
                let value = value
                    .parse::<i64>()
                    .map_or_else(|_| ConfigValue::Str(value), ConfigValue::Int);
                builder = builder.consumer_option(key.to_lowercase(), value);
            }
        }

        builder.build()
    }

    /// Check the invariants: servers, topics and a consumer group are present.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.is_empty() {
            return Err(ConfigError::NoBootstrapServers);
        }
        if self.listen_topics.is_empty() {
            return Err(ConfigError::NoListenTopics);
        }
        match self.consumer_config.get(GROUP_ID) {
            Some(ConfigValue::Str(group)) if !group.is_empty() => Ok(()),
            Some(ConfigValue::Int(_)) => Ok(()),
            _ => Err(ConfigError::MissingGroupId),
        }
    }

    /// The consumer group.
    #[must_use]
    pub fn group_id(&self) -> Option<String> {
        self.consumer_config.get(GROUP_ID).map(ToString::to_string)
    }

    /// Broker list in the comma-separated form Kafka clients expect.
    #[must_use]
    pub fn bootstrap_servers_joined(&self) -> String {
        self.bootstrap_servers.join(",")
    }

    /// Drain window for in-flight suspending handlers.
    #[must_use]
    pub const fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Builder for [`AppConfig`].
#[derive(Debug, Clone, Default)]
pub struct AppConfigBuilder {
    app_name: Option<String>,
    bootstrap_servers: Vec<String>,
    consumer_config: BTreeMap<String, ConfigValue>,
    listen_topics: Vec<String>,
    shutdown_grace: Option<Duration>,
    retry: Option<RetryConfig>,
    log_filter: Option<String>,
}

impl AppConfigBuilder {
    /// Set the application name.
    #[must_use]
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    /// Add broker addresses.
    #[must_use]
    pub fn bootstrap_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bootstrap_servers.extend(servers.into_iter().map(Into::into));
        self
    }

    /// Set the consumer group.
    #[must_use]
    pub fn group_id(self, group: impl Into<String>) -> Self {
        self.consumer_option(GROUP_ID, ConfigValue::Str(group.into()))
    }

    /// Set an arbitrary consumer setting.
    #[must_use]
    pub fn consumer_option(
        mut self,
        key: impl Into<String>,
        value: impl Into<ConfigValue>,
    ) -> Self {
        self.consumer_config.insert(key.into(), value.into());
        self
    }

    /// Add a topic to consume. Duplicates are ignored.
    #[must_use]
    pub fn listen_topic(mut self, topic: impl Into<String>) -> Self {
        let topic = topic.into();
        if !self.listen_topics.contains(&topic) {
            self.listen_topics.push(topic);
        }
        self
    }

    /// Add several topics to consume. Duplicates are ignored.
    #[must_use]
    pub fn listen_topics<I, S>(self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        topics
            .into_iter()
            .fold(self, |builder, topic| builder.listen_topic(topic))
    }

    /// Set the drain window for in-flight suspending handlers.
    #[must_use]
    pub const fn shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace = Some(grace);
        self
    }

    /// Set transport retry behaviour.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set the log filter directive.
    #[must_use]
    pub fn log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    /// Build and validate.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if validation fails.
    pub fn build(self) -> Result<AppConfig, ConfigError> {
        let grace = self.shutdown_grace.unwrap_or(DEFAULT_SHUTDOWN_GRACE);
        let config = AppConfig {
            app_name: self.app_name.unwrap_or_else(|| "event-router".to_string()),
            bootstrap_servers: self.bootstrap_servers,
            consumer_config: self.consumer_config,
            listen_topics: self.listen_topics,
            shutdown_grace_ms: u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            retry: self.retry.unwrap_or_default(),
            log_filter: self.log_filter.unwrap_or_else(|| "info".to_string()),
        };
        config.validate()?;
        Ok(config)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn load(vars: &HashMap<String, String>) -> Result<AppConfig, ConfigError> {
        AppConfig::from_lookup(|k| vars.get(k).cloned(), vars.clone())
    }

    #[test]
    fn builder_applies_defaults() {
        let config = AppConfig::builder()
            .app_name("Test application")
            .bootstrap_servers(["127.0.0.1:9092"])
            .group_id("test_app_group")
            .listen_topic("test_topic")
            .build()
            .unwrap();

        assert_eq!(config.app_name, "Test application");
        assert_eq!(config.group_id().as_deref(), Some("test_app_group"));
        assert_eq!(config.shutdown_grace_period(), DEFAULT_SHUTDOWN_GRACE);
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn listen_topics_keep_order_without_duplicates() {
        let config = AppConfig::builder()
            .bootstrap_servers(["b:9092"])
            .group_id("g")
            .listen_topics(["test_topic", "other", "test_topic"])
            .build()
            .unwrap();

        assert_eq!(config.listen_topics, vec!["test_topic", "other"]);
    }

    #[test]
    fn validation_requires_group_servers_and_topics() {
        let missing_group = AppConfig::builder()
            .bootstrap_servers(["b:9092"])
            .listen_topic("t")
            .build();
        assert_eq!(missing_group.unwrap_err(), ConfigError::MissingGroupId);

        let missing_servers = AppConfig::builder().group_id("g").listen_topic("t").build();
        assert_eq!(missing_servers.unwrap_err(), ConfigError::NoBootstrapServers);

        let missing_topics = AppConfig::builder()
            .bootstrap_servers(["b:9092"])
            .group_id("g")
            .build();
        assert_eq!(missing_topics.unwrap_err(), ConfigError::NoListenTopics);
    }

    #[test]
    fn loads_from_environment_variables() {
        let vars = env(&[
            ("APP_NAME", "orders"),
            ("BOOTSTRAP_SERVERS", "a:9092, b:9092"),
            ("GROUP_ID", "orders-group"),
            ("LISTEN_TOPICS", "test_topic,other"),
            ("SHUTDOWN_GRACE_MS", "250"),
            ("RETRY_MAX", "2"),
            ("CONSUMER_AUTO_OFFSET_RESET", "earliest"),
            ("CONSUMER_SESSION_TIMEOUT_MS", "6000"),
            ("UNRELATED", "ignored"),
        ]);

        let config = load(&vars).unwrap();

        assert_eq!(config.app_name, "orders");
        assert_eq!(config.bootstrap_servers_joined(), "a:9092,b:9092");
        assert_eq!(config.listen_topics, vec!["test_topic", "other"]);
        assert_eq!(config.shutdown_grace_period(), Duration::from_millis(250));
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(
            config.consumer_config.get("auto_offset_reset"),
            Some(&ConfigValue::from("earliest"))
        );
        assert_eq!(
            config.consumer_config.get("session_timeout_ms"),
            Some(&ConfigValue::Int(6000))
        );
    }

    #[test]
    fn missing_variable_is_reported() {
        let vars = env(&[("BOOTSTRAP_SERVERS", "a:9092"), ("GROUP_ID", "g")]);
        assert_eq!(
            load(&vars).unwrap_err(),
            ConfigError::MissingVariable("LISTEN_TOPICS".to_string())
        );
    }

    #[test]
    fn unparsable_value_is_reported() {
        let vars = env(&[
            ("BOOTSTRAP_SERVERS", "a:9092"),
            ("GROUP_ID", "g"),
            ("LISTEN_TOPICS", "t"),
            ("SHUTDOWN_GRACE_MS", "soon"),
        ]);
        assert!(matches!(
            load(&vars).unwrap_err(),
            ConfigError::InvalidValue { key, .. } if key == "SHUTDOWN_GRACE_MS"
        ));
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = AppConfig::builder()
            .bootstrap_servers(["b:9092"])
            .group_id("g")
            .consumer_option("max_poll_records", 10)
            .listen_topic("t")
            .build()
            .unwrap();

        let json = serde_json::to_string(&config).unwrap();
        let back: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
