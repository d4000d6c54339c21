mod error;

pub use error::ConfigError;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::AppType;
use crate::registry::{ConsumerRegistry, ConsumerSettings};
use crate::topic::TopicPolicy;

/// Top-level bus configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Role of this process.
    pub app_type: AppType,

    /// Maximum handed-out deliveries awaiting a decision, per subscriber.
    pub ack_concurrency: usize,

    /// Messages requested per pull.
    pub fetch_batch: usize,

    /// How long a pull waits for messages.
    #[serde(with = "humantime_serde")]
    pub fetch_max_wait: Duration,

    /// Whether counters are recorded.
    pub metrics_enabled: bool,

    /// Topic prefixes the role may not use; `None` uses the role's default.
    pub forbidden_prefixes: Option<Vec<String>>,

    /// Consumer registry overlays.
    pub consumers: ConsumerOverrides,

    /// Delayed scheduler settings.
    pub delayed: DelayedConfig,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            app_type: AppType::Backend,
            ack_concurrency: 50,
            fetch_batch: 10,
            fetch_max_wait: Duration::from_secs(5),
            metrics_enabled: true,
            forbidden_prefixes: None,
            consumers: ConsumerOverrides::default(),
            delayed: DelayedConfig::default(),
        }
    }
}

/// Registry overlays as written in config.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsumerOverrides {
    /// Replacement for the built-in defaults.
    pub defaults: Option<ConsumerSettings>,

    /// Per-role overlays.
    pub apps: HashMap<AppType, ConsumerSettings>,

    /// Per-topic overlays.
    pub topics: HashMap<String, ConsumerSettings>,
}

/// Delayed scheduler settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DelayedConfig {
    /// Ack wait of per-round processor consumers.
    #[serde(with = "humantime_serde")]
    pub ack_wait: Duration,

    /// Ack-pending ceiling of per-round processor consumers.
    pub max_ack_pending: i64,

    /// Per-fetch timeout during recovery.
    #[serde(with = "humantime_serde")]
    pub recovery_fetch_timeout: Duration,

    /// Timeout for deleting the recovery consumer.
    #[serde(with = "humantime_serde")]
    pub consumer_delete_timeout: Duration,
}

impl Default for DelayedConfig {
    fn default() -> Self {
        Self {
            ack_wait: Duration::from_secs(30),
            max_ack_pending: 1000,
            recovery_fetch_timeout: Duration::from_secs(5),
            consumer_delete_timeout: Duration::from_secs(10),
        }
    }
}

impl EventBusConfig {
    /// Default configuration for a role.
    #[must_use]
    pub fn for_app(app_type: AppType) -> Self {
        Self {
            app_type,
            ..Self::default()
        }
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or fails validation.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_toml_str(&contents)
    }

    /// Checks ranges and broker constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ack_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "ack_concurrency must be greater than zero".to_string(),
            ));
        }

        if self.fetch_batch == 0 {
            return Err(ConfigError::Invalid(
                "fetch_batch must be greater than zero".to_string(),
            ));
        }

        let overlays = self
            .consumers
            .defaults
            .iter()
            .map(|settings| ("defaults".to_string(), settings))
            .chain(
                self.consumers
                    .apps
                    .iter()
                    .map(|(app, settings)| (format!("apps.{app}"), settings)),
            )
            .chain(
                self.consumers
                    .topics
                    .iter()
                    .map(|(topic, settings)| (format!("topics.{topic}"), settings)),
            );

        for (name, settings) in overlays {
            let backoff_len = i64::try_from(settings.backoff.len()).unwrap_or(i64::MAX);
            if settings.max_deliver > 0 && settings.max_deliver <= backoff_len {
                return Err(ConfigError::Invalid(format!(
                    "consumers.{name}: max_deliver ({}) must exceed the number of backoff steps ({backoff_len})",
                    settings.max_deliver
                )));
            }
        }

        Ok(())
    }

    /// Applies the consumer overlays to a registry.
    pub fn seed_registry(&self, registry: &ConsumerRegistry) {
        if let Some(defaults) = &self.consumers.defaults {
            registry.set_default(defaults.clone());
        }
        for (app_type, settings) in &self.consumers.apps {
            registry.set_for_app(*app_type, settings.clone());
        }
        for (topic, settings) in &self.consumers.topics {
            registry.set_for_topic(topic.clone(), settings.clone());
        }
    }

    /// The authorization policy this config describes.
    #[must_use]
    pub fn topic_policy(&self) -> TopicPolicy {
        self.forbidden_prefixes.as_ref().map_or_else(
            || TopicPolicy::for_app(self.app_type),
            |prefixes| TopicPolicy::new(self.app_type, prefixes.clone()),
        )
    }
}
