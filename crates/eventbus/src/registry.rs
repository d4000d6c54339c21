use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::app::AppType;
use crate::broker::DeliverPolicy;

/// Durable consumer settings for one topic.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// Time before an unacknowledged delivery is redelivered.
    #[serde(with = "humantime_serde")]
    pub ack_wait: Duration,

    /// Delivery attempts before the broker gives up.
    pub max_deliver: i64,

    /// Per-attempt redelivery delays; attempt `k` uses `backoff[min(k, len - 1)]`.
    #[serde(with = "duration_list")]
    pub backoff: Vec<Duration>,

    /// Ceiling on unacknowledged in-flight deliveries.
    pub max_ack_pending: i64,

    /// Starting point for new consumers.
    pub deliver_policy: DeliverPolicy,

    /// Idle cleanup for ephemeral consumers; zero for durables.
    #[serde(with = "humantime_serde")]
    pub inactive_threshold: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            ack_wait: Duration::from_secs(60),
            max_deliver: 5,
            backoff: vec![
                Duration::from_secs(5),
                Duration::from_secs(15),
                Duration::from_secs(30),
                Duration::from_secs(60),
            ],
            max_ack_pending: 100,
            deliver_policy: DeliverPolicy::All,
            inactive_threshold: Duration::ZERO,
        }
    }
}

impl ConsumerSettings {
    /// Redelivery delay for a message on its `num_delivered`-th attempt.
    #[must_use]
    pub fn nak_delay(&self, num_delivered: u64) -> Option<Duration> {
        let last = self.backoff.len().checked_sub(1)?;
        let attempt = usize::try_from(num_delivered.saturating_sub(1)).unwrap_or(usize::MAX);
        self.backoff.get(attempt.min(last)).copied()
    }
}

mod duration_list {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(durations: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(
            durations
                .iter()
                .map(|duration| humantime::format_duration(*duration).to_string()),
        )
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|raw| humantime::parse_duration(raw).map_err(serde::de::Error::custom))
            .collect()
    }
}

#[derive(Debug, Default)]
struct Overlays {
    defaults: ConsumerSettings,
    by_app: HashMap<AppType, ConsumerSettings>,
    by_topic: HashMap<String, ConsumerSettings>,
}

/// Per-topic consumer settings with topic > app > default precedence.
#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    overlays: RwLock<Overlays>,
}

impl ConsumerRegistry {
    /// A registry holding only the built-in defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings for `topic` as consumed by `app_type`.
    #[must_use]
    pub fn resolve(&self, app_type: AppType, topic: &str) -> ConsumerSettings {
        let overlays = self.overlays.read();

        overlays
            .by_topic
            .get(topic)
            .or_else(|| overlays.by_app.get(&app_type))
            .unwrap_or(&overlays.defaults)
            .clone()
    }

    /// Replaces the global defaults.
    pub fn set_default(&self, settings: ConsumerSettings) {
        self.overlays.write().defaults = settings;
    }

    /// Replaces the overlay for a role.
    pub fn set_for_app(&self, app_type: AppType, settings: ConsumerSettings) {
        self.overlays.write().by_app.insert(app_type, settings);
    }

    /// Replaces the overlay for a topic.
    pub fn set_for_topic(&self, topic: impl Into<String>, settings: ConsumerSettings) {
        self.overlays.write().by_topic.insert(topic.into(), settings);
    }
}
