mod error;

pub use error::DriftError;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::app::AppType;
use crate::broker::{AckPolicy, Broker, ConsumerSpec, ReplayPolicy};
use crate::error::{Error, Result};
use crate::registry::{ConsumerRegistry, ConsumerSettings};
use crate::topic::durable_name;

/// Pull consumer configuration for a durable subscription to `topic`.
#[must_use]
pub fn consumer_spec(durable: &str, topic: &str, settings: &ConsumerSettings) -> ConsumerSpec {
    ConsumerSpec {
        durable_name: Some(durable.to_string()),
        name: None,
        filter_subject: topic.to_string(),
        ack_policy: AckPolicy::Explicit,
        ack_wait: settings.ack_wait,
        max_deliver: settings.max_deliver,
        backoff: settings.backoff.clone(),
        max_ack_pending: settings.max_ack_pending,
        deliver_policy: settings.deliver_policy,
        replay_policy: ReplayPolicy::Instant,
        inactive_threshold: settings.inactive_threshold,
    }
}

/// Compares an observed consumer configuration with the expected one.
///
/// # Errors
///
/// Returns the first mismatching field.
pub fn validate(observed: &ConsumerSpec, expected: &ConsumerSpec) -> std::result::Result<(), DriftError> {
    if observed.deliver_policy != expected.deliver_policy {
        return Err(DriftError::DeliverPolicy {
            observed: observed.deliver_policy,
            expected: expected.deliver_policy,
        });
    }

    if observed.ack_wait != expected.ack_wait {
        return Err(DriftError::AckWait {
            observed: observed.ack_wait,
            expected: expected.ack_wait,
        });
    }

    if observed.max_deliver != expected.max_deliver {
        return Err(DriftError::MaxDeliver {
            observed: observed.max_deliver,
            expected: expected.max_deliver,
        });
    }

    if observed.backoff != expected.backoff {
        return Err(DriftError::Backoff {
            observed: observed.backoff.clone(),
            expected: expected.backoff.clone(),
        });
    }

    if observed.max_ack_pending != expected.max_ack_pending {
        return Err(DriftError::MaxAckPending {
            observed: observed.max_ack_pending,
            expected: expected.max_ack_pending,
        });
    }

    Ok(())
}

/// Creates durable pull consumers on demand and memoizes their handles.
#[derive(Debug)]
pub struct ConsumerManager<B>
where
    B: Broker,
{
    broker: B,
    registry: Arc<ConsumerRegistry>,
    cache: RwLock<HashMap<String, B::Consumer>>,
}

impl<B> ConsumerManager<B>
where
    B: Broker,
{
    /// Creates a manager resolving settings from `registry`.
    pub fn new(broker: B, registry: Arc<ConsumerRegistry>) -> Self {
        Self {
            broker,
            registry,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the durable consumer for `topic`, creating or updating it on first use.
    ///
    /// Concurrent callers for the same topic share one broker call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Broker`] if the broker rejects the consumer.
    #[instrument(skip(self))]
    pub async fn ensure_consumer(
        &self,
        stream: &str,
        topic: &str,
        app_type: AppType,
    ) -> Result<B::Consumer> {
        let durable = durable_name(app_type, topic);

        if let Some(consumer) = self.cache.read().await.get(&durable) {
            return Ok(consumer.clone());
        }

        let mut cache = self.cache.write().await;
        if let Some(consumer) = cache.get(&durable) {
            debug!(durable = %durable, "consumer created by a concurrent caller");
            return Ok(consumer.clone());
        }

        let settings = self.registry.resolve(app_type, topic);
        let consumer = self
            .broker
            .create_or_update_consumer(stream, consumer_spec(&durable, topic, &settings))
            .await
            .map_err(Error::broker)?;

        info!(
            durable = %durable,
            ack_wait = ?settings.ack_wait,
            max_deliver = settings.max_deliver,
            max_ack_pending = settings.max_ack_pending,
            "consumer ready"
        );
        cache.insert(durable, consumer.clone());

        Ok(consumer)
    }

    /// Validates the server-side configuration of the consumer for `topic` against the
    /// settings the registry resolves now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Drift`] on mismatch or [`Error::Broker`] if the lookup fails.
    pub async fn check_drift(&self, stream: &str, topic: &str, app_type: AppType) -> Result<()> {
        let durable = durable_name(app_type, topic);
        let observed = self
            .broker
            .consumer_spec(stream, &durable)
            .await
            .map_err(Error::broker)?;
        let expected = consumer_spec(&durable, topic, &self.registry.resolve(app_type, topic));

        validate(&observed, &expected)?;
        Ok(())
    }

    /// Number of memoized consumer handles.
    pub async fn cached(&self) -> usize {
        self.cache.read().await.len()
    }
}
