use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::app::AppType;
use crate::broker::Broker;
use crate::config::EventBusConfig;
use crate::consumers::ConsumerManager;
use crate::delayed::{DelayedScheduler, RecoverySummary};
use crate::envelope::Envelope;
use crate::error::Result;
use crate::health::{BrokerConnectionCheck, HealthChecker, StreamPlaneCheck};
use crate::metrics::EventBusMetrics;
use crate::publisher::Publisher;
use crate::registry::ConsumerRegistry;
use crate::streams::StreamProvisioner;
use crate::subscriber::{Subscriber, SubscriberOptions};
use crate::topic::stream_for_topic;

/// The event bus for one deployment role.
///
/// Construction provisions the role's streams. Publishing and subscribing are gated by
/// the role's topic policy; delayed messages are scheduled through the same gate.
#[derive(Debug)]
pub struct EventBus<B>
where
    B: Broker,
{
    broker: B,
    config: EventBusConfig,
    registry: Arc<ConsumerRegistry>,
    streams: Arc<StreamProvisioner<B>>,
    consumers: Arc<ConsumerManager<B>>,
    publisher: Arc<Publisher<B>>,
    subscriber: Subscriber<B>,
    delayed: DelayedScheduler<B>,
}

impl<B> EventBus<B>
where
    B: Broker,
{
    /// Validates `config`, seeds the consumer registry and provisions the role's streams.
    ///
    /// `metrics` is replaced by a no-op recorder when `config.metrics_enabled` is false.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] for invalid configuration or
    /// [`crate::Error::Broker`] if a stream cannot be created.
    #[instrument(skip_all, fields(app_type = %config.app_type))]
    pub async fn new(broker: B, config: EventBusConfig, metrics: EventBusMetrics) -> Result<Self> {
        config.validate()?;

        let metrics = if config.metrics_enabled {
            metrics
        } else {
            EventBusMetrics::disabled()
        };

        let registry = Arc::new(ConsumerRegistry::new());
        config.seed_registry(&registry);

        let policy = config.topic_policy();
        let streams = Arc::new(StreamProvisioner::new(broker.clone()));
        let consumers = Arc::new(ConsumerManager::new(broker.clone(), registry.clone()));
        let publisher = Arc::new(Publisher::new(
            broker.clone(),
            policy.clone(),
            metrics.clone(),
        ));
        let subscriber = Subscriber::new(
            streams.clone(),
            consumers.clone(),
            registry.clone(),
            policy,
            SubscriberOptions {
                fetch_batch: config.fetch_batch,
                fetch_max_wait: config.fetch_max_wait,
                ack_concurrency: config.ack_concurrency,
            },
            metrics.clone(),
        );
        let delayed = DelayedScheduler::new(
            broker.clone(),
            publisher.clone(),
            config.delayed.clone(),
            config.fetch_max_wait,
            metrics,
        );

        streams.ensure_streams(config.app_type).await?;
        info!("event bus ready");

        Ok(Self {
            broker,
            config,
            registry,
            streams,
            consumers,
            publisher,
            subscriber,
            delayed,
        })
    }

    /// Like [`EventBus::new`], registering metrics on `registry` when enabled.
    ///
    /// # Errors
    ///
    /// Also returns [`crate::Error::Metrics`] if the collectors are already registered.
    pub async fn with_prometheus(
        broker: B,
        config: EventBusConfig,
        registry: &prometheus::Registry,
    ) -> Result<Self> {
        let metrics = if config.metrics_enabled {
            EventBusMetrics::new(registry)?
        } else {
            EventBusMetrics::disabled()
        };

        Self::new(broker, config, metrics).await
    }

    /// Role of this process.
    pub const fn app_type(&self) -> AppType {
        self.config.app_type
    }

    /// The configuration in force.
    pub const fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// The consumer settings registry, for runtime overrides.
    ///
    /// Overrides only affect consumers created after the change.
    pub const fn registry(&self) -> &Arc<ConsumerRegistry> {
        &self.registry
    }

    /// The stream provisioner.
    pub const fn streams(&self) -> &Arc<StreamProvisioner<B>> {
        &self.streams
    }

    /// The consumer manager.
    pub const fn consumers(&self) -> &Arc<ConsumerManager<B>> {
        &self.consumers
    }

    /// The delayed scheduler.
    pub const fn delayed(&self) -> &DelayedScheduler<B> {
        &self.delayed
    }

    /// Publishes `envelopes` to `topic`, or to each envelope's `topic` metadata when empty.
    ///
    /// # Errors
    ///
    /// See [`Publisher::publish`].
    pub async fn publish(&self, topic: &str, envelopes: &[Envelope]) -> Result<()> {
        self.publisher.publish(topic, envelopes).await
    }

    /// Subscribes to `topic` until `cx` is cancelled or the bus closes.
    ///
    /// # Errors
    ///
    /// See [`Subscriber::subscribe`].
    pub async fn subscribe(
        &self,
        cx: &CancellationToken,
        topic: &str,
    ) -> Result<flume::Receiver<Envelope>> {
        self.subscriber.subscribe(cx, topic).await
    }

    /// Terminates, rather than redelivers, messages nacked on `topic` from now on.
    pub fn terminate_topic(&self, topic: impl Into<String>) {
        let topic = topic.into();
        info!(topic = %topic, "nacks will terminate");
        self.subscriber.terminations().mark(topic);
    }

    /// Restores redelivery for `topic`. Returns whether it was marked.
    pub fn resume_topic(&self, topic: &str) -> bool {
        self.subscriber.terminations().unmark(topic)
    }

    /// Schedules `payload` for publication on `original_subject` at `execute_at`.
    ///
    /// # Errors
    ///
    /// See [`DelayedScheduler::schedule_envelope`].
    pub async fn schedule(
        &self,
        original_subject: &str,
        round_id: &str,
        execute_at: DateTime<Utc>,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.delayed
            .schedule(original_subject, round_id, execute_at, payload)
            .await
    }

    /// Cancels a round's delayed messages, returning how many were purged.
    ///
    /// # Errors
    ///
    /// See [`DelayedScheduler::cancel`].
    pub async fn cancel(&self, round_id: &str) -> Result<u64> {
        self.delayed.cancel(round_id).await
    }

    /// Restarts processors for rounds still pending from a previous run.
    pub async fn recover(&self, cx: &CancellationToken) -> RecoverySummary {
        self.delayed.recover(cx).await
    }

    /// Compares the server-side consumer for `topic` with the registry's current settings.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Drift`] on mismatch.
    pub async fn check_drift(&self, topic: &str) -> Result<()> {
        let stream = stream_for_topic(topic)?;
        self.consumers
            .check_drift(stream, topic, self.config.app_type)
            .await
    }

    /// Liveness probes for the broker connection and stream plane.
    pub fn health_checkers(&self) -> Vec<Box<dyn HealthChecker>> {
        vec![
            Box::new(BrokerConnectionCheck::new(self.broker.clone())),
            Box::new(StreamPlaneCheck::new(self.broker.clone())),
        ]
    }

    /// Stops subscriptions and delayed processors, waiting for in-flight deliveries.
    ///
    /// Later calls return immediately.
    pub async fn close(&self) {
        self.subscriber.close().await;
        self.delayed.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::config::ConfigError;
    use crate::testing::RecordingBroker;
    use assert_matches::assert_matches;
    use prometheus::Registry;

    #[tokio::test]
    async fn construction_provisions_role_streams() {
        let broker = RecordingBroker::new();

        let bus = EventBus::new(
            broker.clone(),
            EventBusConfig::for_app(AppType::Discord),
            EventBusMetrics::disabled(),
        )
        .await
        .unwrap();

        assert_eq!(bus.app_type(), AppType::Discord);
        assert_eq!(broker.state().streams.len(), 1);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_broker_use() {
        let broker = RecordingBroker::new();
        let config = EventBusConfig {
            fetch_batch: 0,
            ..EventBusConfig::default()
        };

        let result = EventBus::new(broker.clone(), config, EventBusMetrics::disabled()).await;

        assert_matches!(result, Err(Error::Config(ConfigError::Invalid(_))));
        assert!(broker.state().streams.is_empty());
    }

    #[tokio::test]
    async fn exposes_two_named_probes() {
        let bus = EventBus::new(
            RecordingBroker::new(),
            EventBusConfig::default(),
            EventBusMetrics::disabled(),
        )
        .await
        .unwrap();

        let names: Vec<&str> = bus.health_checkers().iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["broker-connection", "stream-plane"]);
    }

    #[tokio::test]
    async fn disabled_metrics_skip_registration() {
        let registry = Registry::new();
        let config = EventBusConfig {
            metrics_enabled: false,
            ..EventBusConfig::default()
        };

        EventBus::with_prometheus(RecordingBroker::new(), config, &registry)
            .await
            .unwrap();

        assert!(registry.gather().is_empty());
    }

    #[tokio::test]
    async fn termination_toggles() {
        let bus = EventBus::new(
            RecordingBroker::new(),
            EventBusConfig::default(),
            EventBusMetrics::disabled(),
        )
        .await
        .unwrap();

        bus.terminate_topic("round.finalized.v1");
        assert!(bus.resume_topic("round.finalized.v1"));
        assert!(!bus.resume_topic("round.finalized.v1"));
        bus.close().await;
        bus.close().await;
    }
}
