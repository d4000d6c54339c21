use std::sync::Arc;
use std::time::Duration;

use prometheus::{CounterVec, HistogramOpts, HistogramVec, IntCounter, Opts, Registry};

struct Collectors {
    published: CounterVec,
    publish_errors: CounterVec,
    received: CounterVec,
    acked: CounterVec,
    nacked: CounterVec,
    terminated: CounterVec,
    deadline_exceeded: CounterVec,
    fetch_errors: CounterVec,
    delayed_scheduled: IntCounter,
    delayed_executed: IntCounter,
    handler_duration: HistogramVec,
}

/// Bus counters; every method is a no-op when metrics are disabled.
#[derive(Clone, Default)]
pub struct EventBusMetrics {
    collectors: Option<Arc<Collectors>>,
}

impl std::fmt::Debug for EventBusMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBusMetrics")
            .field("enabled", &self.collectors.is_some())
            .finish()
    }
}

fn topic_counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<CounterVec> {
    let counter = CounterVec::new(Opts::new(name, help), &["topic"])?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl EventBusMetrics {
    /// Registers the bus collectors on `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if a collector with the same name is already registered.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let delayed_scheduled = IntCounter::new(
            "eventbus_delayed_scheduled_total",
            "Delayed messages scheduled",
        )?;
        registry.register(Box::new(delayed_scheduled.clone()))?;

        let delayed_executed = IntCounter::new(
            "eventbus_delayed_executed_total",
            "Delayed messages republished to their original subject",
        )?;
        registry.register(Box::new(delayed_executed.clone()))?;

        let handler_duration = HistogramVec::new(
            HistogramOpts::new(
                "eventbus_handler_duration_seconds",
                "Time from handoff to the handler's ack or nack",
            ),
            &["topic"],
        )?;
        registry.register(Box::new(handler_duration.clone()))?;

        let collectors = Collectors {
            published: topic_counter(
                registry,
                "eventbus_messages_published_total",
                "Messages published",
            )?,
            publish_errors: topic_counter(
                registry,
                "eventbus_publish_errors_total",
                "Failed publishes",
            )?,
            received: topic_counter(
                registry,
                "eventbus_messages_received_total",
                "Messages handed to handlers",
            )?,
            acked: topic_counter(registry, "eventbus_messages_acked_total", "Messages acked")?,
            nacked: topic_counter(registry, "eventbus_messages_nacked_total", "Messages nacked")?,
            terminated: topic_counter(
                registry,
                "eventbus_messages_terminated_total",
                "Messages terminated",
            )?,
            deadline_exceeded: topic_counter(
                registry,
                "eventbus_ack_deadline_exceeded_total",
                "Deliveries abandoned after the processing deadline",
            )?,
            fetch_errors: topic_counter(
                registry,
                "eventbus_fetch_errors_total",
                "Failed pull requests",
            )?,
            delayed_scheduled,
            delayed_executed,
            handler_duration,
        };

        Ok(Self {
            collectors: Some(Arc::new(collectors)),
        })
    }

    /// Metrics that record nothing.
    #[must_use]
    pub const fn disabled() -> Self {
        Self { collectors: None }
    }

    /// Whether collectors are registered.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.collectors.is_some()
    }

    fn inc(&self, select: impl FnOnce(&Collectors) -> &CounterVec, topic: &str) {
        if let Some(collectors) = &self.collectors {
            select(collectors).with_label_values(&[topic]).inc();
        }
    }

    pub(crate) fn published(&self, topic: &str) {
        self.inc(|c| &c.published, topic);
    }

    pub(crate) fn publish_error(&self, topic: &str) {
        self.inc(|c| &c.publish_errors, topic);
    }

    pub(crate) fn received(&self, topic: &str) {
        self.inc(|c| &c.received, topic);
    }

    pub(crate) fn acked(&self, topic: &str) {
        self.inc(|c| &c.acked, topic);
    }

    pub(crate) fn nacked(&self, topic: &str) {
        self.inc(|c| &c.nacked, topic);
    }

    pub(crate) fn terminated(&self, topic: &str) {
        self.inc(|c| &c.terminated, topic);
    }

    pub(crate) fn deadline_exceeded(&self, topic: &str) {
        self.inc(|c| &c.deadline_exceeded, topic);
    }

    pub(crate) fn fetch_error(&self, topic: &str) {
        self.inc(|c| &c.fetch_errors, topic);
    }

    pub(crate) fn delayed_scheduled(&self) {
        if let Some(collectors) = &self.collectors {
            collectors.delayed_scheduled.inc();
        }
    }

    pub(crate) fn delayed_executed(&self) {
        if let Some(collectors) = &self.collectors {
            collectors.delayed_executed.inc();
        }
    }

    pub(crate) fn handler_duration(&self, topic: &str, elapsed: Duration) {
        if let Some(collectors) = &self.collectors {
            collectors
                .handler_duration
                .with_label_values(&[topic])
                .observe(elapsed.as_secs_f64());
        }
    }
}
