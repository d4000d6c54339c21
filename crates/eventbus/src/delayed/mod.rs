mod processor;
mod recovery;

pub use recovery::RecoverySummary;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::broker::{AckPolicy, Broker, ConsumerSpec, DeliverPolicy, ReplayPolicy};
use crate::config::DelayedConfig;
use crate::envelope::{Envelope, keys};
use crate::error::{Error, Result};
use crate::metrics::EventBusMetrics;
use crate::publisher::Publisher;

/// Key of the stream holding future-dated messages.
pub const DELAYED_STREAM: &str = "delayed";

/// Age after which the delayed stream discards messages.
pub const DELAYED_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Subject a round's delayed messages are stored on.
#[must_use]
pub fn delayed_subject(round_id: &str) -> String {
    format!("delayed.message.{round_id}")
}

/// Durable consumer that holds and executes a round's delayed messages.
#[must_use]
pub fn processor_name(round_id: &str) -> String {
    format!("delayed_processor_{round_id}")
}

struct ActiveProcessor {
    generation: u64,
    cancel: CancellationToken,

    /// A message was scheduled since the processor last found its round drained.
    rescheduled: bool,

    /// The processor is deleting its consumer.
    retiring: bool,
}

struct Inner<B>
where
    B: Broker,
{
    broker: B,
    publisher: Arc<Publisher<B>>,
    config: DelayedConfig,
    fetch_max_wait: Duration,
    metrics: EventBusMetrics,
    processors: Mutex<HashMap<String, ActiveProcessor>>,
    generations: AtomicU64,
    recovered: AtomicBool,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Publishes messages for later delivery and executes them when due.
///
/// Each scheduled round gets its own durable consumer that NAKs the message with the
/// remaining delay until it is due, then republishes the payload to its original subject.
pub struct DelayedScheduler<B>
where
    B: Broker,
{
    inner: Arc<Inner<B>>,
}

impl<B> Clone for DelayedScheduler<B>
where
    B: Broker,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B> std::fmt::Debug for DelayedScheduler<B>
where
    B: Broker,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedScheduler")
            .field("active", &self.inner.processors.lock().len())
            .field("recovered", &self.inner.recovered.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<B> DelayedScheduler<B>
where
    B: Broker,
{
    /// Creates a scheduler publishing through `publisher`.
    pub fn new(
        broker: B,
        publisher: Arc<Publisher<B>>,
        config: DelayedConfig,
        fetch_max_wait: Duration,
        metrics: EventBusMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker,
                publisher,
                config,
                fetch_max_wait,
                metrics,
                processors: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
                recovered: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
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
        self.schedule_envelope(original_subject, round_id, execute_at, Envelope::new(payload))
            .await
    }

    /// Schedules `envelope` for publication on `original_subject` at `execute_at`.
    ///
    /// Caller metadata travels with the message and is republished with it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingMetadata`] for an empty round id or subject,
    /// [`Error::SubscriberClosed`] after [`DelayedScheduler::close`], or any publish or
    /// consumer creation failure.
    #[instrument(skip(self, envelope), fields(uuid = envelope.uuid()))]
    pub async fn schedule_envelope(
        &self,
        original_subject: &str,
        round_id: &str,
        execute_at: DateTime<Utc>,
        mut envelope: Envelope,
    ) -> Result<()> {
        if round_id.is_empty() {
            return Err(Error::MissingMetadata(keys::ROUND_ID));
        }
        if original_subject.is_empty() {
            return Err(Error::MissingMetadata(keys::ORIGINAL_SUBJECT));
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::SubscriberClosed);
        }

        envelope.set_metadata(keys::ORIGINAL_SUBJECT, original_subject);
        envelope.set_metadata(keys::ROUND_ID, round_id);
        envelope.set_metadata(
            keys::EXECUTE_AT,
            execute_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        if envelope.correlation_id().is_none_or(str::is_empty) {
            envelope.set_metadata(keys::CORRELATION_ID, Uuid::new_v4().to_string());
        }

        let delay = (execute_at - Utc::now()).to_std().unwrap_or_default();
        if delay > DELAYED_MAX_AGE {
            warn!(
                round_id,
                ?delay,
                "delay exceeds the delayed stream's retention, message may expire first"
            );
        }

        self.inner
            .publisher
            .publish(&delayed_subject(round_id), &[envelope])
            .await?;
        self.inner.metrics.delayed_scheduled();
        info!(round_id, original_subject, %execute_at, "delayed message scheduled");

        self.start_processor(round_id).await
    }

    /// Removes a round's pending delayed messages and stops its processor.
    ///
    /// Returns how many messages were purged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Broker`] if the purge fails.
    #[instrument(skip(self))]
    pub async fn cancel(&self, round_id: &str) -> Result<u64> {
        // Retire before purging so a schedule racing the purge restarts the processor.
        if let Some(active) = self.inner.processors.lock().get_mut(round_id) {
            active.retiring = true;
            active.rescheduled = false;
            active.cancel.cancel();
        }

        let purged = match self
            .inner
            .broker
            .purge_subject(DELAYED_STREAM, &delayed_subject(round_id))
            .await
        {
            Ok(purged) => purged,
            Err(error) => {
                if let Some(active) = self.inner.processors.lock().get_mut(round_id) {
                    active.rescheduled = true;
                }
                return Err(Error::broker(error));
            }
        };

        info!(round_id, purged, "delayed messages cancelled");
        Ok(purged)
    }

    /// Rebuilds processors for rounds still pending in the delayed stream.
    ///
    /// Runs once per scheduler; later calls return an empty summary. Anomalies are
    /// logged rather than returned.
    pub async fn recover(&self, cx: &CancellationToken) -> RecoverySummary {
        recovery::recover(self, cx).await
    }

    /// Whether a processor is running for `round_id` and not winding down.
    #[must_use]
    pub fn is_active(&self, round_id: &str) -> bool {
        self.inner
            .processors
            .lock()
            .get(round_id)
            .is_some_and(|active| !active.retiring)
    }

    /// Number of running processors.
    #[must_use]
    pub fn active(&self) -> usize {
        self.inner
            .processors
            .lock()
            .values()
            .filter(|active| !active.retiring)
            .count()
    }

    /// Stops every processor and waits for them to exit. Durable consumers are kept.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.processors.lock().clear();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        debug!("delayed scheduler closed");
    }

    /// Starts the processor for `round_id`.
    ///
    /// If one is already running it is told to look for new messages before it retires,
    /// and restarts after retiring if it was already winding down.
    pub(crate) async fn start_processor(&self, round_id: &str) -> Result<()> {
        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst);
        let cancel = self.inner.shutdown.child_token();
        {
            let mut processors = self.inner.processors.lock();
            if self.inner.shutdown.is_cancelled() {
                return Err(Error::SubscriberClosed);
            }
            if let Some(active) = processors.get_mut(round_id) {
                debug!(round_id, retiring = active.retiring, "processor already running");
                active.rescheduled = true;
                return Ok(());
            }
            processors.insert(
                round_id.to_string(),
                ActiveProcessor {
                    generation,
                    cancel: cancel.clone(),
                    rescheduled: false,
                    retiring: false,
                },
            );
        }

        let consumer = match self.create_consumer(round_id).await {
            Ok(consumer) => consumer,
            Err(error) => {
                self.forget(round_id, generation);
                return Err(error);
            }
        };

        let scheduler = self.clone();
        let round_id = round_id.to_string();
        self.inner.tracker.spawn(async move {
            processor::run(&scheduler, &round_id, generation, consumer, cancel).await;
        });

        Ok(())
    }

    /// Creates or reconciles the durable consumer behind a round's processor.
    async fn create_consumer(&self, round_id: &str) -> Result<B::Consumer> {
        let spec = ConsumerSpec {
            durable_name: Some(processor_name(round_id)),
            filter_subject: delayed_subject(round_id),
            ack_policy: AckPolicy::Explicit,
            ack_wait: self.inner.config.ack_wait,
            max_deliver: -1,
            max_ack_pending: self.inner.config.max_ack_pending,
            deliver_policy: DeliverPolicy::All,
            replay_policy: ReplayPolicy::Instant,
            ..ConsumerSpec::default()
        };

        self.inner
            .broker
            .create_or_update_consumer(DELAYED_STREAM, spec)
            .await
            .map_err(Error::broker)
    }

    /// Marks a drained processor as retiring. Returns false, clearing the mark, if a
    /// message was scheduled since it last looked.
    fn begin_retire(&self, round_id: &str, generation: u64) -> bool {
        let mut processors = self.inner.processors.lock();
        match processors.get_mut(round_id) {
            Some(active) if active.generation == generation => {
                if active.rescheduled {
                    active.rescheduled = false;
                    return false;
                }
                active.retiring = true;
                true
            }
            _ => true,
        }
    }

    /// Called once a retiring processor has deleted its consumer. Drops its entry, or
    /// hands back a fresh cancellation token if it was rescheduled meanwhile.
    fn finish_retire(&self, round_id: &str, generation: u64) -> Option<CancellationToken> {
        let mut processors = self.inner.processors.lock();
        match processors.get_mut(round_id) {
            Some(active) if active.generation == generation => {
                if active.rescheduled && !self.inner.shutdown.is_cancelled() {
                    active.rescheduled = false;
                    active.retiring = false;
                    active.cancel = self.inner.shutdown.child_token();
                    return Some(active.cancel.clone());
                }
            }
            _ => return None,
        }

        processors.remove(round_id);
        None
    }

    /// Drops the processor entry for `round_id` if it still belongs to `generation`.
    fn forget(&self, round_id: &str, generation: u64) {
        let mut processors = self.inner.processors.lock();
        if processors
            .get(round_id)
            .is_some_and(|active| active.generation == generation)
        {
            processors.remove(round_id);
        }
    }
}
