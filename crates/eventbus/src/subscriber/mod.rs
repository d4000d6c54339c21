mod arbiter;
mod backoff;

pub use backoff::{ack_heartbeat, fetch_error_backoff, jittered};

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::broker::{Broker, BrokerMessage, PullConsumer};
use crate::consumers::ConsumerManager;
use crate::envelope::{Envelope, keys};
use crate::error::{Error, Result};
use crate::metrics::EventBusMetrics;
use crate::registry::{ConsumerRegistry, ConsumerSettings};
use crate::streams::StreamProvisioner;
use crate::topic::{TopicPolicy, stream_for_topic};
use arbiter::{Delivery, arbitrate};

/// Redelivery delay for messages that could not be turned into envelopes.
const CONVERSION_NAK_DELAY: Duration = Duration::from_secs(5);

/// Topics whose rejected messages are terminated instead of redelivered.
#[derive(Clone, Debug, Default)]
pub struct TerminationSet {
    topics: Arc<RwLock<HashSet<String>>>,
}

impl TerminationSet {
    /// Terminates future rejections on `topic`.
    pub fn mark(&self, topic: impl Into<String>) {
        self.topics.write().insert(topic.into());
    }

    /// Restores redelivery for `topic`. Returns whether it was marked.
    pub fn unmark(&self, topic: &str) -> bool {
        self.topics.write().remove(topic)
    }

    /// Whether `topic` is marked.
    #[must_use]
    pub fn contains(&self, topic: &str) -> bool {
        self.topics.read().contains(topic)
    }
}

/// Pull and concurrency settings shared by every subscription.
#[derive(Clone, Copy, Debug)]
pub struct SubscriberOptions {
    /// Messages requested per pull.
    pub fetch_batch: usize,

    /// How long a pull waits for messages.
    pub fetch_max_wait: Duration,

    /// Handed-out deliveries awaiting a decision, across all subscriptions.
    pub ack_concurrency: usize,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self {
            fetch_batch: 10,
            fetch_max_wait: Duration::from_secs(5),
            ack_concurrency: 50,
        }
    }
}

#[derive(Clone, Debug)]
struct Subscription {
    topic: String,
    cancel: CancellationToken,
    closed: CancellationToken,
}

/// Runs pull subscriptions and hands envelopes to handlers.
#[derive(Debug)]
pub struct Subscriber<B>
where
    B: Broker,
{
    streams: Arc<StreamProvisioner<B>>,
    consumers: Arc<ConsumerManager<B>>,
    registry: Arc<ConsumerRegistry>,
    policy: TopicPolicy,
    options: SubscriberOptions,
    metrics: EventBusMetrics,
    terminations: TerminationSet,
    semaphore: Arc<Semaphore>,
    subscriptions: Mutex<Vec<Subscription>>,
    closed: AtomicBool,
}

impl<B> Subscriber<B>
where
    B: Broker,
{
    /// Creates a subscriber with no running subscriptions.
    pub fn new(
        streams: Arc<StreamProvisioner<B>>,
        consumers: Arc<ConsumerManager<B>>,
        registry: Arc<ConsumerRegistry>,
        policy: TopicPolicy,
        options: SubscriberOptions,
        metrics: EventBusMetrics,
    ) -> Self {
        Self {
            streams,
            consumers,
            registry,
            policy,
            options,
            metrics,
            terminations: TerminationSet::default(),
            semaphore: Arc::new(Semaphore::new(options.ack_concurrency)),
            subscriptions: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Topics whose rejected messages are terminated.
    pub const fn terminations(&self) -> &TerminationSet {
        &self.terminations
    }

    /// Free handler slots.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Whether [`Subscriber::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Starts a subscription on `topic`.
    ///
    /// The returned receiver yields envelopes until `cx` is cancelled or the subscriber
    /// closes, then disconnects once every handed-out envelope has settled. Each envelope
    /// must be acked or nacked; dropping it counts as a nack.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SubscriberClosed`], [`Error::Cancelled`], [`Error::Forbidden`],
    /// [`Error::UnknownTopic`], or [`Error::Broker`] if the stream or consumer cannot be
    /// created.
    #[instrument(skip(self, cx))]
    pub async fn subscribe(
        &self,
        cx: &CancellationToken,
        topic: &str,
    ) -> Result<flume::Receiver<Envelope>> {
        if self.is_closed() {
            return Err(Error::SubscriberClosed);
        }
        if cx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.policy.authorize(topic)?;
        let stream = stream_for_topic(topic)?;
        self.streams.ensure_stream(stream).await?;
        let consumer = self
            .consumers
            .ensure_consumer(stream, topic, self.policy.app_type())
            .await?;
        let settings = self.registry.resolve(self.policy.app_type(), topic);

        let subscription = Subscription {
            topic: topic.to_string(),
            cancel: cx.child_token(),
            closed: CancellationToken::new(),
        };

        {
            let mut subscriptions = self.subscriptions.lock();
            if self.is_closed() {
                return Err(Error::SubscriberClosed);
            }
            subscriptions.retain(|existing| !existing.closed.is_cancelled());
            subscriptions.push(subscription.clone());
        }

        let (output, receiver) = flume::bounded(0);
        let pump = Pump {
            consumer,
            topic: Arc::from(topic),
            settings: Arc::new(settings),
            options: self.options,
            semaphore: self.semaphore.clone(),
            terminations: self.terminations.clone(),
            metrics: self.metrics.clone(),
            cancel: subscription.cancel,
            closed: subscription.closed,
            output,
        };
        tokio::spawn(pump.run());

        info!(topic, stream, "subscribed");
        Ok(receiver)
    }

    /// Stops every subscription and waits for their pumps to settle.
    ///
    /// Later calls return immediately.
    pub async fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("subscriber already closed");
            return;
        }

        let subscriptions = self.subscriptions.lock().clone();
        for subscription in &subscriptions {
            subscription.cancel.cancel();
        }
        for subscription in &subscriptions {
            subscription.closed.cancelled().await;
            debug!(topic = %subscription.topic, "subscription closed");
        }

        info!(count = subscriptions.len(), "subscriber closed");
    }
}

/// One subscription's fetch loop.
pub(crate) struct Pump<C>
where
    C: PullConsumer,
{
    pub consumer: C,
    pub topic: Arc<str>,
    pub settings: Arc<ConsumerSettings>,
    pub options: SubscriberOptions,
    pub semaphore: Arc<Semaphore>,
    pub terminations: TerminationSet,
    pub metrics: EventBusMetrics,
    pub cancel: CancellationToken,
    pub closed: CancellationToken,
    pub output: flume::Sender<Envelope>,
}

impl<C> Pump<C>
where
    C: PullConsumer,
{
    /// Fetches and hands off until cancelled, then waits for every arbiter before
    /// disconnecting the output and firing `closed`.
    pub(crate) async fn run(self) {
        let tracker = TaskTracker::new();
        let mut failures: i32 = 0;

        while !self.cancel.is_cancelled() {
            let fetched = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                fetched = self.consumer.fetch(self.options.fetch_batch, self.options.fetch_max_wait) => fetched,
            };

            let messages = match fetched {
                Ok(messages) => {
                    failures = 0;
                    messages
                }
                Err(error) => {
                    failures = failures.saturating_add(1);
                    self.metrics.fetch_error(&self.topic);
                    let wait = jittered(fetch_error_backoff(failures));
                    warn!(topic = %self.topic, %error, attempt = failures, ?wait, "fetch failed");

                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => break,
                        () = tokio::time::sleep(wait) => continue,
                    }
                }
            };

            let mut messages = messages.into_iter();
            for message in messages.by_ref() {
                if !self.hand_off(message, &tracker).await {
                    break;
                }
            }
            for message in messages {
                release(&message, &self.topic).await;
            }
        }

        tracker.close();
        tracker.wait().await;

        let Self { output, closed, topic, .. } = self;
        drop(output);
        closed.cancel();
        debug!(topic = %topic, "pump stopped");
    }

    /// Hands one message to the output. Returns `false` once the pump should stop.
    async fn hand_off(&self, message: C::Message, tracker: &TaskTracker) -> bool {
        let envelope = match Envelope::from_broker_message(&message) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(topic = %self.topic, subject = message.subject(), %error, "unreadable message");
                if let Err(error) = message.nak(Some(CONVERSION_NAK_DELAY)).await {
                    warn!(topic = %self.topic, %error, "nak failed");
                }
                return true;
            }
        };
        let num_delivered = envelope
            .get(keys::NUM_DELIVERED)
            .and_then(|value| value.parse().ok())
            .unwrap_or(1);

        let permit = tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            permit = self.semaphore.clone().acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            release(&message, &self.topic).await;
            return false;
        };

        let (envelope, outcome) = envelope.into_delivery();
        let sent = tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            sent = self.output.send_async(envelope) => sent.is_ok(),
        };
        if !sent {
            if !self.cancel.is_cancelled() {
                debug!(topic = %self.topic, "receiver dropped, stopping subscription");
                self.cancel.cancel();
            }
            release(&message, &self.topic).await;
            return false;
        }

        self.metrics.received(&self.topic);
        tracker.spawn(arbitrate(Delivery {
            message,
            outcome,
            num_delivered,
            topic: self.topic.clone(),
            settings: self.settings.clone(),
            terminations: self.terminations.clone(),
            metrics: self.metrics.clone(),
            cancel: self.cancel.clone(),
            permit,
        }));

        true
    }
}

/// Returns a message that never reached a handler for immediate redelivery.
async fn release<M>(message: &M, topic: &str)
where
    M: BrokerMessage,
{
    if let Err(error) = message.nak(None).await {
        warn!(topic, %error, "failed to release undelivered message");
    }
}
