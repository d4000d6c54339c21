use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Marker trait for broker backend errors.
pub trait BrokerError: StdError + Send + Sync + 'static {}

/// Multi-valued message headers.
pub type Headers = HashMap<String, Vec<String>>;

/// Header used by the broker for publish de-duplication.
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// Where a new consumer starts reading a stream.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliverPolicy {
    /// Every message still held by the stream.
    #[default]
    All,

    /// Only messages published after the consumer was created.
    New,
}

/// How deliveries are acknowledged.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AckPolicy {
    /// Each message must be acknowledged individually.
    #[default]
    Explicit,

    /// Messages are considered acknowledged once delivered.
    None,
}

/// Replay pacing for historical messages.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ReplayPolicy {
    /// As fast as the consumer can take them.
    #[default]
    Instant,

    /// At the rate they were originally published.
    Original,
}

/// Stream retention.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RetentionPolicy {
    /// Kept until size or age limits evict them.
    #[default]
    Limits,

    /// Kept while any consumer is interested.
    Interest,

    /// Removed once acknowledged.
    WorkQueue,
}

/// Desired stream configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StreamSpec {
    /// Stream name.
    pub name: String,

    /// Subject filters captured by the stream.
    pub subjects: Vec<String>,

    /// Retention policy.
    pub retention: RetentionPolicy,

    /// Maximum message age; zero means unlimited.
    pub max_age: Duration,

    /// Maximum message count; `-1` means unlimited.
    pub max_messages: i64,

    /// Publish de-duplication window, if any.
    pub duplicate_window: Option<Duration>,
}

/// Desired pull consumer configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConsumerSpec {
    /// Durable name; `None` creates an ephemeral consumer.
    pub durable_name: Option<String>,

    /// Explicit name for ephemeral consumers.
    pub name: Option<String>,

    /// Subject filter.
    pub filter_subject: String,

    /// Acknowledgement policy.
    pub ack_policy: AckPolicy,

    /// Time before an unacknowledged delivery is redelivered.
    pub ack_wait: Duration,

    /// Delivery attempts before the broker gives up; `-1` is unlimited.
    pub max_deliver: i64,

    /// Per-attempt redelivery delays.
    pub backoff: Vec<Duration>,

    /// Ceiling on unacknowledged in-flight deliveries.
    pub max_ack_pending: i64,

    /// Starting point in the stream.
    pub deliver_policy: DeliverPolicy,

    /// Replay pacing.
    pub replay_policy: ReplayPolicy,

    /// Idle time after which an ephemeral consumer is removed; zero for durables.
    pub inactive_threshold: Duration,
}

impl Default for ConsumerSpec {
    fn default() -> Self {
        Self {
            durable_name: None,
            name: None,
            filter_subject: String::new(),
            ack_policy: AckPolicy::Explicit,
            ack_wait: Duration::from_secs(30),
            max_deliver: -1,
            backoff: Vec::new(),
            max_ack_pending: 1000,
            deliver_policy: DeliverPolicy::All,
            replay_policy: ReplayPolicy::Instant,
            inactive_threshold: Duration::ZERO,
        }
    }
}

/// Broker-side attributes of a delivered message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageInfo {
    /// Stream the message was stored in.
    pub stream: String,

    /// Consumer that delivered it.
    pub consumer: String,

    /// Delivery attempt, starting at 1.
    pub num_delivered: u64,

    /// Sequence within the stream.
    pub stream_sequence: u64,

    /// Sequence within the consumer.
    pub consumer_sequence: u64,

    /// Time the message was stored.
    pub timestamp: DateTime<Utc>,

    /// JetStream domain, if any.
    pub domain: Option<String>,
}

/// Account-level usage reported by the broker.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AccountInfo {
    /// Number of streams.
    pub streams: usize,

    /// Number of consumers.
    pub consumers: usize,

    /// Bytes held in memory storage.
    pub memory: u64,

    /// Bytes held in file storage.
    pub storage: u64,
}

/// Messages a consumer has yet to settle.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConsumerBacklog {
    /// Stored messages matching the filter that were never delivered.
    pub num_pending: u64,

    /// Delivered messages awaiting an acknowledgement, including NAK'd ones.
    pub num_ack_pending: u64,

    /// Stream sequence through which every delivered message has been settled.
    pub ack_floor: u64,
}

impl ConsumerBacklog {
    /// Whether nothing is left to deliver or acknowledge.
    #[must_use]
    pub const fn is_drained(&self) -> bool {
        self.num_pending == 0 && self.num_ack_pending == 0
    }
}

/// A message fetched from a pull consumer.
#[async_trait]
pub trait BrokerMessage: Debug + Send + Sync + 'static {
    /// Backend error type.
    type Error: BrokerError;

    /// Subject the message was published on.
    fn subject(&self) -> &str;

    /// Raw payload.
    fn payload(&self) -> &Bytes;

    /// Message headers.
    fn headers(&self) -> Headers;

    /// Delivery metadata.
    fn info(&self) -> Result<MessageInfo, Self::Error>;

    /// Positive acknowledgement.
    async fn ack(&self) -> Result<(), Self::Error>;

    /// Negative acknowledgement, optionally delaying redelivery.
    async fn nak(&self, delay: Option<Duration>) -> Result<(), Self::Error>;

    /// Stop redelivering this message.
    async fn term(&self) -> Result<(), Self::Error>;

    /// Extend the ack deadline by one ack-wait interval.
    async fn in_progress(&self) -> Result<(), Self::Error>;
}

/// A durable or ephemeral pull consumer.
#[async_trait]
pub trait PullConsumer: Clone + Debug + Send + Sync + 'static {
    /// Backend error type.
    type Error: BrokerError;

    /// Message type yielded by `fetch`.
    type Message: BrokerMessage;

    /// Consumer name as known to the broker.
    fn name(&self) -> &str;

    /// Requests up to `batch` messages, waiting at most `max_wait`.
    async fn fetch(
        &self,
        batch: usize,
        max_wait: Duration,
    ) -> Result<Vec<Self::Message>, Self::Error>;
}

/// The JetStream-style client the bus is layered on.
#[async_trait]
pub trait Broker: Clone + Debug + Send + Sync + 'static {
    /// Backend error type.
    type Error: BrokerError;

    /// Pull consumer handle type.
    type Consumer: PullConsumer;

    /// Creates the stream or reconciles its configuration.
    async fn create_or_update_stream(&self, spec: StreamSpec) -> Result<(), Self::Error>;

    /// Creates the consumer or reconciles its configuration.
    async fn create_or_update_consumer(
        &self,
        stream: &str,
        spec: ConsumerSpec,
    ) -> Result<Self::Consumer, Self::Error>;

    /// The server-side configuration of an existing consumer.
    async fn consumer_spec(&self, stream: &str, name: &str) -> Result<ConsumerSpec, Self::Error>;

    /// Undelivered and unacknowledged message counts of an existing consumer.
    async fn consumer_backlog(
        &self,
        stream: &str,
        name: &str,
    ) -> Result<ConsumerBacklog, Self::Error>;

    /// Deletes a consumer.
    async fn delete_consumer(&self, stream: &str, name: &str) -> Result<(), Self::Error>;

    /// Removes every message on `subject` from the stream, returning how many were purged.
    async fn purge_subject(&self, stream: &str, subject: &str) -> Result<u64, Self::Error>;

    /// Removes messages on `subject` stored below stream sequence `sequence`.
    async fn purge_subject_before(
        &self,
        stream: &str,
        subject: &str,
        sequence: u64,
    ) -> Result<u64, Self::Error>;

    /// Publishes and waits for the stream acknowledgement, returning the stream sequence.
    async fn publish(
        &self,
        subject: &str,
        headers: Headers,
        payload: Bytes,
    ) -> Result<u64, Self::Error>;

    /// Whether the underlying connection is currently established.
    fn is_connected(&self) -> bool;

    /// Round-trips to the server, flushing buffered writes.
    async fn flush(&self) -> Result<(), Self::Error>;

    /// Account usage, or `None` if the server returned nothing.
    async fn account_info(&self) -> Result<Option<AccountInfo>, Self::Error>;
}
