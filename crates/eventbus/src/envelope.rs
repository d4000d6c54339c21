use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::SecondsFormat;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::broker::{BrokerMessage, Headers, MSG_ID_HEADER};

/// Reserved metadata keys.
pub mod keys {
    /// Stream the message was stored in.
    pub const STREAM: &str = "_js_stream";
    /// Consumer that delivered the message.
    pub const CONSUMER: &str = "_js_consumer";
    /// Delivery attempt.
    pub const NUM_DELIVERED: &str = "_js_num_delivered";
    /// Stream sequence.
    pub const STREAM_SEQ: &str = "_js_stream_seq";
    /// Consumer sequence.
    pub const CONSUMER_SEQ: &str = "_js_consumer_seq";
    /// Storage time, RFC 3339 with nanoseconds.
    pub const TIMESTAMP: &str = "_js_timestamp";
    /// JetStream domain.
    pub const DOMAIN: &str = "_js_domain";

    /// Unprefixed duplicates of the broker keys, in the same order.
    pub const LEGACY: [&str; 7] = [
        "stream",
        "consumer",
        "num_delivered",
        "stream_seq",
        "consumer_seq",
        "timestamp",
        "domain",
    ];

    /// Correlates a chain of messages.
    pub const CORRELATION_ID: &str = "correlation_id";
    /// Fallback topic used when publishing without an explicit one.
    pub const TOPIC: &str = "topic";

    /// Subject a delayed message is republished to.
    pub const ORIGINAL_SUBJECT: &str = "original_subject";
    /// Round a delayed message belongs to.
    pub const ROUND_ID: &str = "round_id";
    /// Due time of a delayed message, RFC 3339.
    pub const EXECUTE_AT: &str = "execute_at";

    /// Whether `key` is populated by the broker on delivery.
    #[must_use]
    pub fn is_broker_key(key: &str) -> bool {
        key.starts_with("_js_") || LEGACY.contains(&key)
    }
}

/// The handler's verdict on a delivered envelope.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Processed; remove from the consumer.
    Ack,

    /// Not processed; redeliver (or terminate if the topic is marked).
    Nack,
}

#[derive(Debug)]
struct Acker {
    sender: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl Acker {
    fn decide(&self, outcome: Outcome) -> bool {
        self.sender
            .lock()
            .take()
            .is_some_and(|sender| sender.send(outcome).is_ok())
    }
}

/// An opaque payload plus string metadata.
///
/// Envelopes received from a subscription must be acknowledged with [`Envelope::ack`] or
/// [`Envelope::nack`]. Dropping every clone of a delivered envelope without deciding counts
/// as a nack.
#[derive(Clone, Debug)]
pub struct Envelope {
    uuid: String,
    payload: Bytes,
    metadata: HashMap<String, String>,
    acker: Option<Arc<Acker>>,
}

impl Envelope {
    /// Creates an envelope with a fresh UUID and no metadata.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self::with_uuid(Uuid::new_v4().to_string(), payload)
    }

    /// Creates an envelope with a caller-chosen UUID.
    pub fn with_uuid(uuid: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            uuid: uuid.into(),
            payload: payload.into(),
            metadata: HashMap::new(),
            acker: None,
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sets a metadata entry.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Looks up a metadata entry.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// All metadata.
    #[must_use]
    pub const fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Mutable metadata.
    pub const fn metadata_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.metadata
    }

    /// The payload.
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Unique id, also used for broker-side de-duplication.
    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// The correlation id, if present.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.get(keys::CORRELATION_ID)
    }

    /// Acknowledges the delivery. Returns `false` if already decided or not a delivery.
    pub fn ack(&self) -> bool {
        self.acker
            .as_ref()
            .is_some_and(|acker| acker.decide(Outcome::Ack))
    }

    /// Rejects the delivery. Returns `false` if already decided or not a delivery.
    pub fn nack(&self) -> bool {
        self.acker
            .as_ref()
            .is_some_and(|acker| acker.decide(Outcome::Nack))
    }

    /// Headers to publish this envelope with.
    #[must_use]
    pub fn to_headers(&self) -> Headers {
        let mut headers: Headers = self
            .metadata
            .iter()
            .map(|(key, value)| (key.clone(), vec![value.clone()]))
            .collect();
        headers.insert(MSG_ID_HEADER.to_string(), vec![self.uuid.clone()]);
        headers
    }

    /// Copy without delivery state or broker-populated keys, suitable for republishing.
    #[must_use]
    pub fn detached(&self) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            payload: self.payload.clone(),
            metadata: self
                .metadata
                .iter()
                .filter(|(key, _)| !keys::is_broker_key(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            acker: None,
        }
    }

    /// Builds the handler-facing envelope for a fetched broker message.
    pub(crate) fn from_broker_message<M>(message: &M) -> Result<Self, M::Error>
    where
        M: BrokerMessage,
    {
        let info = message.info()?;
        let mut metadata: HashMap<String, String> = message
            .headers()
            .into_iter()
            .filter_map(|(key, values)| values.into_iter().next().map(|value| (key, value)))
            .collect();

        let uuid = metadata
            .remove(MSG_ID_HEADER)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let broker_values = [
            info.stream,
            info.consumer,
            info.num_delivered.to_string(),
            info.stream_sequence.to_string(),
            info.consumer_sequence.to_string(),
            info.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            info.domain.unwrap_or_default(),
        ];
        let prefixed = [
            keys::STREAM,
            keys::CONSUMER,
            keys::NUM_DELIVERED,
            keys::STREAM_SEQ,
            keys::CONSUMER_SEQ,
            keys::TIMESTAMP,
            keys::DOMAIN,
        ];
        for ((key, legacy), value) in prefixed.into_iter().zip(keys::LEGACY).zip(broker_values) {
            metadata.insert(legacy.to_string(), value.clone());
            metadata.insert(key.to_string(), value);
        }

        if metadata
            .get(keys::CORRELATION_ID)
            .is_none_or(String::is_empty)
        {
            metadata.insert(keys::CORRELATION_ID.to_string(), Uuid::new_v4().to_string());
        }

        Ok(Self {
            uuid,
            payload: message.payload().clone(),
            metadata,
            acker: None,
        })
    }

    /// Attaches a decision channel, turning this into a delivery.
    pub(crate) fn into_delivery(mut self) -> (Self, oneshot::Receiver<Outcome>) {
        let (sender, receiver) = oneshot::channel();
        self.acker = Some(Arc::new(Acker {
            sender: Mutex::new(Some(sender)),
        }));
        (self, receiver)
    }
}
