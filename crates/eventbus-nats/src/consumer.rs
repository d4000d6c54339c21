use std::time::Duration;

use async_nats::jetstream::consumer::{Consumer, pull};
use async_nats::jetstream::{self, AckKind};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use frolf_eventbus::broker::{BrokerMessage, Headers, MessageInfo, PullConsumer};
use futures::StreamExt;
use tracing::debug;

use crate::Error;

/// A message pulled from a JetStream consumer.
#[derive(Debug)]
pub struct NatsMessage(jetstream::Message);

impl NatsMessage {
    /// The underlying JetStream message.
    #[must_use]
    pub const fn inner(&self) -> &jetstream::Message {
        &self.0
    }
}

#[async_trait]
impl BrokerMessage for NatsMessage {
    type Error = Error;

    fn subject(&self) -> &str {
        self.0.message.subject.as_str()
    }

    fn payload(&self) -> &Bytes {
        &self.0.message.payload
    }

    fn headers(&self) -> Headers {
        self.0
            .message
            .headers
            .as_ref()
            .map(|headers| {
                headers
                    .iter()
                    .map(|(name, values)| {
                        (
                            name.to_string(),
                            values.iter().map(ToString::to_string).collect(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn info(&self) -> Result<MessageInfo, Error> {
        let info = self.0.info().map_err(|e| Error::Info(e.to_string()))?;

        let timestamp = i64::try_from(info.published.unix_timestamp_nanos())
            .map_or_else(|_| Utc::now(), DateTime::from_timestamp_nanos);

        Ok(MessageInfo {
            stream: info.stream.to_string(),
            consumer: info.consumer.to_string(),
            num_delivered: u64::try_from(info.delivered).unwrap_or_default(),
            stream_sequence: info.stream_sequence,
            consumer_sequence: info.consumer_sequence,
            timestamp,
            domain: info
                .domain
                .filter(|domain| !domain.is_empty())
                .map(ToString::to_string),
        })
    }

    async fn ack(&self) -> Result<(), Error> {
        self.0.ack().await.map_err(|e| Error::Ack(e.to_string()))
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<(), Error> {
        self.0
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| Error::Ack(e.to_string()))
    }

    async fn term(&self) -> Result<(), Error> {
        self.0
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| Error::Ack(e.to_string()))
    }

    async fn in_progress(&self) -> Result<(), Error> {
        self.0
            .ack_with(AckKind::Progress)
            .await
            .map_err(|e| Error::Ack(e.to_string()))
    }
}

/// A JetStream pull consumer.
#[derive(Clone, Debug)]
pub struct NatsPullConsumer {
    name: String,
    consumer: Consumer<pull::Config>,
}

impl NatsPullConsumer {
    pub(crate) const fn new(name: String, consumer: Consumer<pull::Config>) -> Self {
        Self { name, consumer }
    }
}

#[async_trait]
impl PullConsumer for NatsPullConsumer {
    type Error = Error;
    type Message = NatsMessage;

    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, batch: usize, max_wait: Duration) -> Result<Vec<NatsMessage>, Error> {
        let mut messages = self
            .consumer
            .batch()
            .max_messages(batch)
            .expires(max_wait)
            .messages()
            .await
            .map_err(|e| Error::Fetch(e.to_string()))?;

        let mut fetched = Vec::with_capacity(batch);
        while let Some(message) = messages.next().await {
            match message {
                Ok(message) => fetched.push(NatsMessage(message)),
                Err(error) if fetched.is_empty() => return Err(Error::Fetch(error.to_string())),
                Err(error) => {
                    debug!(consumer = %self.name, %error, "batch ended early");
                    break;
                }
            }
        }

        Ok(fetched)
    }
}
