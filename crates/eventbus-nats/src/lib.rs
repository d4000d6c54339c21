//! JetStream backend for the frolf event bus.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod consumer;
mod convert;
mod error;

pub use consumer::{NatsMessage, NatsPullConsumer};
pub use error::Error;

use async_nats::Client;
use async_nats::connection::State;
use async_nats::header::HeaderMap;
use async_nats::jetstream::{self, Context};
use async_nats::jetstream::consumer::pull;
use async_trait::async_trait;
use bytes::Bytes;
use frolf_eventbus::broker::{
    AccountInfo, Broker, ConsumerBacklog, ConsumerSpec, Headers, StreamSpec,
};
use tracing::{debug, instrument};

/// [`Broker`] over a NATS connection with JetStream enabled.
#[derive(Clone, Debug)]
pub struct NatsBroker {
    client: Client,
    jetstream: Context,
}

impl NatsBroker {
    /// Wraps an existing connection.
    #[must_use]
    pub fn new(client: Client) -> Self {
        let jetstream = jetstream::new(client.clone());

        Self { client, jetstream }
    }

    /// Connects to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connect`] if the server cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = async_nats::connect(url).await?;
        debug!(url, "connected to nats");

        Ok(Self::new(client))
    }

    /// The underlying connection.
    #[must_use]
    pub const fn client(&self) -> &Client {
        &self.client
    }

    /// The JetStream context.
    #[must_use]
    pub const fn jetstream(&self) -> &Context {
        &self.jetstream
    }

    async fn stream(&self, name: &str) -> Result<jetstream::stream::Stream, Error> {
        self.jetstream
            .get_stream(name)
            .await
            .map_err(|e| Error::GetStream(e.kind()))
    }
}

fn header_map(headers: Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, values) in headers {
        for value in values {
            map.append(name.as_str(), value.as_str());
        }
    }
    map
}

#[async_trait]
impl Broker for NatsBroker {
    type Error = Error;
    type Consumer = NatsPullConsumer;

    #[instrument(skip(self, spec), fields(stream = %spec.name))]
    async fn create_or_update_stream(&self, spec: StreamSpec) -> Result<(), Error> {
        let config = convert::stream_config(spec);

        self.jetstream
            .get_or_create_stream(config.clone())
            .await
            .map_err(|e| Error::CreateStream(e.kind()))?;
        self.jetstream
            .update_stream(&config)
            .await
            .map_err(|e| Error::UpdateStream(e.to_string()))?;

        Ok(())
    }

    #[instrument(skip(self, spec), fields(durable = ?spec.durable_name, filter = %spec.filter_subject))]
    async fn create_or_update_consumer(
        &self,
        stream: &str,
        spec: ConsumerSpec,
    ) -> Result<NatsPullConsumer, Error> {
        let config = convert::consumer_config(spec);
        let requested_name = config.durable_name.clone().or_else(|| config.name.clone());

        let consumer = self
            .jetstream
            .create_consumer_on_stream(config, stream)
            .await
            .map_err(|e| Error::Consumer(e.kind()))?;

        let name = match requested_name {
            Some(name) => name,
            None => consumer.cached_info().name.clone(),
        };
        debug!(stream, consumer = %name, "consumer created or updated");

        Ok(NatsPullConsumer::new(name, consumer))
    }

    async fn consumer_spec(&self, stream: &str, name: &str) -> Result<ConsumerSpec, Error> {
        let consumer = self
            .stream(stream)
            .await?
            .get_consumer::<pull::Config>(name)
            .await
            .map_err(|e| Error::Consumer(e.kind()))?;

        convert::consumer_spec(&consumer.cached_info().config)
    }

    async fn consumer_backlog(&self, stream: &str, name: &str) -> Result<ConsumerBacklog, Error> {
        let consumer = self
            .stream(stream)
            .await?
            .get_consumer::<pull::Config>(name)
            .await
            .map_err(|e| Error::Consumer(e.kind()))?;
        let info = consumer.cached_info();

        Ok(ConsumerBacklog {
            num_pending: info.num_pending,
            num_ack_pending: u64::try_from(info.num_ack_pending).unwrap_or(u64::MAX),
            ack_floor: info.ack_floor.stream_sequence,
        })
    }

    async fn delete_consumer(&self, stream: &str, name: &str) -> Result<(), Error> {
        self.stream(stream)
            .await?
            .delete_consumer(name)
            .await
            .map_err(|e| Error::Consumer(e.kind()))?;

        Ok(())
    }

    async fn purge_subject(&self, stream: &str, subject: &str) -> Result<u64, Error> {
        let response = self
            .stream(stream)
            .await?
            .purge()
            .filter(subject)
            .await
            .map_err(|e| Error::Purge(e.to_string()))?;

        Ok(response.purged)
    }

    async fn purge_subject_before(
        &self,
        stream: &str,
        subject: &str,
        sequence: u64,
    ) -> Result<u64, Error> {
        let response = self
            .stream(stream)
            .await?
            .purge()
            .filter(subject)
            .sequence(sequence)
            .await
            .map_err(|e| Error::Purge(e.to_string()))?;

        Ok(response.purged)
    }

    async fn publish(&self, subject: &str, headers: Headers, payload: Bytes) -> Result<u64, Error> {
        let ack = self
            .jetstream
            .publish_with_headers(subject.to_string(), header_map(headers), payload)
            .await
            .map_err(|e| Error::Publish(e.kind()))?
            .await
            .map_err(|e| Error::Publish(e.kind()))?;

        Ok(ack.sequence)
    }

    fn is_connected(&self) -> bool {
        self.client.connection_state() == State::Connected
    }

    async fn flush(&self) -> Result<(), Error> {
        self.client
            .flush()
            .await
            .map_err(|e| Error::Flush(e.to_string()))
    }

    async fn account_info(&self) -> Result<Option<AccountInfo>, Error> {
        let account = self
            .jetstream
            .query_account()
            .await
            .map_err(|e| Error::Account(e.to_string()))?;

        Ok(Some(AccountInfo {
            streams: usize::try_from(account.streams).unwrap_or_default(),
            consumers: usize::try_from(account.consumers).unwrap_or_default(),
            memory: u64::try_from(account.memory).unwrap_or_default(),
            storage: u64::try_from(account.storage).unwrap_or_default(),
        }))
    }
}
