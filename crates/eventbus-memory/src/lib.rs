//! In-process broker with JetStream semantics, for local development and tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod consumer;
mod error;
mod state;

pub use consumer::{MemoryMessage, MemoryPullConsumer};
pub use error::Error;
pub use state::StoredMessage;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use frolf_eventbus::broker::{
    AccountInfo, Broker, ConsumerBacklog, ConsumerSpec, Headers, StreamSpec,
};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use state::{State, StreamState};

/// An acknowledgement a consumer received.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AckKind {
    /// Positive acknowledgement.
    Ack,

    /// Negative acknowledgement with optional redelivery delay.
    Nak(Option<Duration>),

    /// Terminated.
    Term,

    /// Deadline extended.
    InProgress,
}

/// One entry of [`MemoryBroker::ack_log`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AckRecord {
    /// Consumer that delivered the message.
    pub consumer: String,

    /// Stream sequence of the message.
    pub stream_sequence: u64,

    /// Delivery attempt the acknowledgement refers to.
    pub num_delivered: u64,

    /// What was sent.
    pub kind: AckKind,
}

#[derive(Debug)]
pub(crate) struct Inner {
    state: Mutex<State>,
    notify: Notify,
    connected: AtomicBool,
    failing_fetches: AtomicUsize,
    withhold_account_info: AtomicBool,
    acks: Mutex<Vec<AckRecord>>,
}

impl Inner {
    fn ensure_connected(&self) -> Result<(), Error> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    fn check_fetch(&self) -> Result<(), Error> {
        self.ensure_connected()?;

        let injected = self
            .failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if injected {
            return Err(Error::Injected);
        }

        Ok(())
    }

    fn record(&self, consumer: &str, stream_sequence: u64, num_delivered: u64, kind: AckKind) {
        trace!(consumer, stream_sequence, num_delivered, ?kind, "ack received");
        self.acks.lock().push(AckRecord {
            consumer: consumer.to_string(),
            stream_sequence,
            num_delivered,
            kind,
        });
    }
}

/// A JetStream-like broker held entirely in memory.
///
/// Streams capture subjects by filter, pull consumers track pending deliveries with
/// ack-wait and backoff driven redelivery, and publishes carrying a `Nats-Msg-Id` header
/// are de-duplicated inside the stream's duplicate window. Clones share state.
#[derive(Clone, Debug)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Creates an empty, connected broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                connected: AtomicBool::new(true),
                failing_fetches: AtomicUsize::new(0),
                withhold_account_info: AtomicBool::new(false),
                acks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Simulates losing or regaining the connection. While disconnected every operation fails.
    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Makes the next `count` fetches fail.
    pub fn fail_next_fetches(&self, count: usize) {
        self.inner.failing_fetches.store(count, Ordering::SeqCst);
    }

    /// Makes account info requests return nothing.
    pub fn withhold_account_info(&self, withhold: bool) {
        self.inner
            .withhold_account_info
            .store(withhold, Ordering::SeqCst);
    }

    /// Every acknowledgement received so far, in order.
    #[must_use]
    pub fn ack_log(&self) -> Vec<AckRecord> {
        self.inner.acks.lock().clone()
    }

    /// Messages currently held by `stream`, oldest first.
    #[must_use]
    pub fn messages(&self, stream: &str) -> Vec<StoredMessage> {
        self.inner
            .state
            .lock()
            .streams
            .get(stream)
            .map(|stream| stream.messages.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of the streams that exist, sorted.
    #[must_use]
    pub fn stream_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.state.lock().streams.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of the consumers on `stream`, sorted.
    #[must_use]
    pub fn consumer_names(&self, stream: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .state
            .lock()
            .streams
            .get(stream)
            .map(|stream| stream.consumers.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Deliveries of `consumer` awaiting acknowledgement.
    #[must_use]
    pub fn pending(&self, stream: &str, consumer: &str) -> usize {
        self.inner
            .state
            .lock()
            .streams
            .get(stream)
            .and_then(|stream| stream.consumers.get(consumer))
            .map_or(0, |consumer| consumer.pending.len())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Error = Error;
    type Consumer = MemoryPullConsumer;

    async fn create_or_update_stream(&self, spec: StreamSpec) -> Result<(), Error> {
        self.inner.ensure_connected()?;

        let mut state = self.inner.state.lock();
        match state.streams.get_mut(&spec.name) {
            Some(stream) => stream.reconfigure(spec),
            None => {
                debug!(stream = %spec.name, subjects = ?spec.subjects, "stream created");
                state
                    .streams
                    .insert(spec.name.clone(), StreamState::new(spec));
            }
        }

        Ok(())
    }

    async fn create_or_update_consumer(
        &self,
        stream: &str,
        spec: ConsumerSpec,
    ) -> Result<MemoryPullConsumer, Error> {
        self.inner.ensure_connected()?;

        let name = {
            let mut state = self.inner.state.lock();
            let name = match spec.durable_name.clone().or_else(|| spec.name.clone()) {
                Some(name) => name,
                None => {
                    state.ephemeral_counter += 1;
                    format!("ephemeral-{}", state.ephemeral_counter)
                }
            };
            state.stream_mut(stream)?.add_consumer(&name, spec)?;
            name
        };
        debug!(stream, consumer = %name, "consumer created or updated");

        Ok(MemoryPullConsumer::new(
            self.inner.clone(),
            stream.to_string(),
            name,
        ))
    }

    async fn consumer_spec(&self, stream: &str, name: &str) -> Result<ConsumerSpec, Error> {
        self.inner.ensure_connected()?;

        self.inner
            .state
            .lock()
            .stream(stream)?
            .consumers
            .get(name)
            .map(|consumer| consumer.spec.clone())
            .ok_or_else(|| Error::ConsumerNotFound {
                stream: stream.to_string(),
                consumer: name.to_string(),
            })
    }

    async fn consumer_backlog(&self, stream: &str, name: &str) -> Result<ConsumerBacklog, Error> {
        self.inner.ensure_connected()?;

        self.inner.state.lock().stream(stream)?.backlog(name)
    }

    async fn delete_consumer(&self, stream: &str, name: &str) -> Result<(), Error> {
        self.inner.ensure_connected()?;

        let removed = self
            .inner
            .state
            .lock()
            .stream_mut(stream)?
            .consumers
            .remove(name);
        if removed.is_none() {
            return Err(Error::ConsumerNotFound {
                stream: stream.to_string(),
                consumer: name.to_string(),
            });
        }

        debug!(stream, consumer = name, "consumer deleted");
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn purge_subject(&self, stream: &str, subject: &str) -> Result<u64, Error> {
        self.inner.ensure_connected()?;

        let purged = self.inner.state.lock().stream_mut(stream)?.purge(subject);
        debug!(stream, subject, purged, "subject purged");

        self.inner.notify.notify_waiters();
        Ok(purged)
    }

    async fn purge_subject_before(
        &self,
        stream: &str,
        subject: &str,
        sequence: u64,
    ) -> Result<u64, Error> {
        self.inner.ensure_connected()?;

        let purged = self
            .inner
            .state
            .lock()
            .stream_mut(stream)?
            .purge_before(subject, sequence);
        debug!(stream, subject, sequence, purged, "subject purged");

        self.inner.notify.notify_waiters();
        Ok(purged)
    }

    async fn publish(&self, subject: &str, headers: Headers, payload: Bytes) -> Result<u64, Error> {
        self.inner.ensure_connected()?;

        let sequence = {
            let mut state = self.inner.state.lock();
            let stream = state
                .streams
                .values_mut()
                .find(|stream| stream.captures(subject))
                .ok_or_else(|| Error::NoStream(subject.to_string()))?;
            stream.append(subject, headers, payload)
        };
        trace!(subject, sequence, "message stored");

        self.inner.notify.notify_waiters();
        Ok(sequence)
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn flush(&self) -> Result<(), Error> {
        self.inner.ensure_connected()
    }

    async fn account_info(&self) -> Result<Option<AccountInfo>, Error> {
        self.inner.ensure_connected()?;

        if self.inner.withhold_account_info.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let state = self.inner.state.lock();
        Ok(Some(AccountInfo {
            streams: state.streams.len(),
            consumers: state.streams.values().map(|s| s.consumers.len()).sum(),
            memory: state
                .streams
                .values()
                .flat_map(|s| s.messages.values())
                .map(|m| u64::try_from(m.payload.len()).unwrap_or(u64::MAX))
                .sum(),
            storage: 0,
        }))
    }
}
