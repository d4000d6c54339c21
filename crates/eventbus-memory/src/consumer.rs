use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use frolf_eventbus::broker::{BrokerMessage, Headers, MessageInfo, PullConsumer};
use tokio::time::Instant;

use crate::state::{Delivery, StoredMessage};
use crate::{AckKind, Error, Inner};

/// A pull consumer on a [`crate::MemoryBroker`] stream.
#[derive(Clone, Debug)]
pub struct MemoryPullConsumer {
    inner: Arc<Inner>,
    stream: String,
    name: String,
}

impl MemoryPullConsumer {
    pub(crate) const fn new(inner: Arc<Inner>, stream: String, name: String) -> Self {
        Self {
            inner,
            stream,
            name,
        }
    }

    fn message(&self, delivery: Delivery) -> MemoryMessage {
        MemoryMessage {
            inner: self.inner.clone(),
            stream: self.stream.clone(),
            consumer: self.name.clone(),
            stored: delivery.message,
            num_delivered: delivery.num_delivered,
            consumer_sequence: delivery.consumer_sequence,
        }
    }
}

#[async_trait]
impl PullConsumer for MemoryPullConsumer {
    type Error = Error;
    type Message = MemoryMessage;

    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, batch: usize, max_wait: Duration) -> Result<Vec<MemoryMessage>, Error> {
        self.inner.check_fetch()?;
        let deadline = Instant::now() + max_wait;

        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut state = self.inner.state.lock();
                let stream = state.stream_mut(&self.stream)?;
                let deliveries = stream.take(&self.name, batch)?;
                if !deliveries.is_empty() {
                    drop(state);
                    return Ok(deliveries
                        .into_iter()
                        .map(|delivery| self.message(delivery))
                        .collect());
                }
                stream.next_due(&self.name)
            };

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            let wake = next_due.map_or(deadline, |due| due.min(deadline));
            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}

/// A message delivered by a [`MemoryPullConsumer`].
#[derive(Debug)]
pub struct MemoryMessage {
    inner: Arc<Inner>,
    stream: String,
    consumer: String,
    stored: StoredMessage,
    num_delivered: u64,
    consumer_sequence: u64,
}

impl MemoryMessage {
    fn settle(&self, kind: AckKind) -> Result<(), Error> {
        self.inner.record(&self.consumer, self.stored.sequence, self.num_delivered, kind);

        let mut state = self.inner.state.lock();
        let consumer = state.consumer_mut(&self.stream, &self.consumer)?;
        let ack_wait = consumer.spec.ack_wait;
        let sequence = self.stored.sequence;

        let Some(pending) = consumer
            .pending
            .get_mut(&sequence)
            .filter(|pending| pending.num_delivered == self.num_delivered)
        else {
            // Already settled, or redelivered since.
            return Ok(());
        };

        match kind {
            AckKind::Ack | AckKind::Term => {
                consumer.pending.remove(&sequence);
            }
            AckKind::Nak(delay) => pending.redeliver_at = Instant::now() + delay.unwrap_or_default(),
            AckKind::InProgress => pending.redeliver_at = Instant::now() + ack_wait,
        }
        drop(state);

        self.inner.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl BrokerMessage for MemoryMessage {
    type Error = Error;

    fn subject(&self) -> &str {
        &self.stored.subject
    }

    fn payload(&self) -> &Bytes {
        &self.stored.payload
    }

    fn headers(&self) -> Headers {
        self.stored.headers.clone()
    }

    fn info(&self) -> Result<MessageInfo, Error> {
        Ok(MessageInfo {
            stream: self.stream.clone(),
            consumer: self.consumer.clone(),
            num_delivered: self.num_delivered,
            stream_sequence: self.stored.sequence,
            consumer_sequence: self.consumer_sequence,
            timestamp: self.stored.timestamp,
            domain: None,
        })
    }

    async fn ack(&self) -> Result<(), Error> {
        self.settle(AckKind::Ack)
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<(), Error> {
        self.settle(AckKind::Nak(delay))
    }

    async fn term(&self) -> Result<(), Error> {
        self.settle(AckKind::Term)
    }

    async fn in_progress(&self) -> Result<(), Error> {
        self.settle(AckKind::InProgress)
    }
}
