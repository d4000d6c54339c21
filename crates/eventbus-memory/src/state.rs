use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use frolf_eventbus::broker::{
    AckPolicy, ConsumerBacklog, ConsumerSpec, DeliverPolicy, Headers, MSG_ID_HEADER, StreamSpec,
};
use frolf_eventbus::topic::subject_matches;
use tokio::time::Instant;

use crate::Error;

/// A message held by a stream.
#[derive(Clone, Debug)]
pub struct StoredMessage {
    /// Stream sequence.
    pub sequence: u64,

    /// Subject it was published on.
    pub subject: String,

    /// Headers as published.
    pub headers: Headers,

    /// Payload as published.
    pub payload: Bytes,

    /// Wall-clock time it was stored.
    pub timestamp: DateTime<Utc>,

    stored_at: Instant,
}

#[derive(Debug)]
pub struct Pending {
    pub num_delivered: u64,
    pub redeliver_at: Instant,
}

#[derive(Debug)]
pub struct ConsumerState {
    pub spec: ConsumerSpec,
    cursor: u64,
    consumer_sequence: u64,
    pub pending: BTreeMap<u64, Pending>,
    last_active: Instant,
}

impl ConsumerState {
    fn new(spec: ConsumerSpec, last_sequence: u64, now: Instant) -> Self {
        let cursor = match spec.deliver_policy {
            DeliverPolicy::All => 0,
            DeliverPolicy::New => last_sequence,
        };

        Self {
            spec,
            cursor,
            consumer_sequence: 0,
            pending: BTreeMap::new(),
            last_active: now,
        }
    }

    /// How long a delivery stays unacknowledged before it is redelivered.
    pub fn ack_timeout(&self, num_delivered: u64) -> Duration {
        let backoff = &self.spec.backoff;
        if backoff.is_empty() {
            return self.spec.ack_wait;
        }

        let index = usize::try_from(num_delivered.saturating_sub(1)).unwrap_or(usize::MAX);
        backoff[index.min(backoff.len() - 1)]
    }

    fn exhausted(&self, num_delivered: u64) -> bool {
        self.spec.max_deliver > 0
            && i64::try_from(num_delivered).unwrap_or(i64::MAX) >= self.spec.max_deliver
    }

    fn pending_full(&self) -> bool {
        self.spec.ack_policy == AckPolicy::Explicit
            && self.spec.max_ack_pending > 0
            && i64::try_from(self.pending.len()).unwrap_or(i64::MAX) >= self.spec.max_ack_pending
    }

    fn filters(&self, subject: &str) -> bool {
        self.spec.filter_subject.is_empty() || subject_matches(&self.spec.filter_subject, subject)
    }

    fn idle_expired(&self, now: Instant) -> bool {
        self.spec.durable_name.is_none()
            && !self.spec.inactive_threshold.is_zero()
            && now.duration_since(self.last_active) > self.spec.inactive_threshold
    }
}

/// One message handed out by a fetch.
#[derive(Debug)]
pub struct Delivery {
    pub message: StoredMessage,
    pub num_delivered: u64,
    pub consumer_sequence: u64,
}

#[derive(Debug)]
pub struct StreamState {
    pub spec: StreamSpec,
    pub messages: BTreeMap<u64, StoredMessage>,
    last_sequence: u64,
    dedup: HashMap<String, (Instant, u64)>,
    pub consumers: HashMap<String, ConsumerState>,
}

impl StreamState {
    pub fn new(spec: StreamSpec) -> Self {
        Self {
            spec,
            messages: BTreeMap::new(),
            last_sequence: 0,
            dedup: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    pub fn captures(&self, subject: &str) -> bool {
        self.spec
            .subjects
            .iter()
            .any(|filter| subject_matches(filter, subject))
    }

    pub fn reconfigure(&mut self, spec: StreamSpec) {
        self.spec = spec;
        self.enforce_limits(Instant::now());
    }

    /// Stores a message, returning its sequence. A message id seen inside the duplicate
    /// window returns the original sequence without storing.
    pub fn append(&mut self, subject: &str, headers: Headers, payload: Bytes) -> u64 {
        let now = Instant::now();
        let message_id = headers
            .get(MSG_ID_HEADER)
            .and_then(|values| values.first())
            .cloned();

        if let (Some(window), Some(message_id)) = (self.spec.duplicate_window, &message_id) {
            self.dedup
                .retain(|_, (seen, _)| now.duration_since(*seen) < window);
            if let Some((_, sequence)) = self.dedup.get(message_id) {
                return *sequence;
            }
        }

        self.last_sequence += 1;
        let sequence = self.last_sequence;
        self.messages.insert(
            sequence,
            StoredMessage {
                sequence,
                subject: subject.to_string(),
                headers,
                payload,
                timestamp: Utc::now(),
                stored_at: now,
            },
        );

        if let (Some(window), Some(message_id)) = (self.spec.duplicate_window, message_id) {
            if !window.is_zero() {
                self.dedup.insert(message_id, (now, sequence));
            }
        }

        self.enforce_limits(now);
        sequence
    }

    pub fn purge(&mut self, subject: &str) -> u64 {
        self.purge_before(subject, u64::MAX)
    }

    /// Removes messages on `subject` stored below `sequence`.
    pub fn purge_before(&mut self, subject: &str, sequence: u64) -> u64 {
        let before = self.messages.len();
        self.messages.retain(|stored, message| {
            *stored >= sequence || !subject_matches(subject, &message.subject)
        });
        u64::try_from(before - self.messages.len()).unwrap_or(u64::MAX)
    }

    pub fn add_consumer(&mut self, name: &str, spec: ConsumerSpec) -> Result<(), Error> {
        let now = Instant::now();
        self.consumers.retain(|_, consumer| !consumer.idle_expired(now));

        match self.consumers.get_mut(name) {
            Some(existing) => {
                if existing.spec.deliver_policy != spec.deliver_policy {
                    return Err(Error::Immutable {
                        consumer: name.to_string(),
                        field: "deliver_policy",
                    });
                }
                existing.spec = spec;
                existing.last_active = now;
            }
            None => {
                self.consumers.insert(
                    name.to_string(),
                    ConsumerState::new(spec, self.last_sequence, now),
                );
            }
        }

        Ok(())
    }

    /// Takes up to `batch` deliveries for `consumer`: due redeliveries first, then new
    /// messages matching its filter.
    pub fn take(&mut self, consumer: &str, batch: usize) -> Result<Vec<Delivery>, Error> {
        let now = Instant::now();
        self.enforce_limits(now);

        let Self {
            spec,
            messages,
            consumers,
            ..
        } = self;
        let state = consumers
            .get_mut(consumer)
            .ok_or_else(|| Error::ConsumerNotFound {
                stream: spec.name.clone(),
                consumer: consumer.to_string(),
            })?;
        state.last_active = now;

        let mut deliveries = Vec::new();

        let due: Vec<u64> = state
            .pending
            .iter()
            .filter(|(_, pending)| pending.redeliver_at <= now)
            .map(|(sequence, _)| *sequence)
            .collect();
        for sequence in due {
            if deliveries.len() >= batch {
                break;
            }

            let Some(message) = messages.get(&sequence) else {
                state.pending.remove(&sequence);
                continue;
            };
            let Some(num_delivered) = state.pending.get(&sequence).map(|p| p.num_delivered)
            else {
                continue;
            };
            if state.exhausted(num_delivered) {
                state.pending.remove(&sequence);
                continue;
            }

            let num_delivered = num_delivered + 1;
            let redeliver_at = now + state.ack_timeout(num_delivered);
            state.pending.insert(
                sequence,
                Pending {
                    num_delivered,
                    redeliver_at,
                },
            );
            state.consumer_sequence += 1;
            deliveries.push(Delivery {
                message: message.clone(),
                num_delivered,
                consumer_sequence: state.consumer_sequence,
            });
        }

        let start = state.cursor + 1;
        for (sequence, message) in messages.range(start..) {
            if deliveries.len() >= batch || state.pending_full() {
                break;
            }
            state.cursor = *sequence;
            if !state.filters(&message.subject) {
                continue;
            }

            if state.spec.ack_policy == AckPolicy::Explicit {
                state.pending.insert(
                    *sequence,
                    Pending {
                        num_delivered: 1,
                        redeliver_at: now + state.ack_timeout(1),
                    },
                );
            }
            state.consumer_sequence += 1;
            deliveries.push(Delivery {
                message: message.clone(),
                num_delivered: 1,
                consumer_sequence: state.consumer_sequence,
            });
        }

        Ok(deliveries)
    }

    /// Counts what `consumer` has left to deliver and to see acknowledged.
    pub fn backlog(&self, consumer: &str) -> Result<ConsumerBacklog, Error> {
        let state = self
            .consumers
            .get(consumer)
            .ok_or_else(|| Error::ConsumerNotFound {
                stream: self.spec.name.clone(),
                consumer: consumer.to_string(),
            })?;

        let num_pending = self
            .messages
            .range(state.cursor + 1..)
            .filter(|(_, message)| state.filters(&message.subject))
            .count();
        let num_ack_pending = state
            .pending
            .keys()
            .filter(|sequence| self.messages.contains_key(sequence))
            .count();

        let ack_floor = state
            .pending
            .keys()
            .next()
            .map_or(state.cursor, |first| first - 1);

        Ok(ConsumerBacklog {
            num_pending: u64::try_from(num_pending).unwrap_or(u64::MAX),
            num_ack_pending: u64::try_from(num_ack_pending).unwrap_or(u64::MAX),
            ack_floor,
        })
    }

    /// Earliest instant a pending delivery of `consumer` becomes due again.
    pub fn next_due(&self, consumer: &str) -> Option<Instant> {
        self.consumers
            .get(consumer)?
            .pending
            .values()
            .map(|pending| pending.redeliver_at)
            .min()
    }

    fn enforce_limits(&mut self, now: Instant) {
        let max_age = self.spec.max_age;
        if !max_age.is_zero() {
            self.messages
                .retain(|_, message| now.duration_since(message.stored_at) < max_age);
        }

        if let Ok(max_messages) = usize::try_from(self.spec.max_messages) {
            if max_messages > 0 {
                while self.messages.len() > max_messages {
                    self.messages.pop_first();
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct State {
    pub streams: HashMap<String, StreamState>,
    pub ephemeral_counter: u64,
}

impl State {
    pub fn stream(&self, name: &str) -> Result<&StreamState, Error> {
        self.streams
            .get(name)
            .ok_or_else(|| Error::StreamNotFound(name.to_string()))
    }

    pub fn stream_mut(&mut self, name: &str) -> Result<&mut StreamState, Error> {
        self.streams
            .get_mut(name)
            .ok_or_else(|| Error::StreamNotFound(name.to_string()))
    }

    pub fn consumer_mut(
        &mut self,
        stream: &str,
        consumer: &str,
    ) -> Result<&mut ConsumerState, Error> {
        self.stream_mut(stream)?
            .consumers
            .get_mut(consumer)
            .ok_or_else(|| Error::ConsumerNotFound {
                stream: stream.to_string(),
                consumer: consumer.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frolf_eventbus::broker::RetentionPolicy;

    fn stream(duplicate_window: Option<Duration>) -> StreamState {
        StreamState::new(StreamSpec {
            name: "round".to_string(),
            subjects: vec!["round.>".to_string()],
            retention: RetentionPolicy::Limits,
            max_age: Duration::ZERO,
            max_messages: -1,
            duplicate_window,
        })
    }

    fn with_id(id: &str) -> Headers {
        let mut headers = Headers::new();
        headers.insert(MSG_ID_HEADER.to_string(), vec![id.to_string()]);
        headers
    }

    #[tokio::test]
    async fn duplicate_ids_are_dropped_inside_the_window() {
        let mut stream = stream(Some(Duration::from_secs(300)));

        let first = stream.append("round.created.v1", with_id("a"), Bytes::new());
        let second = stream.append("round.created.v1", with_id("a"), Bytes::new());
        let third = stream.append("round.created.v1", with_id("b"), Bytes::new());

        assert_eq!(first, second);
        assert_eq!(third, 2);
        assert_eq!(stream.messages.len(), 2);
    }

    #[tokio::test]
    async fn without_a_window_duplicates_are_kept() {
        let mut stream = stream(None);

        stream.append("round.created.v1", with_id("a"), Bytes::new());
        stream.append("round.created.v1", with_id("a"), Bytes::new());

        assert_eq!(stream.messages.len(), 2);
    }

    #[tokio::test]
    async fn filter_and_redelivery_order() {
        let mut stream = stream(None);
        stream.append("round.created.v1", Headers::new(), Bytes::new());
        stream.append("round.deleted.v1", Headers::new(), Bytes::new());
        stream.append("round.created.v1", Headers::new(), Bytes::new());
        stream
            .add_consumer(
                "c",
                ConsumerSpec {
                    durable_name: Some("c".to_string()),
                    filter_subject: "round.created.v1".to_string(),
                    ..ConsumerSpec::default()
                },
            )
            .unwrap();

        let first = stream.take("c", 10).unwrap();
        assert_eq!(
            first.iter().map(|d| d.message.sequence).collect::<Vec<_>>(),
            vec![1, 3]
        );

        stream.consumers.get_mut("c").unwrap().pending.get_mut(&3).unwrap().redeliver_at =
            Instant::now();
        let second = stream.take("c", 10).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message.sequence, 3);
        assert_eq!(second[0].num_delivered, 2);
        assert_eq!(second[0].consumer_sequence, 3);
    }

    #[tokio::test]
    async fn backoff_drives_ack_timeout() {
        let mut stream = stream(None);
        stream
            .add_consumer(
                "c",
                ConsumerSpec {
                    durable_name: Some("c".to_string()),
                    backoff: vec![Duration::from_secs(1), Duration::from_secs(5)],
                    ..ConsumerSpec::default()
                },
            )
            .unwrap();
        let consumer = &stream.consumers["c"];

        assert_eq!(consumer.ack_timeout(1), Duration::from_secs(1));
        assert_eq!(consumer.ack_timeout(2), Duration::from_secs(5));
        assert_eq!(consumer.ack_timeout(9), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn deliver_policy_is_immutable() {
        let mut stream = stream(None);
        let spec = ConsumerSpec {
            durable_name: Some("c".to_string()),
            ..ConsumerSpec::default()
        };
        stream.add_consumer("c", spec.clone()).unwrap();

        let result = stream.add_consumer(
            "c",
            ConsumerSpec {
                deliver_policy: DeliverPolicy::New,
                ..spec
            },
        );

        assert!(matches!(result, Err(Error::Immutable { field: "deliver_policy", .. })));
    }

    #[tokio::test]
    async fn max_ack_pending_limits_new_deliveries() {
        let mut stream = stream(None);
        for _ in 0..5 {
            stream.append("round.created.v1", Headers::new(), Bytes::new());
        }
        stream
            .add_consumer(
                "c",
                ConsumerSpec {
                    durable_name: Some("c".to_string()),
                    max_ack_pending: 2,
                    ..ConsumerSpec::default()
                },
            )
            .unwrap();

        assert_eq!(stream.take("c", 10).unwrap().len(), 2);
        assert!(stream.take("c", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn backlog_counts_undelivered_and_unacked() {
        let mut stream = stream(None);
        stream.append("round.created.v1", Headers::new(), Bytes::new());
        stream.append("round.deleted.v1", Headers::new(), Bytes::new());
        stream.append("round.created.v1", Headers::new(), Bytes::new());
        stream
            .add_consumer(
                "c",
                ConsumerSpec {
                    durable_name: Some("c".to_string()),
                    filter_subject: "round.created.v1".to_string(),
                    ..ConsumerSpec::default()
                },
            )
            .unwrap();

        let before = stream.backlog("c").unwrap();
        assert_eq!((before.num_pending, before.num_ack_pending), (2, 0));

        stream.take("c", 1).unwrap();
        let after = stream.backlog("c").unwrap();
        assert_eq!((after.num_pending, after.num_ack_pending), (1, 1));
        assert_eq!(after.ack_floor, 0);

        stream.take("c", 1).unwrap();
        stream.consumers.get_mut("c").unwrap().pending.clear();
        assert_eq!(stream.backlog("c").unwrap().ack_floor, 3);

        assert_eq!(stream.purge_before("round.created.v1", 3), 1);
        assert_eq!(stream.messages.len(), 2);
        stream.purge("round.created.v1");
        assert!(stream.backlog("c").unwrap().is_drained());
        assert!(matches!(
            stream.backlog("missing"),
            Err(Error::ConsumerNotFound { .. })
        ));
    }
}
