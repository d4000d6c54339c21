use tracing::{debug, instrument, warn};

use crate::broker::Broker;
use crate::envelope::{Envelope, keys};
use crate::error::{Error, Result};
use crate::metrics::EventBusMetrics;
use crate::topic::TopicPolicy;
use crate::trace;

/// Authorizes, annotates and forwards envelopes to the broker.
#[derive(Debug)]
pub struct Publisher<B>
where
    B: Broker,
{
    broker: B,
    policy: TopicPolicy,
    metrics: EventBusMetrics,
}

impl<B> Publisher<B>
where
    B: Broker,
{
    /// Creates a publisher gated by `policy`.
    pub const fn new(broker: B, policy: TopicPolicy, metrics: EventBusMetrics) -> Self {
        Self {
            broker,
            policy,
            metrics,
        }
    }

    /// The authorization policy in force.
    pub const fn policy(&self) -> &TopicPolicy {
        &self.policy
    }

    /// Publishes `envelopes` to `topic`.
    ///
    /// An empty `topic` falls back to each envelope's `topic` metadata. Every envelope is
    /// authorized before any is sent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTopic`] when no topic can be determined,
    /// [`Error::Forbidden`] when the role may not use it, or [`Error::Broker`] when the
    /// broker rejects a publish. Envelopes before the failing one remain published.
    #[instrument(skip(self, envelopes), fields(count = envelopes.len()))]
    pub async fn publish(&self, topic: &str, envelopes: &[Envelope]) -> Result<()> {
        let mut routed = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            let target = resolve_topic(topic, envelope)?;
            self.policy.authorize(target)?;
            routed.push((target, envelope));
        }

        for (target, envelope) in routed {
            let mut outgoing = envelope.clone();
            trace::inject(outgoing.metadata_mut());

            match self
                .broker
                .publish(target, outgoing.to_headers(), outgoing.payload().clone())
                .await
            {
                Ok(sequence) => {
                    self.metrics.published(target);
                    debug!(topic = target, uuid = envelope.uuid(), sequence, "published");
                }
                Err(error) => {
                    self.metrics.publish_error(target);
                    warn!(topic = target, uuid = envelope.uuid(), %error, "publish failed");
                    return Err(Error::broker(error));
                }
            }
        }

        Ok(())
    }
}

fn resolve_topic<'a>(topic: &'a str, envelope: &'a Envelope) -> Result<&'a str> {
    if !topic.is_empty() {
        return Ok(topic);
    }

    envelope
        .get(keys::TOPIC)
        .filter(|topic| !topic.is_empty())
        .ok_or(Error::InvalidTopic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppType;
    use crate::broker::MSG_ID_HEADER;
    use crate::testing::RecordingBroker;
    use assert_matches::assert_matches;

    fn publisher(broker: &RecordingBroker) -> Publisher<RecordingBroker> {
        Publisher::new(
            broker.clone(),
            TopicPolicy::for_app(AppType::Backend),
            EventBusMetrics::disabled(),
        )
    }

    #[tokio::test]
    async fn empty_topic_falls_back_to_metadata() {
        let broker = RecordingBroker::new();
        let envelope = Envelope::new("payload").with_metadata(
            "topic",
            "leaderboard.tag.lookup.by.user.id.success.v1",
        );

        publisher(&broker).publish("", &[envelope]).await.unwrap();

        assert_eq!(
            broker.published_subjects(),
            vec!["leaderboard.tag.lookup.by.user.id.success.v1".to_string()]
        );
    }

    #[tokio::test]
    async fn empty_topic_without_metadata_is_invalid() {
        let broker = RecordingBroker::new();

        let result = publisher(&broker).publish("", &[Envelope::new("x")]).await;

        assert_matches!(result, Err(Error::InvalidTopic));
        assert!(broker.published_subjects().is_empty());
    }

    #[tokio::test]
    async fn forbidden_topic_never_reaches_broker() {
        let broker = RecordingBroker::new();
        let envelopes = [
            Envelope::new("ok").with_metadata("topic", "round.created.v1"),
            Envelope::new("bad").with_metadata("topic", "discord.leaderboard.tag.lookup.request.v1"),
        ];

        let result = publisher(&broker).publish("", &envelopes).await;

        assert_matches!(result, Err(Error::Forbidden { .. }));
        assert!(broker.published_subjects().is_empty());
    }

    #[tokio::test]
    async fn sends_message_id_and_metadata() {
        let broker = RecordingBroker::new();
        let envelope = Envelope::with_uuid("u-1", "x").with_metadata("guild_id", "g");

        publisher(&broker)
            .publish("round.created.v1", &[envelope])
            .await
            .unwrap();

        let state = broker.state();
        let (_, headers, payload) = &state.published[0];
        assert_eq!(headers.get(MSG_ID_HEADER), Some(&vec!["u-1".to_string()]));
        assert_eq!(headers.get("guild_id"), Some(&vec!["g".to_string()]));
        assert_eq!(payload.as_ref(), b"x");
    }

    #[tokio::test]
    async fn broker_failure_is_surfaced() {
        let broker = RecordingBroker::new();
        broker.state().fail_publish = true;

        let result = publisher(&broker)
            .publish("round.created.v1", &[Envelope::new("x")])
            .await;

        assert_matches!(result, Err(Error::Broker(_)));
    }
}
