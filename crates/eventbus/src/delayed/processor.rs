use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{DELAYED_STREAM, DelayedScheduler, delayed_subject, processor_name};
use crate::broker::{Broker, BrokerMessage, PullConsumer};
use crate::envelope::{Envelope, keys};
use crate::subscriber::{fetch_error_backoff, jittered};

/// What happened to one delayed message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Disposition {
    /// Not due yet; NAK'd with the remaining delay.
    Waiting,

    /// Republished and acked, or terminated as unusable.
    Settled,

    /// Republish failed; NAK'd for retry.
    Retry,
}

/// Pulls a round's consumer until the round is drained, cancelled or the scheduler closes.
///
/// A drained round has its settled messages purged and its consumer deleted, so a later
/// consumer for the round cannot execute them again. If the round was rescheduled
/// meanwhile the consumer is recreated and pulling resumes.
pub(super) async fn run<B>(
    scheduler: &DelayedScheduler<B>,
    round_id: &str,
    generation: u64,
    mut consumer: B::Consumer,
    mut cancel: CancellationToken,
) where
    B: Broker,
{
    let inner = &scheduler.inner;

    debug!(round_id, "delayed processor started");

    loop {
        let ack_floor = pull(scheduler, round_id, generation, &consumer, &cancel).await;

        if inner.shutdown.is_cancelled() {
            debug!(round_id, "delayed processor stopped for shutdown");
            return;
        }

        if let Some(ack_floor) = ack_floor {
            purge_settled(scheduler, round_id, ack_floor).await;
        }
        delete_consumer(scheduler, round_id).await;

        let Some(next) = scheduler.finish_retire(round_id, generation) else {
            debug!(round_id, "delayed processor finished");
            return;
        };

        consumer = match scheduler.create_consumer(round_id).await {
            Ok(consumer) => consumer,
            Err(error) => {
                error!(round_id, %error, "failed to recreate processor consumer");
                scheduler.forget(round_id, generation);
                return;
            }
        };
        cancel = next;
        debug!(round_id, "delayed processor restarted");
    }
}

/// Fetches and handles messages until `cancel` fires or the round is drained and
/// nothing new was scheduled. A drained round returns its ack floor.
async fn pull<B>(
    scheduler: &DelayedScheduler<B>,
    round_id: &str,
    generation: u64,
    consumer: &B::Consumer,
    cancel: &CancellationToken,
) -> Option<u64>
where
    B: Broker,
{
    let inner = &scheduler.inner;
    let mut failures: i32 = 0;

    loop {
        let fetched = tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            fetched = consumer.fetch(1, inner.fetch_max_wait) => fetched,
        };

        match fetched {
            Ok(messages) if messages.is_empty() => {
                failures = 0;
                if let Some(ack_floor) = drained(scheduler, round_id).await {
                    if scheduler.begin_retire(round_id, generation) {
                        return Some(ack_floor);
                    }
                }
            }
            Ok(messages) => {
                failures = 0;
                for message in messages {
                    let disposition = handle(scheduler, round_id, &message).await;
                    debug!(round_id, ?disposition, "delayed message handled");
                }
            }
            Err(error) => {
                failures = failures.saturating_add(1);
                let wait = jittered(fetch_error_backoff(failures));
                warn!(round_id, %error, attempt = failures, ?wait, "delayed fetch failed");

                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return None,
                    () = tokio::time::sleep(wait) => {}
                }
            }
        }
    }
}

/// The ack floor of the round's consumer if nothing is left stored, in flight or waiting
/// on a NAK delay.
async fn drained<B>(scheduler: &DelayedScheduler<B>, round_id: &str) -> Option<u64>
where
    B: Broker,
{
    match scheduler
        .inner
        .broker
        .consumer_backlog(DELAYED_STREAM, &processor_name(round_id))
        .await
    {
        Ok(backlog) if backlog.is_drained() => Some(backlog.ack_floor),
        Ok(_) => None,
        Err(error) => {
            warn!(round_id, %error, "failed to read processor backlog");
            None
        }
    }
}

/// Removes the round's messages through `ack_floor`; later ones were scheduled after the
/// round drained and stay for the next processor.
async fn purge_settled<B>(scheduler: &DelayedScheduler<B>, round_id: &str, ack_floor: u64)
where
    B: Broker,
{
    let subject = delayed_subject(round_id);
    match scheduler
        .inner
        .broker
        .purge_subject_before(DELAYED_STREAM, &subject, ack_floor.saturating_add(1))
        .await
    {
        Ok(purged) => debug!(round_id, ack_floor, purged, "settled delayed messages purged"),
        Err(error) => warn!(round_id, %error, "failed to purge settled delayed messages"),
    }
}

async fn delete_consumer<B>(scheduler: &DelayedScheduler<B>, round_id: &str)
where
    B: Broker,
{
    let inner = &scheduler.inner;
    let name = processor_name(round_id);
    match tokio::time::timeout(
        inner.config.consumer_delete_timeout,
        inner.broker.delete_consumer(DELAYED_STREAM, &name),
    )
    .await
    {
        Ok(Ok(())) => debug!(round_id, consumer = %name, "processor consumer deleted"),
        Ok(Err(error)) => warn!(round_id, consumer = %name, %error, "failed to delete processor consumer"),
        Err(_) => warn!(round_id, consumer = %name, "timed out deleting processor consumer"),
    }
}

/// Executes a due message, or defers it until due.
pub(super) async fn handle<B, M>(
    scheduler: &DelayedScheduler<B>,
    round_id: &str,
    message: &M,
) -> Disposition
where
    B: Broker,
    M: BrokerMessage,
{
    let inner = &scheduler.inner;

    let envelope = match Envelope::from_broker_message(message) {
        Ok(envelope) => envelope,
        Err(error) => {
            warn!(round_id, %error, "unreadable delayed message, terminating");
            terminate(message, round_id).await;
            return Disposition::Settled;
        }
    };

    let Some(original_subject) = envelope
        .get(keys::ORIGINAL_SUBJECT)
        .filter(|subject| !subject.is_empty())
        .map(str::to_string)
    else {
        warn!(round_id, "delayed message without original subject, terminating");
        terminate(message, round_id).await;
        return Disposition::Settled;
    };

    let Some(execute_at) = envelope.get(keys::EXECUTE_AT).and_then(parse_execute_at) else {
        warn!(
            round_id,
            execute_at = envelope.get(keys::EXECUTE_AT),
            "delayed message without a valid due time, terminating"
        );
        terminate(message, round_id).await;
        return Disposition::Settled;
    };

    let now = Utc::now();
    if execute_at > now {
        let remaining = (execute_at - now).to_std().unwrap_or_default();
        if let Err(error) = message.nak(Some(remaining)).await {
            warn!(round_id, %error, "failed to defer delayed message");
        }
        debug!(round_id, ?remaining, "delayed message not due");
        return Disposition::Waiting;
    }

    let mut outgoing = envelope.detached();
    outgoing.metadata_mut().remove(keys::ORIGINAL_SUBJECT);
    outgoing.metadata_mut().remove(keys::EXECUTE_AT);

    match inner.publisher.publish(&original_subject, &[outgoing]).await {
        Ok(()) => {
            if let Err(error) = message.ack().await {
                warn!(round_id, %error, "failed to ack executed delayed message");
            }
            inner.metrics.delayed_executed();
            info!(round_id, subject = %original_subject, %execute_at, "delayed message executed");
            Disposition::Settled
        }
        Err(error) if error.is_configuration() => {
            warn!(round_id, subject = %original_subject, %error, "delayed message can never be published, terminating");
            terminate(message, round_id).await;
            Disposition::Settled
        }
        Err(error) => {
            warn!(round_id, subject = %original_subject, %error, "republish failed, will retry");
            if let Err(error) = message.nak(None).await {
                warn!(round_id, %error, "nak failed");
            }
            Disposition::Retry
        }
    }
}

pub(super) fn parse_execute_at(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|execute_at| execute_at.with_timezone(&Utc))
}

async fn terminate<M>(message: &M, round_id: &str)
where
    M: BrokerMessage,
{
    if let Err(error) = message.term().await {
        warn!(round_id, %error, "term failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppType;
    use crate::config::DelayedConfig;
    use crate::metrics::EventBusMetrics;
    use crate::publisher::Publisher;
    use crate::testing::{AckCall, RecordingBroker, ScriptedMessage};
    use crate::topic::TopicPolicy;
    use chrono::{SecondsFormat, TimeDelta};
    use std::sync::Arc;
    use std::time::Duration;

    fn scheduler(broker: &RecordingBroker) -> DelayedScheduler<RecordingBroker> {
        let publisher = Arc::new(Publisher::new(
            broker.clone(),
            TopicPolicy::for_app(AppType::Backend),
            EventBusMetrics::disabled(),
        ));
        DelayedScheduler::new(
            broker.clone(),
            publisher,
            DelayedConfig::default(),
            Duration::from_millis(20),
            EventBusMetrics::disabled(),
        )
    }

    fn delayed(execute_at: DateTime<Utc>) -> ScriptedMessage {
        ScriptedMessage::new("delayed.message.r1", 1)
            .with_payload(b"remind")
            .with_header("original_subject", "round.reminder.v1")
            .with_header("round_id", "r1")
            .with_header("guild_id", "g-1")
            .with_header(
                "execute_at",
                &execute_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            )
    }

    #[tokio::test]
    async fn future_message_is_deferred_by_remaining_time() {
        let broker = RecordingBroker::new();
        let message = delayed(Utc::now() + TimeDelta::minutes(5));

        let disposition = handle(&scheduler(&broker), "r1", &message).await;

        assert_eq!(disposition, Disposition::Waiting);
        let calls = message.calls();
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            AckCall::Nak(Some(delay)) => {
                assert!(*delay > Duration::from_secs(290));
                assert!(*delay <= Duration::from_secs(300));
            }
            other => panic!("unexpected call {other:?}"),
        }
        assert!(broker.published_subjects().is_empty());
    }

    #[tokio::test]
    async fn due_message_is_republished_without_delayed_keys() {
        let broker = RecordingBroker::new();
        let message = delayed(Utc::now() - TimeDelta::seconds(1));

        let disposition = handle(&scheduler(&broker), "r1", &message).await;

        assert_eq!(disposition, Disposition::Settled);
        assert_eq!(message.calls(), vec![AckCall::Ack]);

        let state = broker.state();
        let (subject, headers, payload) = &state.published[0];
        assert_eq!(subject, "round.reminder.v1");
        assert_eq!(payload.as_ref(), b"remind");
        assert_eq!(headers.get("round_id"), Some(&vec!["r1".to_string()]));
        assert_eq!(headers.get("guild_id"), Some(&vec!["g-1".to_string()]));
        assert!(!headers.contains_key("original_subject"));
        assert!(!headers.contains_key("execute_at"));
        assert!(!headers.contains_key("_js_stream"));
        assert!(!headers.contains_key("stream"));
    }

    #[tokio::test]
    async fn missing_subject_terminates() {
        let broker = RecordingBroker::new();
        let message = ScriptedMessage::new("delayed.message.r1", 1)
            .with_header("round_id", "r1")
            .with_header("execute_at", "2020-01-01T00:00:00Z");

        let disposition = handle(&scheduler(&broker), "r1", &message).await;

        assert_eq!(disposition, Disposition::Settled);
        assert_eq!(message.calls(), vec![AckCall::Term]);
    }

    #[tokio::test]
    async fn invalid_due_time_terminates() {
        let broker = RecordingBroker::new();
        let message = ScriptedMessage::new("delayed.message.r1", 1)
            .with_header("original_subject", "round.reminder.v1")
            .with_header("execute_at", "tomorrow");

        handle(&scheduler(&broker), "r1", &message).await;

        assert_eq!(message.calls(), vec![AckCall::Term]);
    }

    #[tokio::test]
    async fn publish_failure_is_retried() {
        let broker = RecordingBroker::new();
        broker.state().fail_publish = true;
        let message = delayed(Utc::now() - TimeDelta::seconds(1));

        let disposition = handle(&scheduler(&broker), "r1", &message).await;

        assert_eq!(disposition, Disposition::Retry);
        assert_eq!(message.calls(), vec![AckCall::Nak(None)]);
    }

    #[tokio::test]
    async fn forbidden_subject_terminates() {
        let broker = RecordingBroker::new();
        let message = ScriptedMessage::new("delayed.message.r1", 1)
            .with_header("original_subject", "discord.round.reminder.v1")
            .with_header("execute_at", "2020-01-01T00:00:00Z");

        handle(&scheduler(&broker), "r1", &message).await;

        assert_eq!(message.calls(), vec![AckCall::Term]);
    }

    #[test]
    fn parses_rfc3339_offsets() {
        let parsed = parse_execute_at("2030-05-01T12:00:00+02:00").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2030-05-01T10:00:00+00:00");
        assert!(parse_execute_at("").is_none());
    }
}
