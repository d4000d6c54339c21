use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::processor::parse_execute_at;
use super::{DELAYED_STREAM, DelayedScheduler};
use crate::broker::{AckPolicy, Broker, ConsumerSpec, DeliverPolicy, PullConsumer};
use crate::envelope::{Envelope, keys};

/// Idle timeout after which the broker removes an abandoned recovery consumer.
const RECOVERY_INACTIVE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

const RECOVERY_BATCH: usize = 100;

/// What a recovery pass found in the delayed stream.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RecoverySummary {
    /// Rounds whose processor was (re)started.
    pub started: Vec<String>,

    /// Rounds whose messages are all past due, left untouched.
    pub skipped: Vec<String>,

    /// Messages that lacked a round id or a valid due time.
    pub malformed: usize,
}

pub(super) async fn recover<B>(
    scheduler: &DelayedScheduler<B>,
    cx: &CancellationToken,
) -> RecoverySummary
where
    B: Broker,
{
    let inner = &scheduler.inner;
    let mut summary = RecoverySummary::default();

    if inner.recovered.swap(true, Ordering::SeqCst) {
        debug!("delayed recovery already ran");
        return summary;
    }

    let name = format!("delayed_recovery_{}", Uuid::new_v4().simple());
    let spec = ConsumerSpec {
        name: Some(name.clone()),
        filter_subject: "delayed.message.>".to_string(),
        ack_policy: AckPolicy::None,
        deliver_policy: DeliverPolicy::All,
        inactive_threshold: RECOVERY_INACTIVE_THRESHOLD,
        ..ConsumerSpec::default()
    };

    let consumer = match inner
        .broker
        .create_or_update_consumer(DELAYED_STREAM, spec)
        .await
    {
        Ok(consumer) => consumer,
        Err(error) => {
            error!(%error, "failed to create delayed recovery consumer");
            return summary;
        }
    };

    let fetch_timeout = inner.config.recovery_fetch_timeout;
    let mut started = HashSet::new();
    let mut past_due = BTreeSet::new();

    loop {
        let fetched = tokio::select! {
            biased;
            () = cx.cancelled() => {
                warn!("delayed recovery cancelled");
                break;
            }
            fetched = tokio::time::timeout(fetch_timeout, consumer.fetch(RECOVERY_BATCH, fetch_timeout)) => fetched,
        };

        let messages = match fetched {
            Ok(Ok(messages)) if messages.is_empty() => break,
            Ok(Ok(messages)) => messages,
            Ok(Err(error)) => {
                warn!(%error, "delayed recovery fetch failed");
                break;
            }
            Err(_) => {
                debug!(?fetch_timeout, "delayed recovery fetch timed out");
                break;
            }
        };

        for message in messages {
            let envelope = match Envelope::from_broker_message(&message) {
                Ok(envelope) => envelope,
                Err(error) => {
                    warn!(%error, "unreadable delayed message during recovery");
                    summary.malformed += 1;
                    continue;
                }
            };

            let Some(round_id) = envelope
                .get(keys::ROUND_ID)
                .filter(|round_id| !round_id.is_empty())
            else {
                warn!(uuid = envelope.uuid(), "delayed message without round id");
                summary.malformed += 1;
                continue;
            };

            if started.contains(round_id) {
                continue;
            }

            let Some(execute_at) = envelope.get(keys::EXECUTE_AT).and_then(parse_execute_at)
            else {
                warn!(round_id, "delayed message without a valid due time");
                summary.malformed += 1;
                continue;
            };

            if execute_at <= Utc::now() {
                debug!(round_id, %execute_at, "past-due delayed message");
                past_due.insert(round_id.to_string());
                continue;
            }

            started.insert(round_id.to_string());
            match scheduler.start_processor(round_id).await {
                Ok(()) => {
                    info!(round_id, %execute_at, "recovered delayed round");
                    summary.started.push(round_id.to_string());
                }
                Err(error) => warn!(round_id, %error, "failed to restart delayed processor"),
            }
        }
    }

    // A round with any future message was started; only wholly past-due rounds are skipped.
    for round_id in past_due.into_iter().filter(|round_id| !started.contains(round_id)) {
        info!(round_id = %round_id, "skipping past-due delayed round");
        summary.skipped.push(round_id);
    }

    match tokio::time::timeout(
        inner.config.consumer_delete_timeout,
        inner.broker.delete_consumer(DELAYED_STREAM, &name),
    )
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(error)) => warn!(consumer = %name, %error, "failed to delete recovery consumer"),
        Err(_) => warn!(consumer = %name, "timed out deleting recovery consumer"),
    }

    info!(
        started = summary.started.len(),
        skipped = summary.skipped.len(),
        malformed = summary.malformed,
        "delayed recovery finished"
    );

    summary
}
