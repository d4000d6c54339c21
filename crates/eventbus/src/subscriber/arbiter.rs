use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::TerminationSet;
use super::backoff::ack_heartbeat;
use crate::broker::BrokerMessage;
use crate::envelope::Outcome;
use crate::metrics::EventBusMetrics;
use crate::registry::ConsumerSettings;

/// Everything an arbiter needs to settle one handed-out message.
pub(super) struct Delivery<M> {
    pub message: M,
    pub outcome: oneshot::Receiver<Outcome>,
    pub num_delivered: u64,
    pub topic: Arc<str>,
    pub settings: Arc<ConsumerSettings>,
    pub terminations: TerminationSet,
    pub metrics: EventBusMetrics,
    pub cancel: CancellationToken,
    pub permit: OwnedSemaphorePermit,
}

/// Waits for the handler's decision while keeping the broker deadline extended.
///
/// Exactly one of ack, nak, term or deadline expiry happens before the permit is released.
pub(super) async fn arbitrate<M>(delivery: Delivery<M>)
where
    M: BrokerMessage,
{
    let Delivery {
        message,
        mut outcome,
        num_delivered,
        topic,
        settings,
        terminations,
        metrics,
        cancel,
        permit,
    } = delivery;

    let started = Instant::now();
    let (heartbeat, deadline) = ack_heartbeat(settings.ack_wait);
    let mut ticker = tokio::time::interval_at(started + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = tokio::time::sleep(deadline);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;

            decided = &mut outcome => {
                metrics.handler_duration(&topic, started.elapsed());
                match decided {
                    Ok(Outcome::Ack) => {
                        if let Err(error) = message.ack().await {
                            warn!(topic = %topic, %error, "ack failed");
                        } else {
                            metrics.acked(&topic);
                        }
                    }
                    Ok(Outcome::Nack) => reject(&message, &topic, num_delivered, &settings, &terminations, &metrics).await,
                    Err(_) => {
                        debug!(topic = %topic, "envelope dropped without a decision");
                        reject(&message, &topic, num_delivered, &settings, &terminations, &metrics).await;
                    }
                }
                break;
            }

            () = cancel.cancelled() => {
                let delay = settings.nak_delay(num_delivered);
                if let Err(error) = message.nak(delay).await {
                    warn!(topic = %topic, %error, "nak on shutdown failed");
                } else {
                    metrics.nacked(&topic);
                }
                break;
            }

            () = &mut deadline => {
                warn!(
                    topic = %topic,
                    num_delivered,
                    elapsed = ?started.elapsed(),
                    "processing deadline exceeded, leaving message for redelivery"
                );
                metrics.deadline_exceeded(&topic);
                break;
            }

            _ = ticker.tick() => {
                if let Err(error) = message.in_progress().await {
                    warn!(topic = %topic, %error, "failed to extend ack deadline");
                }
            }
        }
    }

    drop(permit);
}

async fn reject<M>(
    message: &M,
    topic: &str,
    num_delivered: u64,
    settings: &ConsumerSettings,
    terminations: &TerminationSet,
    metrics: &EventBusMetrics,
) where
    M: BrokerMessage,
{
    if terminations.contains(topic) {
        match message.term().await {
            Ok(()) => {
                metrics.terminated(topic);
                debug!(topic, num_delivered, "terminated");
            }
            Err(error) => warn!(topic, %error, "term failed"),
        }
        return;
    }

    let delay = settings.nak_delay(num_delivered);
    match message.nak(delay).await {
        Ok(()) => {
            metrics.nacked(topic);
            debug!(topic, num_delivered, ?delay, "nacked");
        }
        Err(error) => warn!(topic, %error, "nak failed"),
    }
}
