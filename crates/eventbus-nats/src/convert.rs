//! Mapping between the bus's broker-neutral specs and JetStream configs.

use async_nats::jetstream::consumer::{self, pull};
use async_nats::jetstream::stream;
use frolf_eventbus::broker::{
    AckPolicy, ConsumerSpec, DeliverPolicy, ReplayPolicy, RetentionPolicy, StreamSpec,
};

use crate::Error;

pub fn stream_config(spec: StreamSpec) -> stream::Config {
    stream::Config {
        name: spec.name,
        subjects: spec.subjects,
        retention: match spec.retention {
            RetentionPolicy::Limits => stream::RetentionPolicy::Limits,
            RetentionPolicy::Interest => stream::RetentionPolicy::Interest,
            RetentionPolicy::WorkQueue => stream::RetentionPolicy::WorkQueue,
        },
        max_age: spec.max_age,
        max_messages: spec.max_messages,
        duplicate_window: spec.duplicate_window.unwrap_or_default(),
        ..Default::default()
    }
}

pub fn consumer_config(spec: ConsumerSpec) -> pull::Config {
    pull::Config {
        durable_name: spec.durable_name,
        name: spec.name,
        filter_subject: spec.filter_subject,
        ack_policy: match spec.ack_policy {
            AckPolicy::Explicit => consumer::AckPolicy::Explicit,
            AckPolicy::None => consumer::AckPolicy::None,
        },
        ack_wait: spec.ack_wait,
        max_deliver: spec.max_deliver,
        backoff: spec.backoff,
        max_ack_pending: spec.max_ack_pending,
        deliver_policy: match spec.deliver_policy {
            DeliverPolicy::All => consumer::DeliverPolicy::All,
            DeliverPolicy::New => consumer::DeliverPolicy::New,
        },
        replay_policy: match spec.replay_policy {
            ReplayPolicy::Instant => consumer::ReplayPolicy::Instant,
            ReplayPolicy::Original => consumer::ReplayPolicy::Original,
        },
        inactive_threshold: spec.inactive_threshold,
        ..Default::default()
    }
}

/// Reads a server-side consumer config back into a spec.
pub fn consumer_spec(config: &consumer::Config) -> Result<ConsumerSpec, Error> {
    Ok(ConsumerSpec {
        durable_name: config.durable_name.clone(),
        name: config.name.clone(),
        filter_subject: config.filter_subject.clone(),
        ack_policy: match &config.ack_policy {
            consumer::AckPolicy::Explicit => AckPolicy::Explicit,
            consumer::AckPolicy::None => AckPolicy::None,
            other => {
                return Err(Error::Unsupported {
                    field: "ack policy",
                    value: format!("{other:?}"),
                });
            }
        },
        ack_wait: config.ack_wait,
        max_deliver: config.max_deliver,
        backoff: config.backoff.clone(),
        max_ack_pending: config.max_ack_pending,
        deliver_policy: match &config.deliver_policy {
            consumer::DeliverPolicy::All => DeliverPolicy::All,
            consumer::DeliverPolicy::New => DeliverPolicy::New,
            other => {
                return Err(Error::Unsupported {
                    field: "deliver policy",
                    value: format!("{other:?}"),
                });
            }
        },
        replay_policy: match &config.replay_policy {
            consumer::ReplayPolicy::Instant => ReplayPolicy::Instant,
            consumer::ReplayPolicy::Original => ReplayPolicy::Original,
        },
        inactive_threshold: config.inactive_threshold,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn delayed_stream_has_no_duplicate_window() {
        let config = stream_config(StreamSpec {
            name: "delayed".to_string(),
            subjects: vec!["delayed.>".to_string()],
            retention: RetentionPolicy::Limits,
            max_age: Duration::from_secs(86_400),
            max_messages: -1,
            duplicate_window: None,
        });

        assert_eq!(config.duplicate_window, Duration::ZERO);
        assert_eq!(config.max_age, Duration::from_secs(86_400));
        assert_eq!(config.max_messages, -1);
    }

    #[test]
    fn durable_consumer_settings_survive_the_server_round_trip() {
        let spec = ConsumerSpec {
            durable_name: Some("backend-round-finalized-v1".to_string()),
            filter_subject: "round.finalized.v1".to_string(),
            ack_wait: Duration::from_secs(45),
            max_deliver: 7,
            backoff: vec![Duration::from_secs(1), Duration::from_secs(2)],
            max_ack_pending: 200,
            ..ConsumerSpec::default()
        };

        let pull = consumer_config(spec.clone());
        let server = consumer::Config {
            durable_name: pull.durable_name.clone(),
            filter_subject: pull.filter_subject.clone(),
            ack_policy: pull.ack_policy,
            ack_wait: pull.ack_wait,
            max_deliver: pull.max_deliver,
            backoff: pull.backoff.clone(),
            max_ack_pending: pull.max_ack_pending,
            deliver_policy: pull.deliver_policy,
            replay_policy: pull.replay_policy,
            ..Default::default()
        };

        assert_eq!(consumer_spec(&server).unwrap(), spec);
    }

    #[test]
    fn unmodelled_deliver_policy_is_reported() {
        let server = consumer::Config {
            deliver_policy: consumer::DeliverPolicy::Last,
            ..Default::default()
        };

        assert!(matches!(
            consumer_spec(&server),
            Err(Error::Unsupported { field: "deliver policy", .. })
        ));
    }
}
