mod common;

use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use bytes::Bytes;
use frolf_eventbus::broker::Broker;
use frolf_eventbus::registry::ConsumerSettings;
use frolf_eventbus::{AppType, Envelope, Error};
use frolf_eventbus_memory::{AckKind, MemoryBroker};
use tokio_util::sync::CancellationToken;

const TOPIC: &str = "round.finalized.v1";
const DURABLE: &str = "backend-round-finalized-v1";

fn kinds(broker: &MemoryBroker) -> Vec<AckKind> {
    broker
        .ack_log()
        .into_iter()
        .filter(|record| record.kind != AckKind::InProgress)
        .map(|record| record.kind)
        .collect()
}

#[tokio::test]
async fn acked_delivery_settles_on_the_broker() {
    let (broker, bus) = common::bus(AppType::Backend).await;
    let cx = CancellationToken::new();
    let receiver = bus.subscribe(&cx, TOPIC).await.unwrap();

    bus.publish(TOPIC, &[Envelope::new("payload").with_metadata("guild_id", "g-1")])
        .await
        .unwrap();

    let envelope = common::next(&receiver).await;
    assert_eq!(envelope.payload().as_ref(), b"payload");
    assert_eq!(envelope.get("guild_id"), Some("g-1"));
    assert_eq!(envelope.get("_js_stream"), Some("round"));
    assert_eq!(envelope.get("_js_consumer"), Some(DURABLE));
    assert_eq!(envelope.get("_js_num_delivered"), Some("1"));
    assert!(envelope.correlation_id().is_some());
    assert!(envelope.ack());
    assert!(!envelope.nack());

    assert!(common::eventually(Duration::from_secs(5), || kinds(&broker) == vec![AckKind::Ack]).await);
    assert_eq!(broker.pending("round", DURABLE), 0);

    bus.close().await;
}

#[tokio::test(start_paused = true)]
async fn nack_delay_follows_backoff_by_attempt() {
    let (broker, bus) = common::bus(AppType::Backend).await;
    bus.registry().set_for_topic(
        TOPIC,
        ConsumerSettings {
            max_deliver: 10,
            backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(10),
            ],
            ..ConsumerSettings::default()
        },
    );
    let cx = CancellationToken::new();
    let receiver = bus.subscribe(&cx, TOPIC).await.unwrap();
    bus.publish(TOPIC, &[Envelope::new("payload")]).await.unwrap();

    for attempt in 1..=3 {
        let envelope = common::next(&receiver).await;
        assert_eq!(envelope.get("_js_num_delivered"), Some(attempt.to_string().as_str()));
        assert!(envelope.nack());
        assert!(
            common::eventually(Duration::from_secs(5), || kinds(&broker).len() == attempt).await
        );
    }

    assert_eq!(
        kinds(&broker),
        vec![
            AckKind::Nak(Some(Duration::from_secs(1))),
            AckKind::Nak(Some(Duration::from_secs(5))),
            AckKind::Nak(Some(Duration::from_secs(10))),
        ]
    );

    cx.cancel();
    bus.close().await;
}

#[tokio::test]
async fn marked_topic_terminates_instead_of_redelivering() {
    let (broker, bus) = common::bus(AppType::Backend).await;
    let cx = CancellationToken::new();
    let receiver = bus.subscribe(&cx, TOPIC).await.unwrap();
    bus.terminate_topic(TOPIC);
    bus.publish(TOPIC, &[Envelope::new("poison")]).await.unwrap();

    let envelope = common::next(&receiver).await;
    drop(envelope);

    assert!(common::eventually(Duration::from_secs(5), || kinds(&broker) == vec![AckKind::Term]).await);
    assert_eq!(broker.pending("round", DURABLE), 0);

    bus.close().await;
}

#[tokio::test]
async fn backend_cannot_subscribe_to_discord_topics() {
    let (broker, bus) = common::bus(AppType::Backend).await;
    let cx = CancellationToken::new();

    let result = bus
        .subscribe(&cx, "discord.leaderboard.tag.lookup.request.v1")
        .await;

    let error = result.unwrap_err();
    assert!(error.to_string().contains("forbidden"));
    assert!(broker.consumer_names("discord").is_empty());
}

#[tokio::test]
async fn unknown_topic_is_rejected() {
    let (_broker, bus) = common::bus(AppType::Backend).await;

    let result = bus.subscribe(&CancellationToken::new(), "tournament.created.v1").await;

    assert_matches!(result, Err(Error::UnknownTopic(topic)) if topic == "tournament.created.v1");
}

#[tokio::test]
async fn fetch_failures_back_off_and_cancel_promptly() {
    let (broker, bus) = common::bus(AppType::Backend).await;
    broker.fail_next_fetches(2);
    let cx = CancellationToken::new();
    let receiver = bus.subscribe(&cx, TOPIC).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    let cancelled_at = Instant::now();
    cx.cancel();

    let ended = tokio::time::timeout(Duration::from_secs(2), receiver.recv_async()).await;
    assert_matches!(ended, Ok(Err(flume::RecvError::Disconnected)));
    assert!(cancelled_at.elapsed() <= Duration::from_millis(900));

    bus.close().await;
}

#[tokio::test]
async fn close_ends_every_subscription_once() {
    let (broker, bus) = common::bus(AppType::Backend).await;
    let cx = CancellationToken::new();
    let rounds = bus.subscribe(&cx, TOPIC).await.unwrap();
    let users = bus.subscribe(&cx, "user.created.v1").await.unwrap();

    bus.close().await;
    bus.close().await;

    assert_matches!(rounds.recv_async().await, Err(flume::RecvError::Disconnected));
    assert_matches!(users.recv_async().await, Err(flume::RecvError::Disconnected));
    assert_matches!(
        bus.subscribe(&cx, TOPIC).await,
        Err(Error::SubscriberClosed)
    );

    // Durable consumers survive a client shutdown.
    assert_eq!(
        broker.consumer_names("round"),
        vec![DURABLE.to_string()]
    );
}

#[tokio::test]
async fn close_naks_in_flight_deliveries() {
    let (broker, bus) = common::bus(AppType::Backend).await;
    let cx = CancellationToken::new();
    let receiver = bus.subscribe(&cx, TOPIC).await.unwrap();
    broker
        .publish(TOPIC, frolf_eventbus::broker::Headers::new(), Bytes::from_static(b"held"))
        .await
        .unwrap();

    let held = common::next(&receiver).await;
    bus.close().await;

    assert_eq!(
        kinds(&broker),
        vec![AckKind::Nak(Some(Duration::from_secs(5)))]
    );
    assert!(!held.ack());
}

#[tokio::test]
async fn drift_is_reported_after_registry_changes() {
    let (_broker, bus) = common::bus(AppType::Backend).await;
    let cx = CancellationToken::new();
    let _receiver = bus.subscribe(&cx, TOPIC).await.unwrap();

    bus.check_drift(TOPIC).await.unwrap();

    bus.registry().set_for_topic(
        TOPIC,
        ConsumerSettings {
            max_ack_pending: 200,
            ..ConsumerSettings::default()
        },
    );
    let error = bus.check_drift(TOPIC).await.unwrap_err();
    assert_matches!(error, Error::Drift(_));

    bus.close().await;
}
