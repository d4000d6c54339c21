mod common;

use assert_matches::assert_matches;
use frolf_eventbus::{AppType, Envelope, Error};

#[tokio::test]
async fn empty_topic_falls_back_to_metadata() {
    let (broker, bus) = common::bus(AppType::Backend).await;
    let envelope = Envelope::new("payload").with_metadata(
        "topic",
        "leaderboard.tag.lookup.by.user.id.success.v1",
    );

    bus.publish("", &[envelope]).await.unwrap();

    let stored = broker.messages("leaderboard");
    assert_eq!(stored.len(), 1);
    assert_eq!(
        stored[0].subject,
        "leaderboard.tag.lookup.by.user.id.success.v1"
    );
    assert_eq!(stored[0].payload.as_ref(), b"payload");
}

#[tokio::test]
async fn backend_cannot_publish_discord_topics() {
    let (broker, bus) = common::bus(AppType::Backend).await;

    let result = bus
        .publish(
            "discord.leaderboard.tag.lookup.request.v1",
            &[Envelope::new("payload")],
        )
        .await;

    assert_matches!(result, Err(Error::Forbidden { app_type: AppType::Backend, .. }));
    for stream in broker.stream_names() {
        assert!(broker.messages(&stream).is_empty());
    }
}

#[tokio::test]
async fn missing_topic_is_invalid() {
    let (_broker, bus) = common::bus(AppType::Backend).await;

    let result = bus.publish("", &[Envelope::new("payload")]).await;

    assert_matches!(result, Err(Error::InvalidTopic));
}

#[tokio::test]
async fn republishing_the_same_envelope_is_deduplicated() {
    let (broker, bus) = common::bus(AppType::Backend).await;
    let envelope = Envelope::new("payload");

    bus.publish("round.created.v1", &[envelope.clone()])
        .await
        .unwrap();
    bus.publish("round.created.v1", &[envelope]).await.unwrap();

    assert_eq!(broker.messages("round").len(), 1);
}

#[tokio::test]
async fn discord_role_provisions_only_its_stream() {
    let (broker, bus) = common::bus(AppType::Discord).await;

    bus.publish("discord.round.reminder.v1", &[Envelope::new("payload")])
        .await
        .unwrap();

    assert_eq!(broker.stream_names(), vec!["discord".to_string()]);
}
