mod common;

use std::time::Duration;

use frolf_eventbus::{AppType, Envelope, EventBus};
use frolf_eventbus_memory::MemoryBroker;
use opentelemetry::global;
use opentelemetry::trace::{
    SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use prometheus::{Registry, TextEncoder};
use serial_test::serial;
use tokio_util::sync::CancellationToken;

const TOPIC: &str = "score.processed.v1";

#[tokio::test]
#[serial]
async fn trace_context_crosses_the_bus() {
    global::set_text_map_propagator(TraceContextPropagator::new());
    let trace_id = TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap();
    let (_broker, bus) = common::bus(AppType::Backend).await;
    let receiver = bus.subscribe(&CancellationToken::new(), TOPIC).await.unwrap();

    {
        let _guard = opentelemetry::Context::new()
            .with_remote_span_context(SpanContext::new(
                trace_id,
                SpanId::from_hex("00f067aa0ba902b7").unwrap(),
                TraceFlags::SAMPLED,
                true,
                TraceState::default(),
            ))
            .attach();
        bus.publish(TOPIC, &[Envelope::new("scored")]).await.unwrap();
    }

    let envelope = common::next(&receiver).await;
    assert_eq!(
        envelope.trace_context().span().span_context().trace_id(),
        trace_id
    );
    envelope.ack();

    bus.close().await;
}

#[tokio::test]
async fn counters_are_exported_by_topic() {
    let registry = Registry::new();
    let broker = MemoryBroker::new();
    let bus = EventBus::with_prometheus(broker.clone(), common::config(AppType::Backend), &registry)
        .await
        .unwrap();
    let receiver = bus.subscribe(&CancellationToken::new(), TOPIC).await.unwrap();

    bus.publish(TOPIC, &[Envelope::new("scored")]).await.unwrap();
    common::next(&receiver).await.ack();
    assert!(
        common::eventually(Duration::from_secs(5), || broker.pending("score", "backend-score-processed-v1") == 0)
            .await
    );
    bus.close().await;

    let text = TextEncoder::new()
        .encode_to_string(&registry.gather())
        .unwrap();
    assert!(text.contains(r#"eventbus_messages_published_total{topic="score.processed.v1"} 1"#));
    assert!(text.contains(r#"eventbus_messages_received_total{topic="score.processed.v1"} 1"#));
    assert!(text.contains(r#"eventbus_messages_acked_total{topic="score.processed.v1"} 1"#));
}
