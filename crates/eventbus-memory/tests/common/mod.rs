#![allow(dead_code)]

use std::time::Duration;

use frolf_eventbus::metrics::EventBusMetrics;
use frolf_eventbus::{AppType, Envelope, EventBus, EventBusConfig};
use frolf_eventbus_memory::MemoryBroker;

/// Config with short pulls so tests settle quickly.
pub fn config(app_type: AppType) -> EventBusConfig {
    let mut config = EventBusConfig::for_app(app_type);
    config.fetch_max_wait = Duration::from_millis(50);
    config.delayed.recovery_fetch_timeout = Duration::from_millis(100);
    config.delayed.consumer_delete_timeout = Duration::from_secs(1);
    config
}

pub async fn bus(app_type: AppType) -> (MemoryBroker, EventBus<MemoryBroker>) {
    bus_with(MemoryBroker::new(), config(app_type)).await
}

pub async fn bus_with(
    broker: MemoryBroker,
    config: EventBusConfig,
) -> (MemoryBroker, EventBus<MemoryBroker>) {
    let bus = EventBus::new(broker.clone(), config, EventBusMetrics::disabled())
        .await
        .expect("event bus should start");
    (broker, bus)
}

pub async fn next(receiver: &flume::Receiver<Envelope>) -> Envelope {
    tokio::time::timeout(Duration::from_secs(30), receiver.recv_async())
        .await
        .expect("timed out waiting for an envelope")
        .expect("subscription ended")
}

/// Polls `condition` until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
