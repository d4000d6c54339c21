mod common;

use assert_matches::assert_matches;
use frolf_eventbus::AppType;
use frolf_eventbus::health::HealthError;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn probes_follow_broker_state() {
    let (broker, bus) = common::bus(AppType::Backend).await;
    let checkers = bus.health_checkers();
    let cx = CancellationToken::new();

    for checker in &checkers {
        checker.check(&cx).await.unwrap();
    }

    broker.withhold_account_info(true);
    assert_matches!(checkers[1].check(&cx).await, Err(HealthError::NoAccountInfo));
    checkers[0].check(&cx).await.unwrap();

    broker.set_connected(false);
    assert_matches!(checkers[0].check(&cx).await, Err(HealthError::NotConnected));
    assert_matches!(checkers[1].check(&cx).await, Err(HealthError::AccountInfo(_)));

    broker.set_connected(true);
    broker.withhold_account_info(false);
    for checker in &checkers {
        checker.check(&cx).await.unwrap();
    }
}

#[tokio::test]
async fn cancelled_probe_reports_cancellation() {
    let (_, bus) = common::bus(AppType::Backend).await;
    let cx = CancellationToken::new();
    cx.cancel();

    for checker in bus.health_checkers() {
        assert_matches!(checker.check(&cx).await, Err(HealthError::Cancelled));
    }
}
