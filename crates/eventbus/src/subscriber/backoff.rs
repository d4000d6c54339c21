use std::time::Duration;

const FETCH_BACKOFF_BASE: Duration = Duration::from_millis(100);
const FETCH_BACKOFF_MAX: Duration = Duration::from_secs(5);

const HEARTBEAT_FLOOR: Duration = Duration::from_secs(1);
const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(60);

/// Wait before retrying after the `attempt`-th consecutive fetch failure.
///
/// Doubles from 100ms and is capped at 5s. Non-positive attempts wait the base delay.
#[must_use]
pub fn fetch_error_backoff(attempt: i32) -> Duration {
    if attempt <= 0 {
        return FETCH_BACKOFF_BASE;
    }

    let shift = u32::try_from(attempt - 1).unwrap_or(u32::MAX);
    2u32.checked_pow(shift)
        .and_then(|factor| FETCH_BACKOFF_BASE.checked_mul(factor))
        .map_or(FETCH_BACKOFF_MAX, |backoff| backoff.min(FETCH_BACKOFF_MAX))
}

/// Uniformly jittered wait in `[backoff / 2, backoff)`.
#[must_use]
pub fn jittered(backoff: Duration) -> Duration {
    let half = backoff / 2;
    let spread = u64::try_from((backoff - half).as_nanos()).unwrap_or(u64::MAX);
    if spread == 0 {
        return backoff;
    }

    half + Duration::from_nanos(fastrand::u64(0..spread))
}

/// Heartbeat interval and processing deadline for a given ack wait.
///
/// The heartbeat fires every third of the ack wait (at least once a second) and the
/// arbiter gives up after three ack waits. A zero ack wait uses the 60s default.
#[must_use]
pub fn ack_heartbeat(ack_wait: Duration) -> (Duration, Duration) {
    let ack_wait = if ack_wait.is_zero() {
        DEFAULT_ACK_WAIT
    } else {
        ack_wait
    };

    ((ack_wait / 3).max(HEARTBEAT_FLOOR), ack_wait.saturating_mul(3))
}
