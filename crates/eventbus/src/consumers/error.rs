use std::time::Duration;

use thiserror::Error;

use crate::broker::DeliverPolicy;

/// A server-side consumer setting that differs from the resolved one.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum DriftError {
    /// Different starting point.
    #[error("deliver policy mismatch: observed {observed:?}, expected {expected:?}")]
    DeliverPolicy {
        /// Server-side value.
        observed: DeliverPolicy,
        /// Resolved value.
        expected: DeliverPolicy,
    },

    /// Different ack wait.
    #[error("ack wait mismatch: observed {observed:?}, expected {expected:?}")]
    AckWait {
        /// Server-side value.
        observed: Duration,
        /// Resolved value.
        expected: Duration,
    },

    /// Different delivery cap.
    #[error("max deliver mismatch: observed {observed}, expected {expected}")]
    MaxDeliver {
        /// Server-side value.
        observed: i64,
        /// Resolved value.
        expected: i64,
    },

    /// Different redelivery schedule.
    #[error("backoff mismatch: observed {observed:?}, expected {expected:?}")]
    Backoff {
        /// Server-side value.
        observed: Vec<Duration>,
        /// Resolved value.
        expected: Vec<Duration>,
    },

    /// Different flow-control ceiling.
    #[error("max ack pending mismatch: observed {observed}, expected {expected}")]
    MaxAckPending {
        /// Server-side value.
        observed: i64,
        /// Resolved value.
        expected: i64,
    },
}
