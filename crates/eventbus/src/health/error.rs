use std::error::Error as StdError;
use std::time::Duration;

use thiserror::Error;

/// A failed liveness probe.
#[derive(Debug, Error)]
pub enum HealthError {
    /// The client is not connected to the server.
    #[error("broker connection is not established")]
    NotConnected,

    /// The server did not answer a flush in time.
    #[error("broker flush timed out after {0:?}")]
    FlushTimeout(Duration),

    /// The flush round-trip failed.
    #[error("broker flush failed: {0}")]
    Flush(#[source] Box<dyn StdError + Send + Sync>),

    /// The account info request failed.
    #[error("account info request failed: {0}")]
    AccountInfo(#[source] Box<dyn StdError + Send + Sync>),

    /// The server answered without account info.
    #[error("account info unavailable")]
    NoAccountInfo,

    /// The caller abandoned the probe.
    #[error("health check cancelled")]
    Cancelled,
}
