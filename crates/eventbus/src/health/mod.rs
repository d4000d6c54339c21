mod error;

pub use error::HealthError;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::broker::Broker;

/// Deadline for the connection probe's flush round-trip.
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// A named liveness probe.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Probe name, for reporting.
    fn name(&self) -> &'static str;

    /// Runs the probe, giving up with [`HealthError::Cancelled`] once `cx` is cancelled.
    async fn check(&self, cx: &CancellationToken) -> Result<(), HealthError>;
}

/// Checks that the broker connection is up and responsive.
#[derive(Clone, Debug)]
pub struct BrokerConnectionCheck<B> {
    broker: B,
    flush_timeout: Duration,
}

impl<B> BrokerConnectionCheck<B>
where
    B: Broker,
{
    /// Creates the probe with the default flush deadline.
    pub const fn new(broker: B) -> Self {
        Self {
            broker,
            flush_timeout: FLUSH_TIMEOUT,
        }
    }

    /// Overrides the flush deadline.
    #[must_use]
    pub const fn with_flush_timeout(mut self, flush_timeout: Duration) -> Self {
        self.flush_timeout = flush_timeout;
        self
    }
}

#[async_trait]
impl<B> HealthChecker for BrokerConnectionCheck<B>
where
    B: Broker,
{
    fn name(&self) -> &'static str {
        "broker-connection"
    }

    async fn check(&self, cx: &CancellationToken) -> Result<(), HealthError> {
        if !self.broker.is_connected() {
            return Err(HealthError::NotConnected);
        }

        let flushed = tokio::select! {
            biased;
            () = cx.cancelled() => return Err(HealthError::Cancelled),
            flushed = tokio::time::timeout(self.flush_timeout, self.broker.flush()) => flushed,
        };
        flushed
            .map_err(|_| HealthError::FlushTimeout(self.flush_timeout))?
            .map_err(|error| HealthError::Flush(Box::new(error)))?;

        debug!("broker connection healthy");
        Ok(())
    }
}

/// Checks that the stream plane answers account queries.
#[derive(Clone, Debug)]
pub struct StreamPlaneCheck<B> {
    broker: B,
}

impl<B> StreamPlaneCheck<B>
where
    B: Broker,
{
    /// Creates the probe.
    pub const fn new(broker: B) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl<B> HealthChecker for StreamPlaneCheck<B>
where
    B: Broker,
{
    fn name(&self) -> &'static str {
        "stream-plane"
    }

    async fn check(&self, cx: &CancellationToken) -> Result<(), HealthError> {
        let info = tokio::select! {
            biased;
            () = cx.cancelled() => return Err(HealthError::Cancelled),
            info = self.broker.account_info() => info,
        };
        let info = info
            .map_err(|error| HealthError::AccountInfo(Box::new(error)))?
            .ok_or(HealthError::NoAccountInfo)?;

        debug!(streams = info.streams, consumers = info.consumers, "stream plane healthy");
        Ok(())
    }
}
