use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::app::AppType;
use crate::broker::{Broker, RetentionPolicy, StreamSpec};
use crate::delayed::{DELAYED_MAX_AGE, DELAYED_STREAM};
use crate::error::{Error, Result};
use crate::topic::stream_subject;

/// Publish de-duplication window of every stream except `delayed`.
pub const DUPLICATE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Desired configuration of the stream with key `stream_key`.
#[must_use]
pub fn stream_spec(stream_key: &str) -> StreamSpec {
    if stream_key == DELAYED_STREAM {
        return StreamSpec {
            name: stream_key.to_string(),
            subjects: vec![stream_subject(stream_key)],
            retention: RetentionPolicy::Limits,
            max_age: DELAYED_MAX_AGE,
            max_messages: -1,
            duplicate_window: None,
        };
    }

    StreamSpec {
        name: stream_key.to_string(),
        subjects: vec![stream_subject(stream_key)],
        retention: RetentionPolicy::Limits,
        max_age: Duration::ZERO,
        max_messages: -1,
        duplicate_window: Some(DUPLICATE_WINDOW),
    }
}

/// Creates the streams a role needs, once per process.
#[derive(Debug)]
pub struct StreamProvisioner<B>
where
    B: Broker,
{
    broker: B,
    created: Mutex<HashSet<String>>,
}

impl<B> StreamProvisioner<B>
where
    B: Broker,
{
    /// Creates a provisioner with nothing provisioned yet.
    pub fn new(broker: B) -> Self {
        Self {
            broker,
            created: Mutex::new(HashSet::new()),
        }
    }

    /// Creates or reconciles every stream owned by `app_type`.
    ///
    /// # Errors
    ///
    /// Returns the first broker failure; streams created before it stay recorded.
    #[instrument(skip(self))]
    pub async fn ensure_streams(&self, app_type: AppType) -> Result<()> {
        for stream_key in app_type.streams() {
            self.ensure_stream(stream_key).await?;
        }

        Ok(())
    }

    /// Creates or reconciles a single stream, skipping it if this process already did.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Broker`] if the broker rejects the stream.
    pub async fn ensure_stream(&self, stream_key: &str) -> Result<()> {
        let mut created = self.created.lock().await;
        if created.contains(stream_key) {
            debug!(stream = stream_key, "stream already provisioned");
            return Ok(());
        }

        let spec = stream_spec(stream_key);
        self.broker
            .create_or_update_stream(spec)
            .await
            .map_err(Error::broker)?;

        info!(stream = stream_key, "stream ready");
        created.insert(stream_key.to_string());

        Ok(())
    }

    /// Whether this process has provisioned `stream_key`.
    pub async fn is_provisioned(&self, stream_key: &str) -> bool {
        self.created.lock().await.contains(stream_key)
    }
}
