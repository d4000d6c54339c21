use std::error::Error as StdError;

use thiserror::Error;

use crate::app::AppType;
use crate::broker::BrokerError;
use crate::config::ConfigError;
use crate::consumers::DriftError;

/// Result alias for bus operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the event bus.
#[derive(Debug, Error)]
pub enum Error {
    /// Broker operation failed.
    #[error("broker error: {0}")]
    Broker(#[source] Box<dyn StdError + Send + Sync>),

    /// The caller's cancellation token fired before the operation completed.
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Observed consumer config differs from the resolved one.
    #[error(transparent)]
    Drift(#[from] DriftError),

    /// The role may not publish to or subscribe on the topic.
    #[error("forbidden: {app_type} may not use topic {topic}")]
    Forbidden {
        /// Role of this process.
        app_type: AppType,
        /// Offending topic.
        topic: String,
    },

    /// Metadata value could not be parsed.
    #[error("invalid metadata {key}={value}")]
    InvalidMetadata {
        /// Metadata key.
        key: &'static str,
        /// Raw value.
        value: String,
    },

    /// No topic given and the envelope carries no `topic` metadata.
    #[error("invalid topic: no topic given and none found in metadata")]
    InvalidTopic,

    /// Prometheus registration failed.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Required metadata key is absent.
    #[error("missing metadata: {0}")]
    MissingMetadata(&'static str),

    /// The subscriber was closed.
    #[error("subscriber closed")]
    SubscriberClosed,

    /// Unrecognised app role.
    #[error("unknown app type: {0}")]
    UnknownAppType(String),

    /// No stream owns the topic's prefix.
    #[error("unknown topic: no stream owns {0}")]
    UnknownTopic(String),
}

impl Error {
    /// Wraps a backend error.
    pub fn broker<E>(error: E) -> Self
    where
        E: BrokerError,
    {
        Self::Broker(Box::new(error))
    }

    /// Whether this error is caused by configuration rather than a transient fault.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::Forbidden { .. }
                | Self::InvalidTopic
                | Self::MissingMetadata(_)
                | Self::UnknownAppType(_)
                | Self::UnknownTopic(_)
        )
    }
}
