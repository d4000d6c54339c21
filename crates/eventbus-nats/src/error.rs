use frolf_eventbus::broker::BrokerError;
use thiserror::Error;

/// Errors from the NATS JetStream backend.
#[derive(Debug, Error)]
pub enum Error {
    /// Acknowledgement failed.
    #[error("failed to acknowledge message: {0}")]
    Ack(String),

    /// Account info request failed.
    #[error("failed to query account: {0}")]
    Account(String),

    /// Connecting to the server failed.
    #[error("failed to connect: {0}")]
    Connect(#[from] async_nats::ConnectError),

    /// Consumer create, lookup or delete failed.
    #[error("consumer operation failed: {0}")]
    Consumer(async_nats::jetstream::stream::ConsumerErrorKind),

    /// Pull request failed.
    #[error("failed to fetch messages: {0}")]
    Fetch(String),

    /// Flush failed.
    #[error("failed to flush: {0}")]
    Flush(String),

    /// Message metadata could not be read.
    #[error("failed to read message info: {0}")]
    Info(String),

    /// Publish failed.
    #[error("failed to publish: {0}")]
    Publish(async_nats::jetstream::context::PublishErrorKind),

    /// Purge failed.
    #[error("failed to purge: {0}")]
    Purge(String),

    /// Stream create or update failed.
    #[error("failed to create stream: {0}")]
    CreateStream(async_nats::jetstream::context::CreateStreamErrorKind),

    /// Stream lookup failed.
    #[error("failed to get stream: {0}")]
    GetStream(async_nats::jetstream::context::GetStreamErrorKind),

    /// Stream reconciliation failed.
    #[error("failed to update stream: {0}")]
    UpdateStream(String),

    /// The server holds a policy this crate does not model.
    #[error("unsupported {field}: {value}")]
    Unsupported {
        /// Config field.
        field: &'static str,
        /// Server-side value.
        value: String,
    },
}

impl BrokerError for Error {}
