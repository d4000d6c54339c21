use frolf_eventbus::broker::BrokerError;
use thiserror::Error;

/// Errors from the in-memory broker.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    /// No such consumer on the stream.
    #[error("consumer {consumer} not found on stream {stream}")]
    ConsumerNotFound {
        /// Stream name.
        stream: String,
        /// Consumer name.
        consumer: String,
    },

    /// A consumer field that cannot change after creation was changed.
    #[error("consumer {consumer} cannot change {field}")]
    Immutable {
        /// Consumer name.
        consumer: String,
        /// Offending field.
        field: &'static str,
    },

    /// A failure injected with `MemoryBroker::fail_next_fetches`.
    #[error("injected fetch failure")]
    Injected,

    /// No stream captures the subject.
    #[error("no stream captures subject {0}")]
    NoStream(String),

    /// The broker was marked disconnected.
    #[error("not connected")]
    NotConnected,

    /// No such stream.
    #[error("stream {0} not found")]
    StreamNotFound(String),
}

impl BrokerError for Error {}
