use courier_transport::TransportError;
use thiserror::Error;

/// Errors returned by the client.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The message was already acknowledged.
    #[error("message already acknowledged")]
    AlreadyAcknowledged,

    /// The connection, or the handle's parent connection, is closed.
    #[error("connection closed")]
    Closed,

    /// Options were rejected before the broker was contacted.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The link could not be established or was lost.
    #[error("connection error: {0}")]
    Connection(String),

    /// The durable consumer does not exist.
    #[error("consumer `{consumer}` not found on stream `{stream}`")]
    ConsumerNotFound {
        /// Stream the consumer was looked up on.
        stream: String,
        /// Durable consumer name.
        consumer: String,
    },

    /// The subject or queue group is malformed.
    #[error("invalid subject `{0}`")]
    InvalidSubject(String),

    /// Nobody is listening on the request subject.
    #[error("no responders available for request")]
    NoResponders,

    /// The message did not come from a JetStream consumer.
    #[error("message cannot be acknowledged")]
    NotAcknowledgeable,

    /// The broker answered with something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Asynchronous publishes were still outstanding when the wait ended.
    /// They keep running and may still complete.
    #[error("{0} publishes still pending")]
    PublishesPending(usize),

    /// A broker or client resource limit was hit.
    #[error("resource error: {0}")]
    Resource(String),

    /// A publish expectation (last sequence, last msg id, stream) did not hold.
    #[error("stream state conflict: {0}")]
    StreamStateConflict(String),

    /// No stream matches the subject or name.
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// The operation did not finish in time.
    #[error("operation timed out")]
    Timeout,
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::NoResponders | Self::PublishesPending(_) | Self::Connection(_)
        )
    }
}

impl From<TransportError> for Error {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::AuthorizationViolation(reason) => {
                Self::Connection(format!("authorization violation: {reason}"))
            }
            TransportError::ConnectionFailed(reason) => Self::Connection(reason),
            TransportError::ConsumerNotFound { stream, consumer } => {
                Self::ConsumerNotFound { stream, consumer }
            }
            TransportError::Closed => Self::Closed,
            TransportError::InvalidOption(reason) => Self::Configuration(reason),
            TransportError::InvalidSubject(subject) => Self::InvalidSubject(subject),
            TransportError::NotConnected => Self::Connection("not connected".to_string()),
            TransportError::Protocol(reason) => Self::Protocol(reason),
            TransportError::Resource(reason) => Self::Resource(reason),
            TransportError::StreamStateConflict(reason) => Self::StreamStateConflict(reason),
            TransportError::StreamNotFound(reason) => Self::StreamNotFound(reason),
            TransportError::Timeout => Self::Timeout,
        }
    }
}
