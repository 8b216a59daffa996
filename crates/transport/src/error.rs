use thiserror::Error;

/// Errors reported by a transport.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The broker rejected the supplied credentials.
    #[error("authorization violation: {0}")]
    AuthorizationViolation(String),

    /// The connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The consumer does not exist on the stream.
    #[error("consumer `{consumer}` not found on stream `{stream}`")]
    ConsumerNotFound {
        /// Stream the consumer was looked up on.
        stream: String,
        /// Durable consumer name.
        consumer: String,
    },

    /// The transport has been closed.
    #[error("transport closed")]
    Closed,

    /// An option was rejected by the transport.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// A subject was malformed.
    #[error("invalid subject `{0}`")]
    InvalidSubject(String),

    /// The link to the broker is down.
    #[error("not connected")]
    NotConnected,

    /// The broker returned an unexpected response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A resource limit was hit.
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// An optimistic concurrency guard did not hold.
    #[error("stream state conflict: {0}")]
    StreamStateConflict(String),

    /// No stream is bound to the subject or name.
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// The operation did not complete in time.
    #[error("operation timed out")]
    Timeout,
}
