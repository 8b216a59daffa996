//! Transport boundary for the courier messaging client.
//!
//! The client engine never touches sockets or the wire protocol. It talks to a
//! [`Transport`] obtained from a [`Connector`], and receives everything the
//! broker sends through the channels in [`Inbound`]. Backends live in their
//! own crates (`courier-transport-memory`, `courier-transport-nats`).
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod headers;
mod jetstream;
mod message;
mod options;

/// Subject validation, wildcard matching and inbox generation.
pub mod subject;

pub use error::TransportError;
pub use headers::{
    EXPECTED_LAST_MSG_ID, EXPECTED_LAST_SEQUENCE, EXPECTED_LAST_SUBJECT_SEQUENCE,
    EXPECTED_STREAM, Headers, MSG_ID,
};
pub use jetstream::{AckKind, DEFAULT_WAIT, JetStreamOptions, PublishAck, PublishOptions};
pub use message::{
    Delivery, InboundMessage, NO_RESPONDERS_STATUS, OutboundMessage, SubscriptionId,
};
pub use options::{ConnectOptions, DEFAULT_NAME, DEFAULT_URL};

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Connection-level events raised by a transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// The link dropped.
    Disconnected,
    /// A reconnect attempt is starting.
    Reconnecting {
        /// One-based attempt number.
        attempt: usize,
    },
    /// The link was re-established and subscriptions restored.
    Reconnected {
        /// Server now in use.
        server: String,
    },
    /// The transport gave up or was closed; no further events follow.
    Closed,
    /// An asynchronous error, e.g. a rejected publish or a slow consumer.
    Error {
        /// What went wrong.
        error: TransportError,
        /// Subject involved, when known.
        subject: Option<String>,
    },
}

/// Channels a transport pushes inbound traffic onto.
#[derive(Clone, Debug)]
pub struct Inbound {
    /// Messages matched to a subscription id.
    pub deliveries: mpsc::UnboundedSender<Delivery>,
    /// Connection events.
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

/// Establishes transports.
#[async_trait]
pub trait Connector: Debug + Send + Sync + 'static {
    /// Connects using `options`, which the caller has already validated.
    async fn connect(
        &self,
        options: &ConnectOptions,
        inbound: Inbound,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// A live link to a broker.
#[async_trait]
pub trait Transport: Debug + Send + Sync + 'static {
    /// Publishes a message without waiting for the broker.
    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError>;

    /// Registers interest in `subject`; matches are delivered tagged with `sid`.
    async fn subscribe(
        &self,
        sid: SubscriptionId,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<(), TransportError>;

    /// Drops the registration made under `sid`, core or JetStream push.
    async fn unsubscribe(&self, sid: SubscriptionId) -> Result<(), TransportError>;

    /// Round-trips to the broker, failing after `timeout`.
    async fn flush(&self, timeout: Duration) -> Result<(), TransportError>;

    /// A unique reply subject.
    fn new_inbox(&self) -> String {
        subject::new_inbox()
    }

    /// Address of the server currently in use.
    fn connected_server(&self) -> Option<String>;

    /// Opens a JetStream API handle.
    fn jetstream(
        &self,
        options: &JetStreamOptions,
    ) -> Result<Arc<dyn JetStreamTransport>, TransportError>;

    /// Closes the link. Idempotent.
    async fn close(&self);
}

/// JetStream operations over a transport.
#[async_trait]
pub trait JetStreamTransport: Debug + Send + Sync + 'static {
    /// Stores a message and waits up to `timeout` for the acknowledgment.
    async fn publish(
        &self,
        message: OutboundMessage,
        options: &PublishOptions,
        timeout: Duration,
    ) -> Result<PublishAck, TransportError>;

    /// Name of the stream capturing `subject`.
    async fn stream_by_subject(&self, subject: &str) -> Result<String, TransportError>;

    /// Whether the durable `consumer` exists on `stream`.
    ///
    /// # Errors
    ///
    /// [`TransportError::StreamNotFound`] when the stream itself is missing.
    async fn consumer_exists(&self, stream: &str, consumer: &str) -> Result<bool, TransportError>;

    /// Binds to a push consumer; messages are delivered tagged with `sid` and
    /// carry an [`Acker`]. Removed with [`Transport::unsubscribe`].
    async fn subscribe(
        &self,
        sid: SubscriptionId,
        subject: &str,
        stream: &str,
        consumer: &str,
    ) -> Result<(), TransportError>;

    /// Pulls up to `batch` messages from a pull consumer, returning early once
    /// any are available and empty-handed after `timeout`.
    async fn fetch(
        &self,
        subject: &str,
        stream: &str,
        consumer: &str,
        batch: usize,
        timeout: Duration,
    ) -> Result<Vec<InboundMessage>, TransportError>;
}

/// Sends acknowledgments for one JetStream delivery.
#[async_trait]
pub trait Acker: Debug + Send + Sync + 'static {
    /// Reports the processing outcome to the broker.
    async fn acknowledge(&self, kind: AckKind) -> Result<(), TransportError>;
}
