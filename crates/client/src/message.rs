use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use courier_transport::{
    AckKind, Acker, Headers, InboundMessage, NO_RESPONDERS_STATUS, OutboundMessage,
};
use tracing::debug;

use crate::Error;

/// A message, either built by the application or received from the broker.
///
/// Clones share the delivery state of an incoming message, so acknowledging
/// through any clone counts for all of them.
#[derive(Clone)]
pub struct Message {
    /// Subject the message is published to, or was received on.
    pub subject: String,
    /// Subject replies should be sent to.
    pub reply: Option<String>,
    /// Headers. Empty when none were sent.
    pub headers: Headers,
    /// Body.
    pub payload: Bytes,
    status: Option<u16>,
    incoming: bool,
    delivery: Option<Arc<DeliveryState>>,
}

struct DeliveryState {
    acker: Arc<dyn Acker>,
    acknowledged: AtomicBool,
}

impl Message {
    /// An outgoing message.
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            headers: Headers::new(),
            payload: payload.into(),
            status: None,
            incoming: false,
            delivery: None,
        }
    }

    /// Sets the reply subject.
    #[must_use]
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    /// Adds a header value.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(key, value);
        self
    }

    /// Replaces all headers.
    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Whether the message was received from the broker.
    #[must_use]
    pub const fn is_incoming(&self) -> bool {
        self.incoming
    }

    /// Broker status code, set on control messages.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        self.status
    }

    /// Whether this is the broker's "no responders" notice.
    #[must_use]
    pub fn is_no_responders(&self) -> bool {
        self.status == Some(NO_RESPONDERS_STATUS) && self.payload.is_empty()
    }

    /// Whether the message came from a JetStream consumer and can be acknowledged.
    #[must_use]
    pub const fn is_acknowledgeable(&self) -> bool {
        self.delivery.is_some()
    }

    /// Whether a terminal acknowledgment was already sent.
    #[must_use]
    pub fn is_acknowledged(&self) -> bool {
        self.delivery
            .as_ref()
            .is_some_and(|state| state.acknowledged.load(Ordering::Acquire))
    }

    /// Acknowledges successful processing.
    ///
    /// # Errors
    ///
    /// [`Error::NotAcknowledgeable`] for messages not delivered by a JetStream
    /// consumer, [`Error::AlreadyAcknowledged`] on a second terminal
    /// acknowledgment, or the transport's error.
    pub async fn ack(&self) -> Result<(), Error> {
        self.acknowledge(AckKind::Ack).await
    }

    /// Negatively acknowledges, asking for redelivery after `delay`
    /// (immediately when `None`).
    ///
    /// # Errors
    ///
    /// See [`Message::ack`].
    pub async fn nak(&self, delay: Option<Duration>) -> Result<(), Error> {
        self.acknowledge(AckKind::Nak(delay)).await
    }

    /// Signals that work is ongoing, resetting the redelivery timer. May be
    /// repeated until a terminal acknowledgment is sent.
    ///
    /// # Errors
    ///
    /// See [`Message::ack`].
    pub async fn in_progress(&self) -> Result<(), Error> {
        self.acknowledge(AckKind::Progress).await
    }

    /// Tells the broker to never redeliver this message.
    ///
    /// # Errors
    ///
    /// See [`Message::ack`].
    pub async fn term(&self) -> Result<(), Error> {
        self.acknowledge(AckKind::Term).await
    }

    async fn acknowledge(&self, kind: AckKind) -> Result<(), Error> {
        let state = self.delivery.as_ref().ok_or(Error::NotAcknowledgeable)?;

        if kind.is_terminal() {
            if state.acknowledged.swap(true, Ordering::AcqRel) {
                return Err(Error::AlreadyAcknowledged);
            }
        } else if state.acknowledged.load(Ordering::Acquire) {
            return Err(Error::AlreadyAcknowledged);
        }

        debug!(subject = %self.subject, ?kind, "acknowledging");
        let result = state.acker.acknowledge(kind).await;
        if result.is_err() && kind.is_terminal() {
            state.acknowledged.store(false, Ordering::Release);
        }
        result.map_err(Error::from)
    }

    pub(crate) fn to_outbound(&self) -> OutboundMessage {
        OutboundMessage {
            subject: self.subject.clone(),
            reply: self.reply.clone(),
            headers: (!self.headers.is_empty()).then(|| self.headers.clone()),
            payload: self.payload.clone(),
        }
    }
}

impl From<InboundMessage> for Message {
    fn from(message: InboundMessage) -> Self {
        Self {
            subject: message.subject,
            reply: message.reply,
            headers: message.headers.unwrap_or_default(),
            payload: message.payload,
            status: message.status,
            incoming: true,
            delivery: message.acker.map(|acker| {
                Arc::new(DeliveryState {
                    acker,
                    acknowledged: AtomicBool::new(false),
                })
            }),
        }
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("subject", &self.subject)
            .field("reply", &self.reply)
            .field("headers", &self.headers)
            .field("payload", &self.payload)
            .field("status", &self.status)
            .field("incoming", &self.incoming)
            .field("acknowledged", &self.is_acknowledged())
            .finish_non_exhaustive()
    }
}
