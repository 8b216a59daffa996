use std::fmt::{self, Debug};
use std::sync::Arc;

use bytes::Bytes;

use crate::Acker;
use crate::headers::Headers;

/// Status code the broker uses when a request found no subscribers.
pub const NO_RESPONDERS_STATUS: u16 = 503;

/// Identifier the engine assigns to each subscription it registers.
pub type SubscriptionId = u64;

/// A message handed to the transport for publishing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Destination subject.
    pub subject: String,
    /// Subject replies should be sent to.
    pub reply: Option<String>,
    /// Optional headers.
    pub headers: Option<Headers>,
    /// Message body.
    pub payload: Bytes,
}

/// A message received from the transport.
#[derive(Clone, Default)]
pub struct InboundMessage {
    /// Subject the message was published to.
    pub subject: String,
    /// Subject replies should be sent to.
    pub reply: Option<String>,
    /// Optional headers.
    pub headers: Option<Headers>,
    /// Message body.
    pub payload: Bytes,
    /// Broker status code for control messages.
    pub status: Option<u16>,
    /// Acknowledgment handle, present only for JetStream consumer deliveries.
    pub acker: Option<Arc<dyn Acker>>,
}

impl InboundMessage {
    /// Whether this is the broker's "no responders" notice for a request.
    #[must_use]
    pub fn is_no_responders(&self) -> bool {
        self.status == Some(NO_RESPONDERS_STATUS) && self.payload.is_empty()
    }
}

impl Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("subject", &self.subject)
            .field("reply", &self.reply)
            .field("headers", &self.headers)
            .field("payload", &self.payload)
            .field("status", &self.status)
            .field("acknowledgeable", &self.acker.is_some())
            .finish()
    }
}

/// An inbound message tagged with the subscription it was delivered on.
#[derive(Debug)]
pub struct Delivery {
    /// Subscription the message matched.
    pub sid: SubscriptionId,
    /// The message itself.
    pub message: InboundMessage,
}
