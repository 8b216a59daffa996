//! Conversions between `async-nats` types and the transport boundary.

use async_nats::jetstream::context::{PublishError, PublishErrorKind};
use async_nats::{ConnectError, ConnectErrorKind, HeaderMap};
use courier_transport::{Headers, InboundMessage, TransportError};

pub fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, values) in headers {
        for value in values {
            map.append(name.as_str(), value.as_str());
        }
    }
    map
}

pub fn from_header_map(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, values) in map.iter() {
        for value in values {
            headers.append(name.to_string(), value.to_string());
        }
    }
    headers
}

pub fn inbound(message: async_nats::Message) -> InboundMessage {
    InboundMessage {
        subject: message.subject.to_string(),
        reply: message.reply.map(|reply| reply.to_string()),
        headers: message.headers.as_ref().map(from_header_map),
        payload: message.payload,
        status: message.status.map(|status| status.as_u16()),
        acker: None,
    }
}

/// Maps an error by its text, the only thing `async-nats` exposes for most
/// JetStream API failures.
pub fn classify(text: &str) -> TransportError {
    let lower = text.to_lowercase();
    let reason = text.to_string();

    if lower.contains("stream not found") || lower.contains("no stream") {
        TransportError::StreamNotFound(reason)
    } else if lower.contains("wrong last")
        || lower.contains("expected stream")
        || lower.contains("expected last")
    {
        TransportError::StreamStateConflict(reason)
    } else if lower.contains("timed out") || lower.contains("timeout") {
        TransportError::Timeout
    } else if lower.contains("authorization") || lower.contains("authentication") {
        TransportError::AuthorizationViolation(reason)
    } else if lower.contains("limit")
        || lower.contains("maximum")
        || lower.contains("insufficient")
        || lower.contains("slow consumer")
    {
        TransportError::Resource(reason)
    } else if lower.contains("not connected")
        || lower.contains("broken pipe")
        || lower.contains("disconnected")
    {
        TransportError::NotConnected
    } else {
        TransportError::Protocol(reason)
    }
}

pub fn consumer_error(stream: &str, consumer: &str, text: &str) -> TransportError {
    if text.to_lowercase().contains("consumer not found") {
        TransportError::ConsumerNotFound {
            stream: stream.to_string(),
            consumer: consumer.to_string(),
        }
    } else {
        classify(text)
    }
}

pub fn publish_error(error: &PublishError) -> TransportError {
    match error.kind() {
        PublishErrorKind::StreamNotFound => TransportError::StreamNotFound(error.to_string()),
        PublishErrorKind::WrongLastMessageId | PublishErrorKind::WrongLastSequence => {
            TransportError::StreamStateConflict(error.to_string())
        }
        PublishErrorKind::TimedOut => TransportError::Timeout,
        PublishErrorKind::BrokenPipe => TransportError::NotConnected,
        _ => classify(&error.to_string()),
    }
}

pub fn connect_error(error: &ConnectError) -> TransportError {
    match error.kind() {
        ConnectErrorKind::AuthorizationViolation | ConnectErrorKind::Authentication => {
            TransportError::AuthorizationViolation(error.to_string())
        }
        _ => TransportError::ConnectionFailed(error.to_string()),
    }
}
