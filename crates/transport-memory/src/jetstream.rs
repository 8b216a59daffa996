use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use bytes::Bytes;
use courier_transport::subject::{is_valid_subject, matches};
use courier_transport::{
    AckKind, EXPECTED_LAST_MSG_ID, EXPECTED_LAST_SEQUENCE, EXPECTED_LAST_SUBJECT_SEQUENCE,
    EXPECTED_STREAM, Headers, MSG_ID, PublishAck, TransportError,
};
use tokio::time::Instant;
use tracing::debug;

/// Configuration of a stream hosted by a [`crate::MemoryServer`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    /// Stream name.
    pub name: String,
    /// Subjects captured by the stream, wildcards allowed.
    pub subjects: Vec<String>,
    /// How long message ids are remembered for de-duplication.
    pub duplicate_window: Duration,
}

impl StreamConfig {
    /// A stream capturing `subjects` with a two minute duplicate window.
    pub fn new<I, S>(name: impl Into<String>, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            subjects: subjects.into_iter().map(Into::into).collect(),
            duplicate_window: Duration::from_secs(120),
        }
    }
}

/// Configuration of a durable consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Durable name.
    pub durable_name: String,
    /// Only messages on matching subjects are delivered.
    pub filter_subject: Option<String>,
    /// Time a delivery may stay unacknowledged before it is redelivered.
    pub ack_wait: Duration,
    /// Give up on a message after this many deliveries.
    pub max_deliver: Option<u32>,
}

impl ConsumerConfig {
    /// A consumer with a thirty second ack wait and unlimited deliveries.
    pub fn new(durable_name: impl Into<String>) -> Self {
        Self {
            durable_name: durable_name.into(),
            filter_subject: None,
            ack_wait: Duration::from_secs(30),
            max_deliver: None,
        }
    }

    /// Sets the ack wait.
    #[must_use]
    pub const fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    /// Sets the subject filter.
    #[must_use]
    pub fn with_filter_subject(mut self, filter: impl Into<String>) -> Self {
        self.filter_subject = Some(filter.into());
        self
    }
}

/// Snapshot of a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    /// Stream name.
    pub name: String,
    /// Number of stored messages.
    pub messages: usize,
    /// Sequence of the last stored message, zero when empty.
    pub last_sequence: u64,
}

/// Snapshot of a durable consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerInfo {
    /// Durable name.
    pub name: String,
    /// Highest stream sequence handed out so far.
    pub delivered_sequence: u64,
    /// Deliveries awaiting an acknowledgment.
    pub ack_pending: usize,
    /// Total number of redeliveries.
    pub redelivered: u64,
}

#[derive(Clone, Debug)]
struct StoredMessage {
    sequence: u64,
    subject: String,
    headers: Option<Headers>,
    payload: Bytes,
}

#[derive(Debug)]
struct Pending {
    deadline: Instant,
    deliveries: u32,
}

#[derive(Debug)]
struct ConsumerState {
    config: ConsumerConfig,
    cursor: u64,
    pending: BTreeMap<u64, Pending>,
    redelivered: u64,
}

#[derive(Debug)]
struct StreamState {
    config: StreamConfig,
    messages: Vec<StoredMessage>,
    last_sequence: u64,
    last_msg_id: Option<String>,
    dedup: HashMap<String, (u64, Instant)>,
    consumers: HashMap<String, ConsumerState>,
}

/// A message handed to a consumer, before it is wrapped for a connection.
#[derive(Clone, Debug)]
pub(crate) struct ConsumerDelivery {
    pub stream: String,
    pub consumer: String,
    pub sequence: u64,
    pub deliveries: u32,
    pub subject: String,
    pub headers: Option<Headers>,
    pub payload: Bytes,
}

/// Streams and consumers of one server.
#[derive(Debug, Default)]
pub(crate) struct Store {
    streams: HashMap<String, StreamState>,
}

impl Store {
    pub fn add_stream(&mut self, config: StreamConfig) -> Result<(), TransportError> {
        if config.name.is_empty() || config.name.contains(['.', '*', '>', ' ']) {
            return Err(TransportError::InvalidOption(format!(
                "invalid stream name `{}`",
                config.name
            )));
        }
        if let Some(bad) = config.subjects.iter().find(|s| !is_valid_subject(s)) {
            return Err(TransportError::InvalidSubject(bad.clone()));
        }
        if self.streams.contains_key(&config.name) {
            return Err(TransportError::Protocol(format!(
                "stream name `{}` already in use",
                config.name
            )));
        }
        if let Some(taken) = config
            .subjects
            .iter()
            .find(|s| self.stream_for_subject(s).is_some())
        {
            return Err(TransportError::Protocol(format!(
                "subject `{taken}` overlaps with an existing stream"
            )));
        }

        debug!(stream = %config.name, subjects = ?config.subjects, "stream added");
        self.streams.insert(
            config.name.clone(),
            StreamState {
                config,
                messages: Vec::new(),
                last_sequence: 0,
                last_msg_id: None,
                dedup: HashMap::new(),
                consumers: HashMap::new(),
            },
        );
        Ok(())
    }

    pub fn add_consumer(&mut self, stream: &str, config: ConsumerConfig) -> Result<(), TransportError> {
        let state = self.stream_mut(stream)?;
        if config.durable_name.is_empty() {
            return Err(TransportError::InvalidOption(
                "consumer durable name must not be empty".to_string(),
            ));
        }
        if state.consumers.contains_key(&config.durable_name) {
            return Err(TransportError::Protocol(format!(
                "consumer `{}` already exists",
                config.durable_name
            )));
        }

        debug!(stream, consumer = %config.durable_name, "consumer added");
        state.consumers.insert(
            config.durable_name.clone(),
            ConsumerState {
                config,
                cursor: 0,
                pending: BTreeMap::new(),
                redelivered: 0,
            },
        );
        Ok(())
    }

    pub fn stream_for_subject(&self, subject: &str) -> Option<&str> {
        self.streams
            .values()
            .find(|state| {
                state
                    .config
                    .subjects
                    .iter()
                    .any(|filter| filter == subject || matches(filter, subject))
            })
            .map(|state| state.config.name.as_str())
    }

    pub fn consumer_exists(&self, stream: &str, consumer: &str) -> Result<bool, TransportError> {
        self.streams
            .get(stream)
            .map(|state| state.consumers.contains_key(consumer))
            .ok_or_else(|| TransportError::StreamNotFound(stream.to_string()))
    }

    /// Stores a message, applying de-duplication and the expectation headers.
    pub fn store(
        &mut self,
        subject: &str,
        headers: Option<Headers>,
        payload: Bytes,
        now: Instant,
    ) -> Result<PublishAck, TransportError> {
        let name = self
            .stream_for_subject(subject)
            .map(ToString::to_string)
            .ok_or_else(|| TransportError::StreamNotFound(format!("no stream captures `{subject}`")))?;
        let state = self.stream_mut(&name)?;
        let header = |key: &str| headers.as_ref().and_then(|h| h.get(key));

        if let Some(expected) = header(EXPECTED_STREAM) {
            if expected != name {
                return Err(TransportError::StreamStateConflict(format!(
                    "expected stream `{expected}` but subject is bound to `{name}`"
                )));
            }
        }

        let window = state.config.duplicate_window;
        state
            .dedup
            .retain(|_, (_, stored_at)| now.duration_since(*stored_at) < window);

        let msg_id = header(MSG_ID).map(ToString::to_string);
        if let Some((sequence, _)) = msg_id.as_ref().and_then(|id| state.dedup.get(id)) {
            return Ok(PublishAck {
                stream: name,
                sequence: *sequence,
                domain: String::new(),
                duplicate: true,
            });
        }

        if let Some(expected) = parse_sequence(header(EXPECTED_LAST_SEQUENCE))? {
            if expected != state.last_sequence {
                return Err(TransportError::StreamStateConflict(format!(
                    "wrong last sequence: {}",
                    state.last_sequence
                )));
            }
        }
        if let Some(expected) = parse_sequence(header(EXPECTED_LAST_SUBJECT_SEQUENCE))? {
            let actual = state
                .messages
                .iter()
                .rev()
                .find(|m| m.subject == subject)
                .map_or(0, |m| m.sequence);
            if expected != actual {
                return Err(TransportError::StreamStateConflict(format!(
                    "wrong last sequence for subject: {actual}"
                )));
            }
        }
        if let Some(expected) = header(EXPECTED_LAST_MSG_ID) {
            if state.last_msg_id.as_deref() != Some(expected) {
                return Err(TransportError::StreamStateConflict(format!(
                    "wrong last msg id: {}",
                    state.last_msg_id.as_deref().unwrap_or_default()
                )));
            }
        }

        state.last_sequence += 1;
        let sequence = state.last_sequence;
        state.messages.push(StoredMessage {
            sequence,
            subject: subject.to_string(),
            headers,
            payload,
        });
        state.last_msg_id.clone_from(&msg_id);
        if let Some(id) = msg_id {
            state.dedup.insert(id, (sequence, now));
        }

        debug!(stream = %name, sequence, subject, "message stored");
        Ok(PublishAck {
            stream: name,
            sequence,
            domain: String::new(),
            duplicate: false,
        })
    }

    /// Hands out up to `max` messages: due redeliveries first, then new ones.
    pub fn take(
        &mut self,
        stream: &str,
        consumer: &str,
        max: usize,
        now: Instant,
    ) -> Result<Vec<ConsumerDelivery>, TransportError> {
        let state = self.stream_mut(stream)?;
        let messages = &state.messages;
        let consumer_state = state.consumers.get_mut(consumer).ok_or_else(|| {
            TransportError::ConsumerNotFound {
                stream: stream.to_string(),
                consumer: consumer.to_string(),
            }
        })?;
        let ack_wait = consumer_state.config.ack_wait;
        let max_deliver = consumer_state.config.max_deliver;
        let mut out = Vec::new();

        let due: Vec<u64> = consumer_state
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(sequence, _)| *sequence)
            .collect();
        for sequence in due {
            if out.len() >= max {
                break;
            }
            let Some(pending) = consumer_state.pending.get_mut(&sequence) else {
                continue;
            };
            if max_deliver.is_some_and(|limit| pending.deliveries >= limit) {
                consumer_state.pending.remove(&sequence);
                continue;
            }
            pending.deliveries += 1;
            pending.deadline = now + ack_wait;
            consumer_state.redelivered += 1;
            let deliveries = pending.deliveries;
            if let Some(message) = find(messages, sequence) {
                out.push(delivery(stream, consumer, message, deliveries));
            }
        }

        let filter = consumer_state.config.filter_subject.clone();
        let start = consumer_state.cursor;
        for message in messages.iter().filter(|m| m.sequence > start) {
            if out.len() >= max {
                break;
            }
            consumer_state.cursor = message.sequence;
            if filter.as_deref().is_some_and(|f| !matches(f, &message.subject)) {
                continue;
            }
            consumer_state.pending.insert(
                message.sequence,
                Pending {
                    deadline: now + ack_wait,
                    deliveries: 1,
                },
            );
            out.push(delivery(stream, consumer, message, 1));
        }

        Ok(out)
    }

    /// Earliest instant at which a pending delivery becomes due again.
    pub fn next_due(&self, stream: &str, consumer: &str) -> Option<Instant> {
        self.streams
            .get(stream)?
            .consumers
            .get(consumer)?
            .pending
            .values()
            .map(|pending| pending.deadline)
            .min()
    }

    pub fn acknowledge(
        &mut self,
        stream: &str,
        consumer: &str,
        sequence: u64,
        kind: AckKind,
        now: Instant,
    ) -> Result<(), TransportError> {
        let state = self.stream_mut(stream)?;
        let consumer_state = state.consumers.get_mut(consumer).ok_or_else(|| {
            TransportError::ConsumerNotFound {
                stream: stream.to_string(),
                consumer: consumer.to_string(),
            }
        })?;
        let ack_wait = consumer_state.config.ack_wait;

        // Acks for deliveries that are no longer pending are ignored.
        match kind {
            AckKind::Ack | AckKind::Term => {
                consumer_state.pending.remove(&sequence);
            }
            AckKind::Nak(delay) => {
                if let Some(pending) = consumer_state.pending.get_mut(&sequence) {
                    pending.deadline = now + delay.unwrap_or_default();
                }
            }
            AckKind::Progress => {
                if let Some(pending) = consumer_state.pending.get_mut(&sequence) {
                    pending.deadline = now + ack_wait;
                }
            }
        }
        Ok(())
    }

    pub fn stream_info(&self, stream: &str) -> Option<StreamInfo> {
        self.streams.get(stream).map(|state| StreamInfo {
            name: state.config.name.clone(),
            messages: state.messages.len(),
            last_sequence: state.last_sequence,
        })
    }

    pub fn consumer_info(&self, stream: &str, consumer: &str) -> Option<ConsumerInfo> {
        self.streams
            .get(stream)?
            .consumers
            .get(consumer)
            .map(|state| ConsumerInfo {
                name: state.config.durable_name.clone(),
                delivered_sequence: state.cursor,
                ack_pending: state.pending.len(),
                redelivered: state.redelivered,
            })
    }

    fn stream_mut(&mut self, stream: &str) -> Result<&mut StreamState, TransportError> {
        self.streams
            .get_mut(stream)
            .ok_or_else(|| TransportError::StreamNotFound(stream.to_string()))
    }
}

fn parse_sequence(value: Option<&str>) -> Result<Option<u64>, TransportError> {
    value
        .map(|v| {
            v.parse::<u64>()
                .map_err(|_| TransportError::Protocol(format!("invalid sequence header `{v}`")))
        })
        .transpose()
}

fn find(messages: &[StoredMessage], sequence: u64) -> Option<&StoredMessage> {
    messages
        .binary_search_by_key(&sequence, |m| m.sequence)
        .ok()
        .map(|i| &messages[i])
}

fn delivery(
    stream: &str,
    consumer: &str,
    message: &StoredMessage,
    deliveries: u32,
) -> ConsumerDelivery {
    ConsumerDelivery {
        stream: stream.to_string(),
        consumer: consumer.to_string(),
        sequence: message.sequence,
        deliveries,
        subject: message.subject.clone(),
        headers: message.headers.clone(),
        payload: message.payload.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    fn store_with_orders() -> Store {
        let mut store = Store::default();
        store
            .add_stream(StreamConfig::new("ORDERS", ["orders.>"]))
            .unwrap();
        store
            .add_consumer(
                "ORDERS",
                ConsumerConfig::new("worker").with_ack_wait(Duration::from_secs(1)),
            )
            .unwrap();
        store
    }

    fn headers(pairs: &[(&str, &str)]) -> Option<Headers> {
        Some(pairs.iter().copied().collect())
    }

    #[test]
    fn test_duplicate_msg_id_is_stored_once() {
        let mut store = store_with_orders();
        let now = Instant::now();

        let first = store
            .store("orders.new", headers(&[(MSG_ID, "a")]), Bytes::from("1"), now)
            .unwrap();
        let second = store
            .store("orders.new", headers(&[(MSG_ID, "a")]), Bytes::from("1"), now)
            .unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.sequence, second.sequence);
        assert_eq!(store.stream_info("ORDERS").unwrap().messages, 1);
    }

    #[test]
    fn test_duplicate_window_expires() {
        let mut store = store_with_orders();
        let now = Instant::now();

        store
            .store("orders.new", headers(&[(MSG_ID, "a")]), Bytes::new(), now)
            .unwrap();
        let later = now + Duration::from_secs(121);
        let ack = store
            .store("orders.new", headers(&[(MSG_ID, "a")]), Bytes::new(), later)
            .unwrap();

        assert!(!ack.duplicate);
        assert_eq!(ack.sequence, 2);
    }

    #[test]
    fn test_expectations_reject_without_appending() {
        let mut store = store_with_orders();
        let now = Instant::now();
        store
            .store("orders.new", None, Bytes::new(), now)
            .unwrap();

        assert_matches!(
            store.store(
                "orders.new",
                headers(&[(EXPECTED_LAST_SEQUENCE, "7")]),
                Bytes::new(),
                now
            ),
            Err(TransportError::StreamStateConflict(_))
        );
        assert_matches!(
            store.store(
                "orders.new",
                headers(&[(EXPECTED_STREAM, "OTHER")]),
                Bytes::new(),
                now
            ),
            Err(TransportError::StreamStateConflict(_))
        );
        assert_matches!(
            store.store(
                "orders.new",
                headers(&[(EXPECTED_LAST_SUBJECT_SEQUENCE, "0")]),
                Bytes::new(),
                now
            ),
            Err(TransportError::StreamStateConflict(_))
        );
        assert_matches!(
            store.store(
                "orders.new",
                headers(&[(EXPECTED_LAST_MSG_ID, "x")]),
                Bytes::new(),
                now
            ),
            Err(TransportError::StreamStateConflict(_))
        );
        assert_eq!(store.stream_info("ORDERS").unwrap().last_sequence, 1);

        let guarded = headers(&[
            (EXPECTED_LAST_SUBJECT_SEQUENCE, "0"),
            (EXPECTED_LAST_SEQUENCE, "1"),
        ]);
        let ack = store
            .store("orders.other", guarded, Bytes::new(), now)
            .unwrap();
        assert_eq!(ack.sequence, 2);
    }

    #[test]
    fn test_unbound_subject_has_no_stream() {
        let mut store = store_with_orders();
        assert_matches!(
            store.store("payments.new", None, Bytes::new(), Instant::now()),
            Err(TransportError::StreamNotFound(_))
        );
    }

    #[test]
    fn test_unacked_messages_become_due_after_ack_wait() {
        let mut store = store_with_orders();
        let now = Instant::now();
        for _ in 0..3 {
            store.store("orders.new", None, Bytes::new(), now).unwrap();
        }

        let first = store.take("ORDERS", "worker", 10, now).unwrap();
        assert_eq!(first.len(), 3);
        store
            .acknowledge("ORDERS", "worker", 1, AckKind::Ack, now)
            .unwrap();
        store
            .acknowledge("ORDERS", "worker", 2, AckKind::Term, now)
            .unwrap();

        assert!(store.take("ORDERS", "worker", 10, now).unwrap().is_empty());

        let later = now + Duration::from_secs(2);
        let redelivered = store.take("ORDERS", "worker", 10, later).unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].sequence, 3);
        assert_eq!(redelivered[0].deliveries, 2);
        assert_eq!(store.consumer_info("ORDERS", "worker").unwrap().redelivered, 1);
    }

    #[test]
    fn test_nak_with_delay_and_progress() {
        let mut store = store_with_orders();
        let now = Instant::now();
        store.store("orders.new", None, Bytes::new(), now).unwrap();
        store.take("ORDERS", "worker", 1, now).unwrap();

        store
            .acknowledge("ORDERS", "worker", 1, AckKind::Nak(None), now)
            .unwrap();
        assert_eq!(store.take("ORDERS", "worker", 1, now).unwrap().len(), 1);

        let half = now + Duration::from_millis(800);
        store
            .acknowledge("ORDERS", "worker", 1, AckKind::Progress, half)
            .unwrap();
        let after_original_wait = now + Duration::from_millis(1200);
        assert!(store.take("ORDERS", "worker", 1, after_original_wait).unwrap().is_empty());
    }

    #[test]
    fn test_batch_limit_and_missing_consumer() {
        let mut store = store_with_orders();
        let now = Instant::now();
        for _ in 0..5 {
            store.store("orders.new", None, Bytes::new(), now).unwrap();
        }

        assert_eq!(store.take("ORDERS", "worker", 2, now).unwrap().len(), 2);
        assert_eq!(store.take("ORDERS", "worker", 10, now).unwrap().len(), 3);
        assert_matches!(
            store.take("ORDERS", "nobody", 1, now),
            Err(TransportError::ConsumerNotFound { .. })
        );
        assert_matches!(
            store.take("MISSING", "worker", 1, now),
            Err(TransportError::StreamNotFound(_))
        );
    }
}
