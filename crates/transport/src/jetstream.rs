use std::time::Duration;

use crate::error::TransportError;
use crate::headers::{
    EXPECTED_LAST_MSG_ID, EXPECTED_LAST_SEQUENCE, EXPECTED_LAST_SUBJECT_SEQUENCE,
    EXPECTED_STREAM, Headers, MSG_ID,
};

/// Default time to wait for JetStream API responses.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// Options for a JetStream context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JetStreamOptions {
    /// JetStream domain to address, `None` for the local one.
    pub domain: Option<String>,
    /// Default time to wait for acknowledgments and API calls.
    pub wait: Duration,
}

impl Default for JetStreamOptions {
    fn default() -> Self {
        Self {
            domain: None,
            wait: DEFAULT_WAIT,
        }
    }
}

impl JetStreamOptions {
    /// Checks the options for inconsistencies.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidOption`] for a zero wait or an empty domain.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.wait.is_zero() {
            return Err(TransportError::InvalidOption(
                "jetstream wait must be non-zero".to_string(),
            ));
        }
        if self.domain.as_deref().is_some_and(str::is_empty) {
            return Err(TransportError::InvalidOption(
                "jetstream domain must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-publish options for a durable publish.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// How long to wait for the acknowledgment, overriding the context wait.
    pub timeout: Option<Duration>,
    /// De-duplication id.
    pub msg_id: Option<String>,
    /// Stream the subject must resolve to.
    pub expected_stream: Option<String>,
    /// Id the stream's last message must carry.
    pub expected_last_msg_id: Option<String>,
    /// Sequence the stream's last message must have.
    pub expected_last_sequence: Option<u64>,
    /// Sequence the last message on this subject must have.
    pub expected_last_subject_sequence: Option<u64>,
    /// Require that no message exists yet on this subject.
    pub expect_no_message: bool,
}

impl PublishOptions {
    /// Options with only a de-duplication id set.
    #[must_use]
    pub fn with_msg_id(msg_id: impl Into<String>) -> Self {
        Self {
            msg_id: Some(msg_id.into()),
            ..Self::default()
        }
    }

    /// The effective expected last subject sequence, folding in
    /// `expect_no_message`.
    #[must_use]
    pub const fn last_subject_sequence_guard(&self) -> Option<u64> {
        if self.expect_no_message {
            Some(0)
        } else {
            self.expected_last_subject_sequence
        }
    }

    /// Adds the de-duplication id and expectation guards to `headers`, as
    /// the broker expects them on a durable publish.
    #[must_use]
    pub fn apply_headers(&self, headers: Option<Headers>) -> Headers {
        let mut headers = headers.unwrap_or_default();
        if let Some(id) = &self.msg_id {
            headers.insert(MSG_ID, id.as_str());
        }
        if let Some(stream) = &self.expected_stream {
            headers.insert(EXPECTED_STREAM, stream.as_str());
        }
        if let Some(id) = &self.expected_last_msg_id {
            headers.insert(EXPECTED_LAST_MSG_ID, id.as_str());
        }
        if let Some(sequence) = self.expected_last_sequence {
            headers.insert(EXPECTED_LAST_SEQUENCE, sequence.to_string());
        }
        if let Some(sequence) = self.last_subject_sequence_guard() {
            headers.insert(EXPECTED_LAST_SUBJECT_SEQUENCE, sequence.to_string());
        }
        headers
    }

    /// Checks the options for inconsistencies.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidOption`] when guards contradict each
    /// other or a string guard is empty.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.expect_no_message && self.expected_last_subject_sequence.is_some_and(|seq| seq != 0)
        {
            return Err(TransportError::InvalidOption(
                "expect_no_message conflicts with a non-zero expected_last_subject_sequence"
                    .to_string(),
            ));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(TransportError::InvalidOption(
                "publish timeout must be non-zero".to_string(),
            ));
        }
        for (name, value) in [
            ("msg_id", &self.msg_id),
            ("expected_stream", &self.expected_stream),
            ("expected_last_msg_id", &self.expected_last_msg_id),
        ] {
            if value.as_deref().is_some_and(str::is_empty) {
                return Err(TransportError::InvalidOption(format!(
                    "{name} must not be empty"
                )));
            }
        }
        Ok(())
    }
}

/// Acknowledgment returned by a durable publish.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishAck {
    /// Stream the message was stored in.
    pub stream: String,
    /// Sequence assigned by the stream.
    pub sequence: u64,
    /// Domain of the stream, empty for the local domain.
    pub domain: String,
    /// Whether the message was a duplicate of an earlier one.
    pub duplicate: bool,
}

/// Acknowledgment actions for a JetStream delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckKind {
    /// Processing succeeded.
    Ack,
    /// Processing failed; redeliver, optionally after a delay.
    Nak(Option<Duration>),
    /// Still working; reset the redelivery timer.
    Progress,
    /// Never redeliver.
    Term,
}

impl AckKind {
    /// Whether this action ends the delivery.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    #[test]
    fn test_expect_no_message_folds_into_subject_guard() {
        let options = PublishOptions {
            expect_no_message: true,
            ..PublishOptions::default()
        };
        assert_eq!(options.last_subject_sequence_guard(), Some(0));
        assert!(options.validate().is_ok());

        let conflicting = PublishOptions {
            expect_no_message: true,
            expected_last_subject_sequence: Some(4),
            ..PublishOptions::default()
        };
        assert_matches!(conflicting.validate(), Err(TransportError::InvalidOption(_)));
    }

    #[test]
    fn test_guards_become_headers() {
        let options = PublishOptions {
            msg_id: Some("order-7".to_string()),
            expected_last_sequence: Some(3),
            expect_no_message: true,
            ..PublishOptions::default()
        };
        let mut existing = Headers::new();
        existing.insert("Trace", "abc");

        let headers = options.apply_headers(Some(existing));
        assert_eq!(headers.get(MSG_ID), Some("order-7"));
        assert_eq!(headers.get(EXPECTED_LAST_SEQUENCE), Some("3"));
        assert_eq!(headers.get(EXPECTED_LAST_SUBJECT_SEQUENCE), Some("0"));
        assert_eq!(headers.get("Trace"), Some("abc"));
        assert!(!headers.contains_key(EXPECTED_STREAM));
    }

    #[test]
    fn test_empty_msg_id_rejected() {
        assert_matches!(
            PublishOptions::with_msg_id("").validate(),
            Err(TransportError::InvalidOption(_))
        );
    }

    #[test]
    fn test_jetstream_options_validation() {
        assert!(JetStreamOptions::default().validate().is_ok());

        let options = JetStreamOptions {
            wait: Duration::ZERO,
            ..JetStreamOptions::default()
        };
        assert_matches!(options.validate(), Err(TransportError::InvalidOption(_)));
    }

    #[test]
    fn test_progress_is_not_terminal() {
        assert!(!AckKind::Progress.is_terminal());
        assert!(AckKind::Nak(None).is_terminal());
        assert!(AckKind::Term.is_terminal());
    }
}
