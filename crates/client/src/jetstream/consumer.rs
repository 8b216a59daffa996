use std::time::Duration;

use tracing::debug;

use super::JetStream;
use crate::{Error, Message, Subscription};

/// A handler bound to a durable push consumer.
///
/// Behaves like a [`Subscription`]: dropping it unbinds the handler.
#[derive(Debug)]
pub struct PushSubscription {
    subscription: Subscription,
    stream: String,
    consumer: String,
}

impl PushSubscription {
    pub(crate) const fn new(subscription: Subscription, stream: String, consumer: String) -> Self {
        Self {
            subscription,
            stream,
            consumer,
        }
    }

    /// Subject filter.
    #[must_use]
    pub fn subject(&self) -> &str {
        self.subscription.subject()
    }

    /// Stream the consumer belongs to.
    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Durable consumer name.
    #[must_use]
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Whether messages are still being delivered.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.subscription.is_valid()
    }

    /// Messages handed to the handler so far, redeliveries included.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.subscription.delivered()
    }

    /// Unbinds the handler. The consumer and its unacknowledged messages stay
    /// on the broker.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the broker could not be told.
    pub async fn unsubscribe(&self) -> Result<(), Error> {
        self.subscription.unsubscribe().await
    }
}

/// A durable pull consumer; messages are requested with
/// [`PullSubscription::fetch`].
#[derive(Debug)]
pub struct PullSubscription {
    context: JetStream,
    subject: String,
    stream: String,
    consumer: String,
}

impl PullSubscription {
    pub(crate) const fn new(context: JetStream, subject: String, stream: String, consumer: String) -> Self {
        Self {
            context,
            subject,
            stream,
            consumer,
        }
    }

    /// Subject filter.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Stream the consumer belongs to.
    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Durable consumer name.
    #[must_use]
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Fetches up to `batch` messages.
    ///
    /// Returns as soon as at least one message is available, and an empty
    /// batch when none arrived within `timeout`. Every message must be
    /// acknowledged.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] for a zero batch, [`Error::Closed`] after the
    /// connection closed, [`Error::Timeout`] when the broker stopped
    /// answering altogether.
    pub async fn fetch(&self, batch: usize, timeout: Duration) -> Result<Vec<Message>, Error> {
        self.context.ensure_open()?;
        if batch == 0 {
            return Err(Error::Configuration(
                "fetch batch must be at least 1".to_string(),
            ));
        }

        let guard = timeout.saturating_add(self.context.options().wait);
        let fetched = tokio::time::timeout(
            guard,
            self.context
                .api()
                .fetch(&self.subject, &self.stream, &self.consumer, batch, timeout),
        )
        .await
        .map_err(|_| Error::Timeout)??;

        debug!(
            stream = %self.stream,
            consumer = %self.consumer,
            batch,
            fetched = fetched.len(),
            "fetched"
        );
        Ok(fetched.into_iter().map(Message::from).collect())
    }
}
