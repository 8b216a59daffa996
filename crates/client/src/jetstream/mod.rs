//! Durable publishing and consumption.
//!
//! A [`JetStream`] context is opened from a [`crate::Connection`] and becomes
//! unusable when the connection closes. Publishing waits for the stream's
//! acknowledgment; consumption goes through push or pull subscriptions on
//! durable consumers, with explicit acknowledgment of every message.

mod consumer;

pub use consumer::{PullSubscription, PushSubscription};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use courier_transport::subject::{is_valid_publish_subject, is_valid_subject};
use courier_transport::{JetStreamOptions, JetStreamTransport, PublishAck, PublishOptions};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

use crate::connection::ConnectionInner;
use crate::{Error, Message, MessageHandler, Subscription};

const EVENT_CAPACITY: usize = 256;

/// Notifications raised by a [`JetStream`] context.
#[derive(Clone, Debug)]
pub enum JetStreamEvent {
    /// An [`JetStream::async_publish`] was not stored.
    PublishFailed {
        /// The message that was not stored.
        message: Message,
        /// Why.
        error: Error,
    },
}

#[derive(Debug)]
pub(crate) struct JetStreamShared {
    api: Arc<dyn JetStreamTransport>,
    options: JetStreamOptions,
    closed: AtomicBool,
    pending: Arc<watch::Sender<usize>>,
    events: broadcast::Sender<JetStreamEvent>,
    queue: mpsc::UnboundedSender<PublishJob>,
}

/// An asynchronous publish waiting for its turn.
#[derive(Debug)]
struct PublishJob {
    message: Message,
    options: PublishOptions,
    wait: Duration,
}

impl JetStreamShared {
    pub fn new(api: Arc<dyn JetStreamTransport>, options: JetStreamOptions) -> Self {
        let pending = Arc::new(watch::Sender::new(0));
        let events = broadcast::Sender::new(EVENT_CAPACITY);
        let (queue, jobs) = mpsc::unbounded_channel();
        tokio::spawn(publish_in_order(
            Arc::clone(&api),
            Arc::clone(&pending),
            events.clone(),
            jobs,
        ));
        Self {
            api,
            options,
            closed: AtomicBool::new(false),
            pending,
            events,
            queue,
        }
    }

    pub fn invalidate(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Resolves once no asynchronous publish is outstanding.
    pub async fn wait_idle(&self) {
        let mut pending = self.pending.subscribe();
        let _ = pending.wait_for(|count| *count == 0).await;
    }

    fn pending(&self) -> usize {
        *self.pending.borrow()
    }
}

/// A JetStream context.
#[derive(Clone, Debug)]
pub struct JetStream {
    shared: Arc<JetStreamShared>,
    connection: Weak<ConnectionInner>,
}

impl JetStream {
    pub(crate) const fn new(shared: Arc<JetStreamShared>, connection: Weak<ConnectionInner>) -> Self {
        Self { shared, connection }
    }

    /// Options the context was opened with.
    #[must_use]
    pub fn options(&self) -> &JetStreamOptions {
        &self.shared.options
    }

    /// Stores `message` and waits for the stream's acknowledgment, up to
    /// `options.timeout` or the context's wait.
    ///
    /// # Errors
    ///
    /// [`Error::StreamStateConflict`] when an expectation does not hold
    /// (nothing is stored), [`Error::StreamNotFound`] when no stream captures
    /// the subject, [`Error::Timeout`], [`Error::Configuration`] for
    /// contradicting options, [`Error::Closed`] after the connection closed.
    pub async fn publish(&self, message: Message, options: &PublishOptions) -> Result<PublishAck, Error> {
        self.check_publish(&message, options)?;
        let wait = options.timeout.unwrap_or(self.shared.options.wait);

        let ack = self
            .shared
            .api
            .publish(message.to_outbound(), options, wait)
            .await?;
        debug!(
            subject = %message.subject,
            stream = %ack.stream,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            "message stored"
        );
        Ok(ack)
    }

    /// Starts a durable publish and returns at once.
    ///
    /// Asynchronous publishes on one context reach the stream in call order.
    /// Failures are reported as [`JetStreamEvent::PublishFailed`]; use
    /// [`JetStream::wait_for_publish_completed`] to wait for outstanding ones.
    ///
    /// # Errors
    ///
    /// Only what can be checked up front: [`Error::Closed`],
    /// [`Error::InvalidSubject`], [`Error::Configuration`].
    pub fn async_publish(&self, message: Message, options: PublishOptions) -> Result<(), Error> {
        self.check_publish(&message, &options)?;
        let wait = options.timeout.unwrap_or(self.shared.options.wait);

        self.shared.pending.send_modify(|count| *count += 1);
        let job = PublishJob {
            message,
            options,
            wait,
        };
        if self.shared.queue.send(job).is_err() {
            self.shared
                .pending
                .send_modify(|count| *count = count.saturating_sub(1));
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Waits until no asynchronous publish is outstanding.
    ///
    /// # Errors
    ///
    /// [`Error::PublishesPending`] with the outstanding count when `timeout`
    /// elapses first. The publishes keep running; waiting again is fine.
    pub async fn wait_for_publish_completed(&self, timeout: Duration) -> Result<(), Error> {
        if tokio::time::timeout(timeout, self.shared.wait_idle())
            .await
            .is_ok()
        {
            return Ok(());
        }
        match self.shared.pending() {
            0 => Ok(()),
            count => Err(Error::PublishesPending(count)),
        }
    }

    /// Asynchronous publishes still outstanding.
    #[must_use]
    pub fn pending_publishes(&self) -> usize {
        self.shared.pending()
    }

    /// Receives failures of asynchronous publishes.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<JetStreamEvent> {
        self.shared.events.subscribe()
    }

    /// Name of the stream capturing `subject`.
    ///
    /// # Errors
    ///
    /// [`Error::StreamNotFound`], [`Error::Timeout`], [`Error::Closed`].
    pub async fn stream_by_subject(&self, subject: &str) -> Result<String, Error> {
        self.ensure_open()?;
        if !is_valid_subject(subject) {
            return Err(Error::InvalidSubject(subject.to_string()));
        }
        tokio::time::timeout(self.shared.options.wait, self.shared.api.stream_by_subject(subject))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(Error::from)
    }

    /// Binds `handler` to the durable push consumer `consumer`.
    ///
    /// An empty `stream` is resolved from `subject`. Messages are never
    /// acknowledged automatically.
    ///
    /// # Errors
    ///
    /// [`Error::StreamNotFound`], [`Error::ConsumerNotFound`],
    /// [`Error::InvalidSubject`], [`Error::Closed`].
    pub async fn subscribe<H>(
        &self,
        subject: &str,
        stream: &str,
        consumer: &str,
        handler: H,
    ) -> Result<PushSubscription, Error>
    where
        H: MessageHandler,
    {
        let connection = self.connection()?;
        let stream = self.resolve_stream(subject, stream).await?;
        check_consumer_name(consumer)?;

        let state = connection.add_route(subject, None, Arc::new(handler))?;
        if let Err(error) = self
            .shared
            .api
            .subscribe(state.sid, subject, &stream, consumer)
            .await
        {
            connection.release_route(&state).await;
            return Err(error.into());
        }

        debug!(sid = state.sid, subject, %stream, consumer, "push subscription bound");
        let subscription = Subscription::new(state, Arc::downgrade(&connection));
        Ok(PushSubscription::new(subscription, stream, consumer.to_string()))
    }

    /// Opens the durable pull consumer `consumer`. An empty `stream` is
    /// resolved from `subject`.
    ///
    /// # Errors
    ///
    /// [`Error::ConsumerNotFound`] when the consumer does not exist,
    /// [`Error::StreamNotFound`], [`Error::Closed`].
    pub async fn pull_subscribe(
        &self,
        subject: &str,
        stream: &str,
        consumer: &str,
    ) -> Result<PullSubscription, Error> {
        self.ensure_open()?;
        let stream = self.resolve_stream(subject, stream).await?;
        check_consumer_name(consumer)?;

        let exists = tokio::time::timeout(
            self.shared.options.wait,
            self.shared.api.consumer_exists(&stream, consumer),
        )
        .await
        .map_err(|_| Error::Timeout)??;
        if !exists {
            return Err(Error::ConsumerNotFound {
                stream,
                consumer: consumer.to_string(),
            });
        }

        Ok(PullSubscription::new(
            self.clone(),
            subject.to_string(),
            stream,
            consumer.to_string(),
        ))
    }

    pub(crate) fn api(&self) -> &Arc<dyn JetStreamTransport> {
        &self.shared.api
    }

    pub(crate) fn ensure_open(&self) -> Result<(), Error> {
        self.connection().map(|_| ())
    }

    fn connection(&self) -> Result<Arc<ConnectionInner>, Error> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let connection = self.connection.upgrade().ok_or(Error::Closed)?;
        connection.state.ensure_open()?;
        Ok(connection)
    }

    fn check_publish(&self, message: &Message, options: &PublishOptions) -> Result<(), Error> {
        self.ensure_open()?;
        if !is_valid_publish_subject(&message.subject) {
            return Err(Error::InvalidSubject(message.subject.clone()));
        }
        options.validate()?;
        Ok(())
    }

    async fn resolve_stream(&self, subject: &str, stream: &str) -> Result<String, Error> {
        if stream.is_empty() {
            self.stream_by_subject(subject).await
        } else {
            Ok(stream.to_string())
        }
    }
}

/// Sends queued asynchronous publishes one at a time, so the stream stores
/// them in call order.
async fn publish_in_order(
    api: Arc<dyn JetStreamTransport>,
    pending: Arc<watch::Sender<usize>>,
    events: broadcast::Sender<JetStreamEvent>,
    mut jobs: mpsc::UnboundedReceiver<PublishJob>,
) {
    while let Some(PublishJob {
        message,
        options,
        wait,
    }) = jobs.recv().await
    {
        if let Err(error) = api.publish(message.to_outbound(), &options, wait).await {
            let error = Error::from(error);
            warn!(subject = %message.subject, %error, "asynchronous publish failed");
            let _ = events.send(JetStreamEvent::PublishFailed { message, error });
        }
        pending.send_modify(|count| *count = count.saturating_sub(1));
    }
}

fn check_consumer_name(consumer: &str) -> Result<(), Error> {
    if consumer.is_empty() || consumer.contains(['.', '*', '>', ' ']) {
        return Err(Error::Configuration(format!(
            "invalid consumer name `{consumer}`"
        )));
    }
    Ok(())
}
