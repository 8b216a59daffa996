use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use courier_transport::subject::{is_valid_publish_subject, is_valid_subject};
use courier_transport::{
    ConnectOptions, Connector, Inbound, JetStreamOptions, SubscriptionId, Transport,
    TransportEvent,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, instrument, warn};

use crate::dispatch::{Dispatcher, Route, SubscriptionState, in_delivery};
use crate::jetstream::{JetStream, JetStreamShared};
use crate::request::PendingReply;
use crate::status::{ConnectionEvent, ConnectionState, Status};
use crate::{Error, Message, MessageHandler, Subscription};

/// Timeout used by [`Connection::ping`] callers that have no better value.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `close` waits for handlers that are mid-call.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// A connection to a broker.
///
/// Cheap to clone; clones share the link. The link is closed by
/// [`Connection::close`], or in the background once the last clone is dropped.
/// Subscriptions and JetStream contexts do not keep it alive.
#[derive(Clone, Debug)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

#[derive(Debug)]
pub(crate) struct ConnectionInner {
    pub options: ConnectOptions,
    pub transport: Arc<dyn Transport>,
    pub state: Arc<ConnectionState>,
    pub dispatcher: Dispatcher,
    jetstreams: Mutex<Vec<Arc<JetStreamShared>>>,
    next_sid: AtomicU64,
    torn_down: AtomicBool,
}

impl Connection {
    /// Validates `options` and connects through `connector`.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] for invalid options, [`Error::Connection`]
    /// when no server could be reached in time or credentials were rejected.
    #[instrument(skip_all, fields(name = %options.name))]
    pub async fn connect<C>(connector: &C, options: ConnectOptions) -> Result<Self, Error>
    where
        C: Connector + ?Sized,
    {
        options.validate()?;

        let state = Arc::new(ConnectionState::new());
        state.set_status(Status::Connecting);

        let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inbound = Inbound {
            deliveries: deliveries_tx,
            events: events_tx,
        };

        let transport = match tokio::time::timeout(
            options.timeout,
            connector.connect(&options, inbound),
        )
        .await
        {
            Ok(Ok(transport)) => transport,
            Ok(Err(error)) => {
                warn!(%error, "connect failed");
                return Err(error.into());
            }
            Err(_) => {
                warn!(timeout = ?options.timeout, "connect timed out");
                return Err(Error::Connection(format!(
                    "no server reachable within {:?}",
                    options.timeout
                )));
            }
        };

        let pool_size = options.delivery_pool_size.unwrap_or_else(num_cpus::get);
        let dispatcher = Dispatcher::start(pool_size, deliveries_rx);
        let allow_reconnect = options.allow_reconnect;

        let inner = Arc::new(ConnectionInner {
            options,
            transport,
            state: Arc::clone(&state),
            dispatcher,
            jetstreams: Mutex::new(Vec::new()),
            next_sid: AtomicU64::new(1),
            torn_down: AtomicBool::new(false),
        });
        tokio::spawn(pump_events(
            Arc::downgrade(&inner),
            state,
            allow_reconnect,
            events_rx,
        ));

        inner.state.set_status(Status::Connected);
        info!(server = ?inner.transport.connected_server(), "connected");
        Ok(Self { inner })
    }

    /// Connects to a single URL, or a comma separated list, with default options.
    ///
    /// # Errors
    ///
    /// See [`Connection::connect`].
    pub async fn connect_to_server<C>(connector: &C, url: &str) -> Result<Self, Error>
    where
        C: Connector + ?Sized,
    {
        let options = ConnectOptions::from_url(url)?;
        Self::connect(connector, options).await
    }

    /// Closes the connection, its subscriptions and JetStream contexts.
    ///
    /// Waits a bounded time for handlers that are running. Idempotent, and
    /// safe to call from inside a handler.
    #[instrument(skip_all, fields(name = %self.inner.options.name))]
    pub async fn close(&self) {
        self.inner.teardown().await;
    }

    /// Drains the connection, then closes it.
    ///
    /// Stops all subscriptions at the broker and lets deliveries already
    /// received run, waits for outstanding JetStream publishes, and flushes.
    /// The connection is closed afterwards whatever the outcome.
    ///
    /// # Errors
    ///
    /// [`Error::Closed`] if already closed, [`Error::Timeout`] when draining
    /// took longer than `timeout`.
    #[instrument(skip_all, fields(name = %self.inner.options.name))]
    pub async fn drain(&self, timeout: Duration) -> Result<(), Error> {
        self.inner.state.ensure_open()?;

        let inner = &self.inner;
        let draining = async {
            inner.state.set_status(Status::DrainingSubs);
            for sid in inner.dispatcher.subscription_ids() {
                let _ = inner.transport.unsubscribe(sid).await;
            }
            if !in_delivery() {
                inner.dispatcher.barrier().await;
            }

            inner.state.set_status(Status::DrainingPubs);
            let contexts = inner.jetstreams.lock().clone();
            for context in contexts {
                context.wait_idle().await;
            }
            inner.transport.flush(timeout).await
        };

        let outcome = tokio::time::timeout(timeout, draining).await;
        inner.teardown().await;
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(error.into()),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Publishes without waiting for the broker.
    ///
    /// Transport failures are reported through [`Connection::events`].
    ///
    /// # Errors
    ///
    /// [`Error::Closed`] after close, [`Error::InvalidSubject`] for a
    /// malformed subject.
    pub async fn publish(&self, message: Message) -> Result<(), Error> {
        self.inner.state.ensure_open()?;
        if !is_valid_publish_subject(&message.subject) {
            return Err(Error::InvalidSubject(message.subject));
        }

        if let Err(error) = self.inner.transport.publish(message.to_outbound()).await {
            self.inner.state.report(error.into(), Some(message.subject));
        }
        Ok(())
    }

    /// Sends a request and waits up to `timeout` for the first reply.
    ///
    /// # Errors
    ///
    /// [`Error::NoResponders`] when nobody listens on the subject,
    /// [`Error::Timeout`] when no reply came in time, [`Error::Closed`] after
    /// close.
    pub async fn request(&self, message: Message, timeout: Duration) -> Result<Message, Error> {
        self.inner.round_trip(message, timeout).await
    }

    /// Starts a request and returns at once; the reply is delivered through
    /// the returned [`PendingReply`].
    ///
    /// # Errors
    ///
    /// [`Error::Closed`] after close, [`Error::InvalidSubject`] for a
    /// malformed subject. Later failures resolve the [`PendingReply`].
    pub fn async_request(&self, message: Message, timeout: Duration) -> Result<PendingReply, Error> {
        self.inner.state.ensure_open()?;
        if !is_valid_publish_subject(&message.subject) {
            return Err(Error::InvalidSubject(message.subject));
        }

        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let outcome = inner.round_trip(message, timeout).await;
            let _ = tx.send(outcome);
        });
        Ok(PendingReply::new(rx))
    }

    /// Subscribes `handler` to `subject`, which may contain wildcards.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidSubject`] for a malformed subject, [`Error::Closed`]
    /// after close, or the transport's error.
    pub async fn subscribe<H>(&self, subject: &str, handler: H) -> Result<Subscription, Error>
    where
        H: MessageHandler,
    {
        self.inner.subscribe(subject, None, Arc::new(handler)).await
    }

    /// Subscribes as a member of `queue_group`; each message goes to one member.
    ///
    /// # Errors
    ///
    /// See [`Connection::subscribe`]; an empty or blank queue group is an
    /// [`Error::InvalidSubject`].
    pub async fn queue_subscribe<H>(
        &self,
        subject: &str,
        queue_group: &str,
        handler: H,
    ) -> Result<Subscription, Error>
    where
        H: MessageHandler,
    {
        self.inner
            .subscribe(subject, Some(queue_group), Arc::new(handler))
            .await
    }

    /// Round-trips to the broker. `false` on timeout, while disconnected, or
    /// after close.
    pub async fn ping(&self, timeout: Duration) -> bool {
        if self.inner.state.status() != Status::Connected {
            return false;
        }
        matches!(
            tokio::time::timeout(timeout, self.inner.transport.flush(timeout)).await,
            Ok(Ok(()))
        )
    }

    /// Opens a JetStream context.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] for invalid options, [`Error::Closed`] after close.
    pub fn jetstream(&self, options: JetStreamOptions) -> Result<JetStream, Error> {
        self.inner.state.ensure_open()?;
        options.validate()?;

        let api = self.inner.transport.jetstream(&options)?;
        let shared = Arc::new(JetStreamShared::new(api, options));
        self.inner.jetstreams.lock().push(Arc::clone(&shared));
        Ok(JetStream::new(shared, Arc::downgrade(&self.inner)))
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> Status {
        self.inner.state.status()
    }

    /// Watches status changes.
    #[must_use]
    pub fn status_changes(&self) -> watch::Receiver<Status> {
        self.inner.state.status_receiver()
    }

    /// Receives status changes and asynchronous errors.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.state.event_receiver()
    }

    /// Text of the most recent asynchronous error, or empty.
    #[must_use]
    pub fn error_string(&self) -> String {
        self.inner.state.last_error()
    }

    /// Address of the server in use.
    #[must_use]
    pub fn current_server(&self) -> Option<String> {
        self.inner.transport.connected_server()
    }

    /// Options the connection was made with.
    #[must_use]
    pub fn options(&self) -> &ConnectOptions {
        &self.inner.options
    }

    /// Whether the connection is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.is_closed()
    }

    /// Number of delivery workers.
    #[must_use]
    pub fn delivery_pool_size(&self) -> usize {
        self.inner.dispatcher.pool_size()
    }
}

impl ConnectionInner {
    pub fn next_sid(&self) -> SubscriptionId {
        self.next_sid.fetch_add(1, Ordering::Relaxed)
    }

    /// Validates and installs a route for a handler-backed subscription.
    /// The caller registers it with the transport.
    pub fn add_route(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Arc<SubscriptionState>, Error> {
        self.state.ensure_open()?;
        if !is_valid_subject(subject) {
            return Err(Error::InvalidSubject(subject.to_string()));
        }
        if let Some(group) = queue_group {
            if group.is_empty() || group.chars().any(char::is_whitespace) {
                return Err(Error::InvalidSubject(group.to_string()));
            }
        }

        let sid = self.next_sid();
        let state = Arc::new(SubscriptionState::new(sid, subject, queue_group, handler));
        self.dispatcher
            .register(sid, Route::Subscription(Arc::clone(&state)));
        Ok(state)
    }

    /// Undoes [`ConnectionInner::add_route`] after the transport refused it.
    pub async fn release_route(&self, state: &SubscriptionState) {
        state.close();
        self.dispatcher.remove(state.sid);
        let _ = self.transport.unsubscribe(state.sid).await;
    }

    async fn subscribe(
        self: &Arc<Self>,
        subject: &str,
        queue_group: Option<&str>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, Error> {
        let state = self.add_route(subject, queue_group, handler)?;
        if let Err(error) = self.transport.subscribe(state.sid, subject, queue_group).await {
            self.release_route(&state).await;
            return Err(error.into());
        }
        debug!(sid = state.sid, subject, ?queue_group, "subscribed");
        Ok(Subscription::new(state, Arc::downgrade(self)))
    }

    async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing connection");
        self.state.mark_closed();

        let contexts = std::mem::take(&mut *self.jetstreams.lock());
        for context in contexts {
            context.invalidate();
        }
        self.dispatcher.shutdown(CLOSE_GRACE).await;
        self.transport.close().await;
        self.state.set_status(Status::Closed);
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("last connection handle dropped, closing in background");
        self.state.mark_closed();
        for context in self.jetstreams.get_mut().drain(..) {
            context.invalidate();
        }
        self.dispatcher.abort();

        let transport = Arc::clone(&self.transport);
        let state = Arc::clone(&self.state);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    transport.close().await;
                    state.set_status(Status::Closed);
                });
            }
            Err(_) => state.set_status(Status::Closed),
        }
    }
}

/// Turns transport events into status changes.
async fn pump_events(
    inner: Weak<ConnectionInner>,
    state: Arc<ConnectionState>,
    allow_reconnect: bool,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Disconnected => {
                warn!("link lost");
                state.set_status(if allow_reconnect {
                    Status::Reconnecting
                } else {
                    Status::Disconnected
                });
            }
            TransportEvent::Reconnecting { attempt } => {
                debug!(attempt, "reconnecting");
                state.set_status(Status::Reconnecting);
            }
            TransportEvent::Reconnected { server } => {
                info!(%server, "reconnected");
                state.set_status(Status::Connected);
            }
            TransportEvent::Closed => {
                match inner.upgrade() {
                    Some(inner) => inner.teardown().await,
                    None => {
                        state.mark_closed();
                        state.set_status(Status::Closed);
                    }
                }
                break;
            }
            TransportEvent::Error { error, subject } => state.report(error.into(), subject),
        }
    }
}
