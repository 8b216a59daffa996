use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use courier_transport::subject::matches;
use courier_transport::{
    AckKind, Acker, ConnectOptions, Delivery, Headers, InboundMessage, NO_RESPONDERS_STATUS,
    OutboundMessage, PublishAck, SubscriptionId, TransportError,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::GLOBAL_REGISTRY;
use crate::jetstream::{
    ConsumerConfig, ConsumerDelivery, ConsumerInfo, Store, StreamConfig, StreamInfo,
};

/// Credentials a [`MemoryServer`] requires from clients.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Auth {
    /// User and password.
    UserPassword {
        /// Expected user.
        user: String,
        /// Expected password.
        password: String,
    },
    /// A single token.
    Token(String),
}

/// Options for a [`MemoryServer`].
#[derive(Clone, Debug, Default)]
pub struct ServerOptions {
    /// Required credentials, `None` to accept anyone.
    pub auth: Option<Auth>,
    /// JetStream domain the server answers for.
    pub domain: Option<String>,
    /// Disable the JetStream API.
    pub disable_jetstream: bool,
}

#[derive(Debug)]
struct ClientEntry {
    name: String,
    echo: bool,
    deliveries: tokio::sync::mpsc::UnboundedSender<Delivery>,
}

#[derive(Debug)]
struct SubscriptionEntry {
    subject: String,
    queue_group: Option<String>,
}

#[derive(Debug)]
struct PushBinding {
    client: u64,
    sid: SubscriptionId,
    cancel: CancellationToken,
}

#[derive(Debug)]
pub(crate) struct ServerInner {
    url: String,
    options: ServerOptions,
    online: watch::Sender<bool>,
    stalled: watch::Sender<bool>,
    clients: DashMap<u64, ClientEntry>,
    subscriptions: DashMap<(u64, SubscriptionId), SubscriptionEntry>,
    push_bindings: DashMap<(String, String), PushBinding>,
    store: Mutex<Store>,
    stored: Notify,
    jetstream_latency: Mutex<Duration>,
}

/// An in-process broker reachable through [`crate::MemoryConnector`].
///
/// Servers register themselves under their URL when started and stay
/// reachable until [`MemoryServer::unregister`] is called.
#[derive(Clone, Debug)]
pub struct MemoryServer {
    inner: Arc<ServerInner>,
}

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

impl MemoryServer {
    /// Starts a server answering on `url` (e.g. `memory://orders`).
    ///
    /// # Errors
    ///
    /// Fails if the URL does not parse or another server already uses it.
    pub fn start(url: &str, options: ServerOptions) -> Result<Self, TransportError> {
        let key = registry_key(url)?;
        if GLOBAL_REGISTRY.contains_key(&key) {
            return Err(TransportError::InvalidOption(format!(
                "a memory server is already registered at {key}"
            )));
        }

        let server = Self {
            inner: Arc::new(ServerInner {
                url: key.clone(),
                options,
                online: watch::Sender::new(true),
                stalled: watch::Sender::new(false),
                clients: DashMap::new(),
                subscriptions: DashMap::new(),
                push_bindings: DashMap::new(),
                store: Mutex::new(Store::default()),
                stored: Notify::new(),
                jetstream_latency: Mutex::new(Duration::ZERO),
            }),
        };
        GLOBAL_REGISTRY.insert(key.clone(), server.clone());

        info!(url = %key, "memory server started");
        Ok(server)
    }

    /// URL the server is registered under.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Drops every client and refuses new ones until [`Self::resume`].
    /// Stream contents and consumer state survive.
    pub fn shutdown(&self) {
        info!(url = %self.inner.url, "memory server going offline");
        self.inner.online.send_replace(false);
        let clients: Vec<u64> = self.inner.clients.iter().map(|c| *c.key()).collect();
        for client in clients {
            self.detach(client);
        }
    }

    /// Accepts clients again after [`Self::shutdown`].
    pub fn resume(&self) {
        info!(url = %self.inner.url, "memory server back online");
        self.inner.online.send_replace(true);
    }

    /// Stops answering pings while keeping links open, as a wedged server would.
    pub fn stall(&self, stalled: bool) {
        warn!(url = %self.inner.url, stalled, "memory server stall toggled");
        self.inner.stalled.send_replace(stalled);
    }

    /// Delays every JetStream API call by `latency`.
    pub fn set_jetstream_latency(&self, latency: Duration) {
        *self.inner.jetstream_latency.lock() = latency;
    }

    /// Removes the server from the registry and takes it offline.
    pub fn unregister(&self) {
        self.shutdown();
        GLOBAL_REGISTRY.remove(&self.inner.url);
    }

    /// Whether the server accepts clients.
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    /// Names of the connected clients.
    #[must_use]
    pub fn client_names(&self) -> Vec<String> {
        self.inner.clients.iter().map(|c| c.name.clone()).collect()
    }

    /// Number of live subscriptions across all clients.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// Creates a stream.
    ///
    /// # Errors
    ///
    /// Fails on invalid names or subjects, or when the name or subjects are taken.
    pub fn add_stream(&self, config: StreamConfig) -> Result<(), TransportError> {
        self.inner.store.lock().add_stream(config)
    }

    /// Creates a durable consumer on `stream`.
    ///
    /// # Errors
    ///
    /// Fails if the stream is missing or the consumer already exists.
    pub fn add_consumer(&self, stream: &str, config: ConsumerConfig) -> Result<(), TransportError> {
        self.inner.store.lock().add_consumer(stream, config)
    }

    /// Snapshot of `stream`.
    #[must_use]
    pub fn stream_info(&self, stream: &str) -> Option<StreamInfo> {
        self.inner.store.lock().stream_info(stream)
    }

    /// Snapshot of a durable consumer.
    #[must_use]
    pub fn consumer_info(&self, stream: &str, consumer: &str) -> Option<ConsumerInfo> {
        self.inner.store.lock().consumer_info(stream, consumer)
    }

    pub(crate) fn online_receiver(&self) -> watch::Receiver<bool> {
        self.inner.online.subscribe()
    }

    pub(crate) fn is_stalled(&self) -> bool {
        *self.inner.stalled.borrow()
    }

    pub(crate) async fn wait_responsive(&self) {
        let mut stalled = self.inner.stalled.subscribe();
        let _ = stalled.wait_for(|stalled| !*stalled).await;
    }

    pub(crate) fn attach(
        &self,
        client: u64,
        options: &ConnectOptions,
        deliveries: tokio::sync::mpsc::UnboundedSender<Delivery>,
    ) -> Result<(), TransportError> {
        if !self.is_online() || self.is_stalled() {
            return Err(TransportError::ConnectionFailed(format!(
                "{} is not accepting connections",
                self.inner.url
            )));
        }
        self.authorize(options)?;

        self.inner.clients.insert(
            client,
            ClientEntry {
                name: options.name.clone(),
                echo: options.echo,
                deliveries,
            },
        );
        debug!(url = %self.inner.url, client, name = %options.name, "client attached");
        Ok(())
    }

    pub(crate) fn detach(&self, client: u64) {
        self.inner.clients.remove(&client);
        self.inner.subscriptions.retain(|(owner, _), _| *owner != client);
        self.inner.push_bindings.retain(|_, binding| {
            if binding.client == client {
                binding.cancel.cancel();
                false
            } else {
                true
            }
        });
        debug!(url = %self.inner.url, client, "client detached");
    }

    pub(crate) fn subscribe(
        &self,
        client: u64,
        sid: SubscriptionId,
        subject: &str,
        queue_group: Option<&str>,
    ) {
        self.inner.subscriptions.insert(
            (client, sid),
            SubscriptionEntry {
                subject: subject.to_string(),
                queue_group: queue_group.map(ToString::to_string),
            },
        );
    }

    pub(crate) fn unsubscribe(&self, client: u64, sid: SubscriptionId) {
        self.inner.subscriptions.remove(&(client, sid));
        self.inner.push_bindings.retain(|_, binding| {
            if binding.client == client && binding.sid == sid {
                binding.cancel.cancel();
                false
            } else {
                true
            }
        });
    }

    /// Routes a core publish to matching subscriptions and capturing streams.
    pub(crate) fn route(&self, origin: u64, message: &OutboundMessage) {
        let mut plain = Vec::new();
        let mut groups: HashMap<String, Vec<(u64, SubscriptionId)>> = HashMap::new();

        for entry in &self.inner.subscriptions {
            let (client, sid) = *entry.key();
            if !matches(&entry.subject, &message.subject) {
                continue;
            }
            if client == origin && !self.echo_enabled(origin) {
                continue;
            }
            match &entry.queue_group {
                Some(group) => groups.entry(group.clone()).or_default().push((client, sid)),
                None => plain.push((client, sid)),
            }
        }
        for members in groups.into_values() {
            plain.push(members[fastrand::usize(..members.len())]);
        }

        let captured = self.capture(message);

        if plain.is_empty() && !captured {
            if let Some(reply) = &message.reply {
                self.no_responders(origin, reply);
            }
            return;
        }

        for (client, sid) in plain {
            self.deliver(
                client,
                sid,
                InboundMessage {
                    subject: message.subject.clone(),
                    reply: message.reply.clone(),
                    headers: message.headers.clone(),
                    payload: message.payload.clone(),
                    ..InboundMessage::default()
                },
            );
        }
    }

    pub(crate) async fn jetstream_publish(
        &self,
        subject: &str,
        headers: Option<Headers>,
        payload: Bytes,
    ) -> Result<PublishAck, TransportError> {
        self.jetstream_delay().await?;
        let mut ack = self
            .inner
            .store
            .lock()
            .store(subject, headers, payload, Instant::now())?;
        ack.domain = self.inner.options.domain.clone().unwrap_or_default();
        if !ack.duplicate {
            self.inner.stored.notify_waiters();
        }
        Ok(ack)
    }

    pub(crate) async fn stream_by_subject(&self, subject: &str) -> Result<String, TransportError> {
        self.jetstream_delay().await?;
        self.inner
            .store
            .lock()
            .stream_for_subject(subject)
            .map(ToString::to_string)
            .ok_or_else(|| TransportError::StreamNotFound(format!("no stream captures `{subject}`")))
    }

    pub(crate) async fn consumer_exists(
        &self,
        stream: &str,
        consumer: &str,
    ) -> Result<bool, TransportError> {
        self.jetstream_delay().await?;
        self.inner.store.lock().consumer_exists(stream, consumer)
    }

    pub(crate) async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        batch: usize,
        timeout: Duration,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        let deadline = deadline_after(timeout);
        self.jetstream_delay().await?;

        loop {
            let notified = self.inner.stored.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (taken, next_due) = {
                let mut store = self.inner.store.lock();
                let taken = store.take(stream, consumer, batch, Instant::now())?;
                (taken, store.next_due(stream, consumer))
            };
            if !taken.is_empty() {
                return Ok(taken.into_iter().map(|d| self.wrap(d)).collect());
            }

            let wake_at = next_due.map_or(deadline, |due| due.min(deadline));
            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(wake_at) => {
                    if Instant::now() >= deadline {
                        return Ok(Vec::new());
                    }
                }
            }
        }
    }

    /// Binds a client subscription to a durable consumer and starts pushing.
    pub(crate) async fn bind_push(
        &self,
        client: u64,
        sid: SubscriptionId,
        stream: &str,
        consumer: &str,
    ) -> Result<(), TransportError> {
        self.jetstream_delay().await?;
        if !self.inner.store.lock().consumer_exists(stream, consumer)? {
            return Err(TransportError::ConsumerNotFound {
                stream: stream.to_string(),
                consumer: consumer.to_string(),
            });
        }

        let key = (stream.to_string(), consumer.to_string());
        if self.inner.push_bindings.contains_key(&key) {
            return Err(TransportError::Protocol(format!(
                "consumer `{consumer}` is already bound to a subscription"
            )));
        }
        let cancel = CancellationToken::new();
        self.inner.push_bindings.insert(
            key,
            PushBinding {
                client,
                sid,
                cancel: cancel.clone(),
            },
        );

        let server = self.clone();
        let (stream, consumer) = (stream.to_string(), consumer.to_string());
        tokio::spawn(async move {
            server.push_loop(client, sid, &stream, &consumer, cancel).await;
        });
        Ok(())
    }

    async fn push_loop(
        &self,
        client: u64,
        sid: SubscriptionId,
        stream: &str,
        consumer: &str,
        cancel: CancellationToken,
    ) {
        debug!(stream, consumer, sid, "push delivery started");
        loop {
            let notified = self.inner.stored.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (taken, next_due) = {
                let mut store = self.inner.store.lock();
                match store.take(stream, consumer, 256, Instant::now()) {
                    Ok(taken) => (taken, store.next_due(stream, consumer)),
                    Err(error) => {
                        warn!(stream, consumer, %error, "push delivery stopped");
                        return;
                    }
                }
            };
            for delivery in taken {
                let message = self.wrap(delivery);
                if !self.deliver(client, sid, message) {
                    return;
                }
            }

            let wake_at = next_due.unwrap_or_else(|| deadline_after(Duration::from_secs(3600)));
            tokio::select! {
                () = cancel.cancelled() => break,
                () = &mut notified => {}
                () = tokio::time::sleep_until(wake_at) => {}
            }
        }
        debug!(stream, consumer, sid, "push delivery stopped");
    }

    pub(crate) fn acknowledge(
        &self,
        stream: &str,
        consumer: &str,
        sequence: u64,
        kind: AckKind,
    ) -> Result<(), TransportError> {
        if !self.is_online() {
            return Err(TransportError::NotConnected);
        }
        self.inner
            .store
            .lock()
            .acknowledge(stream, consumer, sequence, kind, Instant::now())?;
        if matches!(kind, AckKind::Nak(_)) {
            self.inner.stored.notify_waiters();
        }
        Ok(())
    }

    pub(crate) fn check_jetstream(&self, domain: Option<&str>) -> Result<(), TransportError> {
        if self.inner.options.disable_jetstream {
            return Err(TransportError::Protocol("jetstream not enabled".to_string()));
        }
        match domain {
            Some(domain) if self.inner.options.domain.as_deref() != Some(domain) => Err(
                TransportError::Protocol(format!("no jetstream service for domain `{domain}`")),
            ),
            _ => Ok(()),
        }
    }

    async fn jetstream_delay(&self) -> Result<(), TransportError> {
        let latency = *self.inner.jetstream_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.is_online() {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn capture(&self, message: &OutboundMessage) -> bool {
        let mut store = self.inner.store.lock();
        if store.stream_for_subject(&message.subject).is_none() {
            return false;
        }
        match store.store(
            &message.subject,
            message.headers.clone(),
            message.payload.clone(),
            Instant::now(),
        ) {
            Ok(ack) if !ack.duplicate => self.inner.stored.notify_waiters(),
            Ok(_) => {}
            Err(error) => debug!(subject = %message.subject, %error, "stream rejected core publish"),
        }
        true
    }

    fn no_responders(&self, origin: u64, reply: &str) {
        let targets: Vec<SubscriptionId> = self
            .inner
            .subscriptions
            .iter()
            .filter(|entry| entry.key().0 == origin && matches(&entry.subject, reply))
            .map(|entry| entry.key().1)
            .collect();
        for sid in targets {
            self.deliver(
                origin,
                sid,
                InboundMessage {
                    subject: reply.to_string(),
                    status: Some(NO_RESPONDERS_STATUS),
                    ..InboundMessage::default()
                },
            );
        }
    }

    fn echo_enabled(&self, client: u64) -> bool {
        self.inner.clients.get(&client).is_none_or(|c| c.echo)
    }

    fn deliver(&self, client: u64, sid: SubscriptionId, message: InboundMessage) -> bool {
        self.inner
            .clients
            .get(&client)
            .is_some_and(|entry| entry.deliveries.send(Delivery { sid, message }).is_ok())
    }

    fn wrap(&self, delivery: ConsumerDelivery) -> InboundMessage {
        let reply = format!(
            "$JS.ACK.{}.{}.{}.{}",
            delivery.stream, delivery.consumer, delivery.deliveries, delivery.sequence
        );
        InboundMessage {
            subject: delivery.subject,
            reply: Some(reply),
            headers: delivery.headers,
            payload: delivery.payload,
            status: None,
            acker: Some(Arc::new(MemoryAcker {
                server: self.clone(),
                stream: delivery.stream,
                consumer: delivery.consumer,
                sequence: delivery.sequence,
            })),
        }
    }

    fn authorize(&self, options: &ConnectOptions) -> Result<(), TransportError> {
        let accepted = match &self.inner.options.auth {
            None => true,
            Some(Auth::UserPassword { user, password }) => {
                options.user.as_ref() == Some(user) && options.password.as_ref() == Some(password)
            }
            Some(Auth::Token(token)) => options.token.as_ref() == Some(token),
        };
        if accepted {
            Ok(())
        } else {
            warn!(url = %self.inner.url, name = %options.name, "rejected client credentials");
            Err(TransportError::AuthorizationViolation(
                "credentials rejected".to_string(),
            ))
        }
    }
}

/// Allocates the id a connection keeps across reconnects.
pub(crate) fn next_client_id() -> u64 {
    NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Stand-in for deadlines too far out to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `timeout` from now, capped so huge timeouts wait instead of overflowing.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout.min(FAR_FUTURE))
        .unwrap_or(now)
}

/// Normalised registry key for a server URL.
pub(crate) fn registry_key(url: &str) -> Result<String, TransportError> {
    Url::parse(url)
        .map(|u| u.to_string())
        .map_err(|e| TransportError::InvalidOption(format!("invalid server url `{url}`: {e}")))
}

#[derive(Debug)]
struct MemoryAcker {
    server: MemoryServer,
    stream: String,
    consumer: String,
    sequence: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn acknowledge(&self, kind: AckKind) -> Result<(), TransportError> {
        debug!(stream = %self.stream, consumer = %self.consumer, sequence = self.sequence, ?kind, "acknowledge");
        self.server
            .acknowledge(&self.stream, &self.consumer, self.sequence, kind)
    }
}
