use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier_transport::subject::{is_valid_publish_subject, is_valid_subject};
use courier_transport::{
    ConnectOptions, Connector, Inbound, InboundMessage, JetStreamOptions, JetStreamTransport,
    OutboundMessage, PublishAck, PublishOptions, SubscriptionId, Transport, TransportError,
    TransportEvent,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::GLOBAL_REGISTRY;
use crate::server::{MemoryServer, next_client_id};

/// Connects to servers registered with [`MemoryServer::start`].
#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryConnector;

#[async_trait]
impl Connector for MemoryConnector {
    #[instrument(skip_all, fields(name = %options.name))]
    async fn connect(
        &self,
        options: &ConnectOptions,
        inbound: Inbound,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        if options.verbose {
            return Err(TransportError::InvalidOption(
                "verbose mode is not supported by the memory transport".to_string(),
            ));
        }
        let mut servers = options.server_urls()?;
        if options.randomize {
            fastrand::shuffle(&mut servers);
        }

        let shared = Arc::new(Shared {
            id: next_client_id(),
            options: options.clone(),
            servers,
            inbound,
            server: Mutex::new(None),
            subscriptions: DashMap::new(),
            push: DashMap::new(),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        let server = shared.pick()?;
        info!(url = %server.url(), client = shared.id, "memory connection established");
        *shared.server.lock() = Some(server.clone());

        tokio::spawn(supervise(Arc::clone(&shared), server));
        Ok(Arc::new(MemoryConnection { shared }))
    }
}

#[derive(Debug)]
struct PushBinding {
    stream: String,
    consumer: String,
}

#[derive(Debug)]
struct Shared {
    id: u64,
    options: ConnectOptions,
    servers: Vec<Url>,
    inbound: Inbound,
    server: Mutex<Option<MemoryServer>>,
    subscriptions: DashMap<SubscriptionId, (String, Option<String>)>,
    push: DashMap<SubscriptionId, PushBinding>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl Shared {
    /// Attaches to the first reachable server in list order.
    fn pick(&self) -> Result<MemoryServer, TransportError> {
        let mut last_error = TransportError::ConnectionFailed(format!(
            "no memory server reachable at {}",
            self.options.servers.join(", ")
        ));

        for url in &self.servers {
            let Some(server) = GLOBAL_REGISTRY.get(url.as_str()).map(|s| s.clone()) else {
                continue;
            };
            match server.attach(self.id, &self.options, self.inbound.deliveries.clone()) {
                Ok(()) => return Ok(server),
                Err(error @ TransportError::AuthorizationViolation(_)) => return Err(error),
                Err(error) => last_error = error,
            }
        }
        Err(last_error)
    }

    fn current(&self) -> Result<MemoryServer, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.server.lock().clone().ok_or(TransportError::NotConnected)
    }

    async fn restore(&self, server: &MemoryServer) {
        for entry in &self.subscriptions {
            let (subject, queue_group) = entry.value();
            server.subscribe(self.id, *entry.key(), subject, queue_group.as_deref());
        }

        let bindings: Vec<(SubscriptionId, String, String)> = self
            .push
            .iter()
            .map(|e| (*e.key(), e.stream.clone(), e.consumer.clone()))
            .collect();
        for (sid, stream, consumer) in bindings {
            if let Err(error) = server.bind_push(self.id, sid, &stream, &consumer).await {
                warn!(sid, %stream, %consumer, %error, "failed to restore push consumer");
                let _ = self.inbound.events.send(TransportEvent::Error {
                    error,
                    subject: None,
                });
            }
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.inbound.events.send(event);
    }
}

/// Watches the link and drives reconnection.
async fn supervise(shared: Arc<Shared>, mut server: MemoryServer) {
    loop {
        let mut online = server.online_receiver();
        let interval = shared.options.ping_interval;
        let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        let mut outstanding = 0;

        let reason = loop {
            tokio::select! {
                () = shared.cancel.cancelled() => return,
                _ = online.wait_for(|online| !*online) => break "server shut down",
                _ = ping.tick() => {
                    if server.is_stalled() {
                        outstanding += 1;
                        if outstanding > shared.options.max_pings_outstanding {
                            break "stale connection";
                        }
                    } else {
                        outstanding = 0;
                    }
                }
            }
        };

        warn!(url = %server.url(), client = shared.id, reason, "memory connection lost");
        server.detach(shared.id);
        *shared.server.lock() = None;
        shared.emit(TransportEvent::Disconnected);

        let restored = if shared.options.allow_reconnect {
            reconnect(&shared).await
        } else {
            None
        };
        match restored {
            Some(next) => server = next,
            None => {
                if !shared.cancel.is_cancelled() {
                    shared.closed.store(true, Ordering::Release);
                    shared.emit(TransportEvent::Closed);
                }
                return;
            }
        }
    }
}

async fn reconnect(shared: &Shared) -> Option<MemoryServer> {
    let mut attempt = 0;
    loop {
        if shared.options.max_reconnect.is_some_and(|max| attempt >= max) {
            warn!(client = shared.id, attempt, "reconnect attempts exhausted");
            return None;
        }
        attempt += 1;
        shared.emit(TransportEvent::Reconnecting { attempt });

        tokio::select! {
            () = shared.cancel.cancelled() => return None,
            () = tokio::time::sleep(shared.options.reconnect_wait) => {}
        }

        match shared.pick() {
            Ok(server) => {
                *shared.server.lock() = Some(server.clone());
                shared.restore(&server).await;
                info!(url = %server.url(), client = shared.id, attempt, "memory connection restored");
                shared.emit(TransportEvent::Reconnected {
                    server: server.url().to_string(),
                });
                return Some(server);
            }
            Err(error) => debug!(client = shared.id, attempt, %error, "reconnect attempt failed"),
        }
    }
}

/// A client link to a [`MemoryServer`].
#[derive(Debug)]
pub struct MemoryConnection {
    shared: Arc<Shared>,
}

#[async_trait]
impl Transport for MemoryConnection {
    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        if self.shared.options.pedantic && !is_valid_publish_subject(&message.subject) {
            return Err(TransportError::InvalidSubject(message.subject));
        }
        let server = self.shared.current()?;
        server.route(self.shared.id, &message);
        Ok(())
    }

    async fn subscribe(
        &self,
        sid: SubscriptionId,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<(), TransportError> {
        if !is_valid_subject(subject) {
            return Err(TransportError::InvalidSubject(subject.to_string()));
        }
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        self.shared.subscriptions.insert(
            sid,
            (subject.to_string(), queue_group.map(ToString::to_string)),
        );
        // While reconnecting the registration is replayed once the link is back.
        let server = self.shared.server.lock().clone();
        if let Some(server) = server {
            server.subscribe(self.shared.id, sid, subject, queue_group);
        }
        debug!(sid, subject, ?queue_group, "subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, sid: SubscriptionId) -> Result<(), TransportError> {
        self.shared.subscriptions.remove(&sid);
        self.shared.push.remove(&sid);
        let server = self.shared.server.lock().clone();
        if let Some(server) = server {
            server.unsubscribe(self.shared.id, sid);
        }
        debug!(sid, "unsubscribed");
        Ok(())
    }

    async fn flush(&self, timeout: Duration) -> Result<(), TransportError> {
        let server = self.shared.current()?;
        if server.is_stalled() {
            return tokio::time::timeout(timeout, server.wait_responsive())
                .await
                .map_err(|_| TransportError::Timeout);
        }
        Ok(())
    }

    fn connected_server(&self) -> Option<String> {
        self.shared
            .server
            .lock()
            .as_ref()
            .map(|server| server.url().to_string())
    }

    fn jetstream(
        &self,
        options: &JetStreamOptions,
    ) -> Result<Arc<dyn JetStreamTransport>, TransportError> {
        options.validate()?;
        Ok(Arc::new(MemoryJetStream {
            shared: Arc::clone(&self.shared),
            domain: options.domain.clone(),
        }))
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.cancel.cancel();
        let server = self.shared.server.lock().take();
        if let Some(server) = server {
            server.detach(self.shared.id);
        }
        self.shared.subscriptions.clear();
        self.shared.push.clear();
        self.shared.emit(TransportEvent::Closed);
        info!(client = self.shared.id, "memory connection closed");
    }
}

/// JetStream API over a [`MemoryConnection`].
#[derive(Debug)]
pub struct MemoryJetStream {
    shared: Arc<Shared>,
    domain: Option<String>,
}

impl MemoryJetStream {
    fn server(&self) -> Result<MemoryServer, TransportError> {
        let server = self.shared.current()?;
        server.check_jetstream(self.domain.as_deref())?;
        Ok(server)
    }
}

#[async_trait]
impl JetStreamTransport for MemoryJetStream {
    async fn publish(
        &self,
        message: OutboundMessage,
        options: &PublishOptions,
        timeout: Duration,
    ) -> Result<PublishAck, TransportError> {
        options.validate()?;
        let server = self.server()?;
        let headers = options.apply_headers(message.headers);

        tokio::time::timeout(
            timeout,
            server.jetstream_publish(&message.subject, Some(headers), message.payload),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
    }

    async fn stream_by_subject(&self, subject: &str) -> Result<String, TransportError> {
        self.server()?.stream_by_subject(subject).await
    }

    async fn consumer_exists(&self, stream: &str, consumer: &str) -> Result<bool, TransportError> {
        self.server()?.consumer_exists(stream, consumer).await
    }

    async fn subscribe(
        &self,
        sid: SubscriptionId,
        subject: &str,
        stream: &str,
        consumer: &str,
    ) -> Result<(), TransportError> {
        let server = self.server()?;
        self.shared.push.insert(
            sid,
            PushBinding {
                stream: stream.to_string(),
                consumer: consumer.to_string(),
            },
        );

        if let Err(error) = server.bind_push(self.shared.id, sid, stream, consumer).await {
            self.shared.push.remove(&sid);
            return Err(error);
        }
        debug!(sid, subject, stream, consumer, "bound push consumer");
        Ok(())
    }

    async fn fetch(
        &self,
        subject: &str,
        stream: &str,
        consumer: &str,
        batch: usize,
        timeout: Duration,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        if batch == 0 {
            return Err(TransportError::InvalidOption(
                "fetch batch must be at least 1".to_string(),
            ));
        }
        let messages = self
            .server()?
            .fetch(stream, consumer, batch, timeout)
            .await?;
        debug!(subject, stream, consumer, batch, fetched = messages.len(), "fetch complete");
        Ok(messages)
    }
}
