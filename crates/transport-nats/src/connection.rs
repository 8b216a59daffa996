use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_nats::{Client, Event, ServerAddr};
use async_trait::async_trait;
use courier_transport::{
    ConnectOptions, Connector, Delivery, Inbound, JetStreamOptions, JetStreamTransport,
    OutboundMessage, SubscriptionId, Transport, TransportError, TransportEvent,
};
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::convert;
use crate::jetstream::NatsJetStream;

/// Ping budget `async-nats` uses internally.
const NATS_MAX_PINGS_OUTSTANDING: u32 = 2;

/// How long `close` waits for the client to drain.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Connects to NATS servers with `async-nats`.
#[derive(Clone, Copy, Debug, Default)]
pub struct NatsConnector;

#[async_trait]
impl Connector for NatsConnector {
    #[instrument(skip_all, fields(name = %options.name))]
    async fn connect(
        &self,
        options: &ConnectOptions,
        inbound: Inbound,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        check_supported(options)?;

        let servers = options
            .server_urls()?
            .iter()
            .map(|url| {
                url.as_str().parse::<ServerAddr>().map_err(|e| {
                    TransportError::InvalidOption(format!("invalid server address `{url}`: {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let link = Arc::new(Link::default());
        let client = nats_options(options, Arc::clone(&link), inbound.events.clone())
            .connect(servers.as_slice())
            .await
            .map_err(|e| convert::connect_error(&e))?;
        *link.client.lock() = Some(client.clone());
        link.connected.store(true, Ordering::Release);

        let shared = Arc::new(Shared {
            client,
            inbound,
            forwarders: DashMap::new(),
            closed: AtomicBool::new(false),
        });
        info!(server = ?server_address(&shared.client), "nats connection established");
        Ok(Arc::new(NatsTransport { shared, link }))
    }
}

fn check_supported(options: &ConnectOptions) -> Result<(), TransportError> {
    if options.verbose {
        return Err(TransportError::InvalidOption(
            "verbose mode is not supported by the nats transport".to_string(),
        ));
    }
    if options.pedantic {
        return Err(TransportError::InvalidOption(
            "pedantic mode is not supported by the nats transport".to_string(),
        ));
    }
    if options.max_pings_outstanding != NATS_MAX_PINGS_OUTSTANDING {
        return Err(TransportError::InvalidOption(format!(
            "the nats transport always allows {NATS_MAX_PINGS_OUTSTANDING} outstanding pings"
        )));
    }
    if let Some(url) = options
        .server_urls()?
        .iter()
        .find(|url| !matches!(url.scheme(), "nats" | "tls"))
    {
        return Err(TransportError::InvalidOption(format!(
            "the nats transport cannot reach `{url}`"
        )));
    }
    Ok(())
}

/// State the `async-nats` callbacks share with the transport.
#[derive(Debug, Default)]
struct Link {
    /// Set once the initial connect succeeded.
    connected: AtomicBool,
    /// Set between a disconnect and the next successful connect.
    lost: AtomicBool,
    closed: AtomicBool,
    client: Mutex<Option<Client>>,
}

impl Link {
    fn server(&self) -> String {
        self.client
            .lock()
            .as_ref()
            .and_then(server_address)
            .unwrap_or_default()
    }
}

fn nats_options(
    options: &ConnectOptions,
    link: Arc<Link>,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> async_nats::ConnectOptions {
    let mut nats = async_nats::ConnectOptions::new()
        .name(&options.name)
        .connection_timeout(options.timeout)
        .ping_interval(options.ping_interval)
        .max_reconnects(options.max_reconnect);

    if let (Some(user), Some(password)) = (&options.user, &options.password) {
        nats = nats.user_and_password(user.clone(), password.clone());
    }
    if let Some(token) = &options.token {
        nats = nats.token(token.clone());
    }
    if !options.randomize {
        nats = nats.retain_servers_order();
    }
    if !options.echo {
        nats = nats.no_echo();
    }

    let reconnect_wait = options.reconnect_wait;
    let attempts = events.clone();
    let attempt_link = Arc::clone(&link);
    nats = nats.reconnect_delay_callback(move |attempt| {
        if attempt == 0 || !attempt_link.connected.load(Ordering::Acquire) {
            return Duration::ZERO;
        }
        let _ = attempts.send(TransportEvent::Reconnecting { attempt });
        reconnect_wait
    });

    let allow_reconnect = options.allow_reconnect;
    nats.event_callback(move |event| {
        let link = Arc::clone(&link);
        let events = events.clone();
        async move {
            forward_event(&link, &events, allow_reconnect, event);
        }
    })
}

fn forward_event(
    link: &Link,
    events: &mpsc::UnboundedSender<TransportEvent>,
    allow_reconnect: bool,
    event: Event,
) {
    if link.closed.load(Ordering::Acquire) {
        return;
    }
    let forwarded = match event {
        Event::Connected if link.lost.swap(false, Ordering::AcqRel) => {
            TransportEvent::Reconnected {
                server: link.server(),
            }
        }
        Event::Disconnected => {
            warn!("nats link lost");
            link.lost.store(true, Ordering::Release);
            let _ = events.send(TransportEvent::Disconnected);
            if allow_reconnect {
                return;
            }
            TransportEvent::Closed
        }
        Event::Closed => TransportEvent::Closed,
        Event::SlowConsumer(sid) => TransportEvent::Error {
            error: TransportError::Resource(format!("slow consumer on subscription {sid}")),
            subject: None,
        },
        Event::ServerError(error) => TransportEvent::Error {
            error: convert::classify(&error.to_string()),
            subject: None,
        },
        Event::ClientError(error) => TransportEvent::Error {
            error: TransportError::Protocol(error.to_string()),
            subject: None,
        },
        other => {
            debug!(event = %other, "nats event");
            return;
        }
    };
    let _ = events.send(forwarded);
}

fn server_address(client: &Client) -> Option<String> {
    let info = client.server_info();
    (!info.host.is_empty()).then(|| format!("nats://{}:{}", info.host, info.port))
}

#[derive(Debug)]
pub(crate) struct Shared {
    pub client: Client,
    pub inbound: Inbound,
    pub forwarders: DashMap<SubscriptionId, CancellationToken>,
    pub closed: AtomicBool,
}

impl Shared {
    pub fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    /// Registers a forwarding task for `sid`, replacing any previous one.
    pub fn track(&self, sid: SubscriptionId) -> CancellationToken {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.forwarders.insert(sid, cancel.clone()) {
            previous.cancel();
        }
        cancel
    }

    pub fn deliver(&self, delivery: Delivery) -> bool {
        self.inbound.deliveries.send(delivery).is_ok()
    }
}

/// A link to a NATS server.
#[derive(Debug)]
pub struct NatsTransport {
    shared: Arc<Shared>,
    link: Arc<Link>,
}

#[async_trait]
impl Transport for NatsTransport {
    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        self.shared.ensure_open()?;
        let client = &self.shared.client;
        let OutboundMessage {
            subject,
            reply,
            headers,
            payload,
        } = message;

        let published = match (reply, headers) {
            (None, None) => client.publish(subject, payload).await,
            (None, Some(headers)) => {
                client
                    .publish_with_headers(subject, convert::to_header_map(&headers), payload)
                    .await
            }
            (Some(reply), None) => client.publish_with_reply(subject, reply, payload).await,
            (Some(reply), Some(headers)) => {
                client
                    .publish_with_reply_and_headers(
                        subject,
                        reply,
                        convert::to_header_map(&headers),
                        payload,
                    )
                    .await
            }
        };
        published.map_err(|e| convert::classify(&e.to_string()))
    }

    async fn subscribe(
        &self,
        sid: SubscriptionId,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<(), TransportError> {
        self.shared.ensure_open()?;
        let client = &self.shared.client;
        let subscriber = match queue_group {
            Some(group) => {
                client
                    .queue_subscribe(subject.to_string(), group.to_string())
                    .await
            }
            None => client.subscribe(subject.to_string()).await,
        }
        .map_err(|e| convert::classify(&e.to_string()))?;

        let cancel = self.shared.track(sid);
        tokio::spawn(forward(Arc::clone(&self.shared), sid, subscriber, cancel));
        debug!(sid, subject, ?queue_group, "subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, sid: SubscriptionId) -> Result<(), TransportError> {
        if let Some((_, cancel)) = self.shared.forwarders.remove(&sid) {
            cancel.cancel();
            debug!(sid, "unsubscribed");
        }
        Ok(())
    }

    async fn flush(&self, timeout: Duration) -> Result<(), TransportError> {
        self.shared.ensure_open()?;
        tokio::time::timeout(timeout, self.shared.client.flush())
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| convert::classify(&e.to_string()))
    }

    fn new_inbox(&self) -> String {
        self.shared.client.new_inbox()
    }

    fn connected_server(&self) -> Option<String> {
        if self.shared.closed.load(Ordering::Acquire) {
            return None;
        }
        match self.shared.client.connection_state() {
            async_nats::connection::State::Connected => server_address(&self.shared.client),
            _ => None,
        }
    }

    fn jetstream(
        &self,
        options: &JetStreamOptions,
    ) -> Result<Arc<dyn JetStreamTransport>, TransportError> {
        self.shared.ensure_open()?;
        options.validate()?;
        Ok(Arc::new(NatsJetStream::new(Arc::clone(&self.shared), options)))
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.link.closed.store(true, Ordering::Release);
        for entry in &self.shared.forwarders {
            entry.value().cancel();
        }
        self.shared.forwarders.clear();

        drain(&self.shared.client).await;
        self.link.client.lock().take();
        let _ = self.shared.inbound.events.send(TransportEvent::Closed);
        info!("nats connection closed");
    }
}

impl Drop for NatsTransport {
    fn drop(&mut self) {
        self.link.closed.store(true, Ordering::Release);
        self.link.client.lock().take();
        for entry in &self.shared.forwarders {
            entry.value().cancel();
        }
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let client = self.shared.client.clone();
                runtime.spawn(async move { drain(&client).await });
            }
        }
    }
}

/// Flushes pending publishes and shuts the client down, ending its
/// reconnect loop.
async fn drain(client: &Client) {
    match tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, client.drain()).await {
        Ok(Ok(())) => debug!("nats client drained"),
        Ok(Err(e)) => warn!(error = %convert::classify(&e.to_string()), "nats drain failed"),
        Err(_) => warn!(timeout = ?CLOSE_DRAIN_TIMEOUT, "nats drain timed out"),
    }
}

async fn forward(
    shared: Arc<Shared>,
    sid: SubscriptionId,
    mut subscriber: async_nats::Subscriber,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = subscriber.unsubscribe().await;
                break;
            }
            message = subscriber.next() => match message {
                Some(message) => {
                    let delivery = Delivery { sid, message: convert::inbound(message) };
                    if !shared.deliver(delivery) {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    debug!(sid, "subscription forwarder stopped");
}
