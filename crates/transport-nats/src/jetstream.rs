use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, consumer};
use async_trait::async_trait;
use courier_transport::{
    AckKind, Acker, Delivery, InboundMessage, JetStreamOptions, JetStreamTransport,
    OutboundMessage, PublishAck, PublishOptions, SubscriptionId, TransportError,
};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::connection::Shared;
use crate::convert;

/// JetStream API over an `async-nats` client.
#[derive(Debug)]
pub struct NatsJetStream {
    shared: Arc<Shared>,
    context: jetstream::Context,
}

impl NatsJetStream {
    pub(crate) fn new(shared: Arc<Shared>, options: &JetStreamOptions) -> Self {
        let client = shared.client.clone();
        let mut context = match &options.domain {
            Some(domain) => jetstream::with_domain(client, domain),
            None => jetstream::new(client),
        };
        context.set_timeout(options.wait);
        Self { shared, context }
    }

    async fn stream(&self, name: &str) -> Result<jetstream::stream::Stream, TransportError> {
        self.context
            .get_stream(name)
            .await
            .map_err(|e| convert::classify(&e.to_string()))
    }

    fn inbound(message: jetstream::Message) -> InboundMessage {
        let acker = message
            .message
            .reply
            .is_some()
            .then(|| Arc::new(NatsAcker::new(message.clone())) as Arc<dyn Acker>);
        InboundMessage {
            acker,
            ..convert::inbound(message.message)
        }
    }

    async fn pull(
        &self,
        consumer: &consumer::Consumer<consumer::pull::Config>,
        batch: usize,
        expires: Option<Duration>,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        let mut messages = match expires {
            Some(expires) => {
                consumer
                    .batch()
                    .max_messages(batch)
                    .expires(expires)
                    .messages()
                    .await
            }
            None => consumer.fetch().max_messages(batch).messages().await,
        }
        .map_err(|e| convert::classify(&e.to_string()))?;

        let mut fetched = Vec::with_capacity(batch);
        while let Some(message) = messages.next().await {
            match message {
                Ok(message) => fetched.push(Self::inbound(message)),
                Err(e) => {
                    let error = convert::classify(&e.to_string());
                    if fetched.is_empty() && !matches!(error, TransportError::Timeout) {
                        return Err(error);
                    }
                    debug!(error = %e, "pull request ended early");
                    break;
                }
            }
        }
        Ok(fetched)
    }
}

#[async_trait]
impl JetStreamTransport for NatsJetStream {
    async fn publish(
        &self,
        message: OutboundMessage,
        options: &PublishOptions,
        timeout: Duration,
    ) -> Result<PublishAck, TransportError> {
        self.shared.ensure_open()?;
        let headers = convert::to_header_map(&options.apply_headers(message.headers));
        let publish = async {
            self.context
                .publish_with_headers(message.subject, headers, message.payload)
                .await?
                .await
        };
        let ack = tokio::time::timeout(timeout, publish)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| convert::publish_error(&e))?;

        Ok(PublishAck {
            stream: ack.stream,
            sequence: ack.sequence,
            domain: ack.domain,
            duplicate: ack.duplicate,
        })
    }

    async fn stream_by_subject(&self, subject: &str) -> Result<String, TransportError> {
        self.shared.ensure_open()?;
        self.context
            .stream_by_subject(subject)
            .await
            .map_err(|e| match convert::classify(&e.to_string()) {
                TransportError::Protocol(reason) if reason.contains("not found") => {
                    TransportError::StreamNotFound(subject.to_string())
                }
                other => other,
            })
    }

    async fn consumer_exists(&self, stream: &str, consumer: &str) -> Result<bool, TransportError> {
        self.shared.ensure_open()?;
        let stream_handle = self.stream(stream).await?;
        match stream_handle.consumer_info(consumer).await {
            Ok(_) => Ok(true),
            Err(e) => match convert::consumer_error(stream, consumer, &e.to_string()) {
                TransportError::ConsumerNotFound { .. } => Ok(false),
                other => Err(other),
            },
        }
    }

    #[instrument(skip(self))]
    async fn subscribe(
        &self,
        sid: SubscriptionId,
        subject: &str,
        stream: &str,
        consumer: &str,
    ) -> Result<(), TransportError> {
        self.shared.ensure_open()?;
        let push = self
            .stream(stream)
            .await?
            .get_consumer::<consumer::push::Config>(consumer)
            .await
            .map_err(|e| convert::consumer_error(stream, consumer, &e.to_string()))?;
        let messages = push
            .messages()
            .await
            .map_err(|e| convert::classify(&e.to_string()))?;

        let cancel = self.shared.track(sid);
        let pump = PushPump {
            shared: Arc::clone(&self.shared),
            sid,
            cancel,
        };
        tokio::spawn(pump.run(messages));
        debug!("bound to push consumer");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fetch(
        &self,
        subject: &str,
        stream: &str,
        consumer: &str,
        batch: usize,
        timeout: Duration,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        self.shared.ensure_open()?;
        let pull = self
            .stream(stream)
            .await?
            .get_consumer::<consumer::pull::Config>(consumer)
            .await
            .map_err(|e| convert::consumer_error(stream, consumer, &e.to_string()))?;

        let ready = self.pull(&pull, batch, None).await?;
        if !ready.is_empty() {
            return Ok(ready);
        }

        // Nothing buffered: block for the first message, then take whatever
        // else is ready without waiting.
        let mut fetched = self.pull(&pull, 1, Some(timeout)).await?;
        if !fetched.is_empty() && batch > 1 {
            fetched.extend(self.pull(&pull, batch - 1, None).await?);
        }
        Ok(fetched)
    }
}

struct PushPump {
    shared: Arc<Shared>,
    sid: SubscriptionId,
    cancel: CancellationToken,
}

impl PushPump {
    async fn run(self, mut messages: consumer::push::Messages) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                message = messages.next() => match message {
                    Some(Ok(message)) => {
                        let delivery = Delivery {
                            sid: self.sid,
                            message: NatsJetStream::inbound(message),
                        };
                        if !self.shared.deliver(delivery) {
                            break;
                        }
                    }
                    Some(Err(e)) => warn!(sid = self.sid, error = %e, "push consumer error"),
                    None => break,
                },
            }
        }
        debug!(sid = self.sid, "push consumer pump stopped");
    }
}

/// Acknowledges one JetStream delivery.
struct NatsAcker {
    message: jetstream::Message,
}

impl NatsAcker {
    const fn new(message: jetstream::Message) -> Self {
        Self { message }
    }
}

impl fmt::Debug for NatsAcker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsAcker")
            .field("subject", &self.message.message.subject)
            .field("reply", &self.message.message.reply)
            .finish()
    }
}

const fn ack_kind(kind: AckKind) -> jetstream::AckKind {
    match kind {
        AckKind::Ack => jetstream::AckKind::Ack,
        AckKind::Nak(delay) => jetstream::AckKind::Nak(delay),
        AckKind::Progress => jetstream::AckKind::Progress,
        AckKind::Term => jetstream::AckKind::Term,
    }
}

#[async_trait]
impl Acker for NatsAcker {
    async fn acknowledge(&self, kind: AckKind) -> Result<(), TransportError> {
        self.message
            .ack_with(ack_kind(kind))
            .await
            .map_err(|e| convert::classify(&e.to_string()))
    }
}
