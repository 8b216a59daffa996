//! Integration tests for the memory transport

use std::time::Duration;

use bytes::Bytes;
use courier_transport::{
    AckKind, ConnectOptions, Connector, Delivery, Inbound, JetStreamOptions, OutboundMessage,
    PublishOptions, Transport, TransportError, TransportEvent,
};
use courier_transport_memory::{ConsumerConfig, MemoryConnector, MemoryServer, ServerOptions, StreamConfig};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::info;

struct Client {
    transport: Arc<dyn Transport>,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

async fn connect(options: ConnectOptions) -> Client {
    let (deliveries_tx, deliveries) = mpsc::unbounded_channel();
    let (events_tx, events) = mpsc::unbounded_channel();
    let transport = MemoryConnector
        .connect(
            &options,
            Inbound {
                deliveries: deliveries_tx,
                events: events_tx,
            },
        )
        .await
        .expect("Failed to connect");

    Client {
        transport,
        deliveries,
        events,
    }
}

fn options(url: &str) -> ConnectOptions {
    ConnectOptions {
        servers: vec![url.to_string()],
        reconnect_wait: Duration::from_millis(20),
        ..ConnectOptions::default()
    }
}

fn order(n: u32) -> OutboundMessage {
    OutboundMessage {
        subject: "orders.new".to_string(),
        payload: Bytes::from(n.to_string()),
        ..OutboundMessage::default()
    }
}

fn orders_server(url: &str, ack_wait: Duration) -> MemoryServer {
    let server = MemoryServer::start(url, ServerOptions::default()).expect("Failed to start");
    server
        .add_stream(StreamConfig::new("ORDERS", ["orders.>"]))
        .unwrap();
    server
        .add_consumer("ORDERS", ConsumerConfig::new("worker").with_ack_wait(ack_wait))
        .unwrap();
    server
}

#[tokio::test]
async fn test_fetch_returns_partial_batch() {
    let _ = tracing_subscriber::fmt::try_init();

    let _server = orders_server("memory://fetch-partial", Duration::from_secs(30));
    let client = connect(options("memory://fetch-partial")).await;
    let js = client.transport.jetstream(&JetStreamOptions::default()).unwrap();

    for n in 0..3 {
        js.publish(order(n), &PublishOptions::default(), Duration::from_secs(1))
            .await
            .unwrap();
    }

    let batch = js
        .fetch("orders.>", "ORDERS", "worker", 10, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(batch.len(), 3);
    assert!(batch.iter().all(|m| m.acker.is_some()));

    let empty = js
        .fetch("orders.>", "ORDERS", "worker", 10, Duration::from_millis(50))
        .await
        .unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
async fn test_fetch_accepts_unbounded_timeout() {
    let _server = orders_server("memory://fetch-unbounded", Duration::from_secs(30));
    let client = connect(options("memory://fetch-unbounded")).await;
    let js = client.transport.jetstream(&JetStreamOptions::default()).unwrap();

    js.publish(order(1), &PublishOptions::default(), Duration::from_secs(1))
        .await
        .unwrap();

    let batch = js
        .fetch("orders.>", "ORDERS", "worker", 1, Duration::MAX)
        .await
        .unwrap();
    assert_eq!(batch.len(), 1);
}

#[tokio::test]
async fn test_verbose_mode_rejected() {
    let _server = MemoryServer::start("memory://verbose", ServerOptions::default()).unwrap();
    let (deliveries, _deliveries_rx) = mpsc::unbounded_channel();
    let (events, _events_rx) = mpsc::unbounded_channel();

    let result = MemoryConnector
        .connect(
            &ConnectOptions {
                verbose: true,
                ..options("memory://verbose")
            },
            Inbound { deliveries, events },
        )
        .await;
    assert!(matches!(result, Err(TransportError::InvalidOption(_))));
}

#[tokio::test]
async fn test_fetch_wakes_on_publish() {
    let _ = tracing_subscriber::fmt::try_init();

    let _server = orders_server("memory://fetch-wake", Duration::from_secs(30));
    let client = connect(options("memory://fetch-wake")).await;
    let js = client.transport.jetstream(&JetStreamOptions::default()).unwrap();

    let publisher = Arc::clone(&js);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        publisher
            .publish(order(1), &PublishOptions::default(), Duration::from_secs(1))
            .await
            .unwrap();
    });

    let batch = js
        .fetch("orders.>", "ORDERS", "worker", 5, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(batch.len(), 1);
}

#[tokio::test]
async fn test_push_consumer_redelivers_unacked() {
    let _ = tracing_subscriber::fmt::try_init();

    let server = orders_server("memory://push-redelivery", Duration::from_millis(100));
    let mut client = connect(options("memory://push-redelivery")).await;
    let js = client.transport.jetstream(&JetStreamOptions::default()).unwrap();

    js.subscribe(7, "orders.>", "ORDERS", "worker").await.unwrap();
    js.publish(order(1), &PublishOptions::default(), Duration::from_secs(1))
        .await
        .unwrap();

    let first = timeout(Duration::from_secs(1), client.deliveries.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.sid, 7);
    info!("first delivery received, not acknowledging");

    let second = timeout(Duration::from_secs(1), client.deliveries.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.message.payload, first.message.payload);

    second
        .message
        .acker
        .unwrap()
        .acknowledge(AckKind::Ack)
        .await
        .unwrap();
    let info = server.consumer_info("ORDERS", "worker").unwrap();
    assert_eq!(info.ack_pending, 0);
    assert!(info.redelivered >= 1);
}

#[tokio::test]
async fn test_push_binding_requires_consumer() {
    let _server = orders_server("memory://push-missing", Duration::from_secs(30));
    let client = connect(options("memory://push-missing")).await;
    let js = client.transport.jetstream(&JetStreamOptions::default()).unwrap();

    let result = js.subscribe(1, "orders.>", "ORDERS", "nobody").await;
    assert!(matches!(result, Err(TransportError::ConsumerNotFound { .. })));

    let result = js.subscribe(2, "orders.>", "MISSING", "worker").await;
    assert!(matches!(result, Err(TransportError::StreamNotFound(_))));
}

#[tokio::test]
async fn test_reconnect_restores_subscriptions() {
    let _ = tracing_subscriber::fmt::try_init();

    let server = MemoryServer::start("memory://restart", ServerOptions::default()).unwrap();
    let mut client = connect(options("memory://restart")).await;
    client.transport.subscribe(1, "greet", None).await.unwrap();

    server.shutdown();
    assert_eq!(client.events.recv().await, Some(TransportEvent::Disconnected));
    assert_eq!(
        client.events.recv().await,
        Some(TransportEvent::Reconnecting { attempt: 1 })
    );

    server.resume();
    loop {
        match client.events.recv().await {
            Some(TransportEvent::Reconnected { server: url }) => {
                assert_eq!(url, "memory://restart");
                break;
            }
            Some(TransportEvent::Reconnecting { .. }) => {}
            other => panic!("unexpected event {other:?}"),
        }
    }

    client
        .transport
        .publish(OutboundMessage {
            subject: "greet".to_string(),
            payload: Bytes::from("again"),
            ..OutboundMessage::default()
        })
        .await
        .unwrap();
    let delivery = client.deliveries.recv().await.unwrap();
    assert_eq!(delivery.message.payload, Bytes::from("again"));
}

#[tokio::test]
async fn test_reconnect_gives_up_after_max_attempts() {
    let _ = tracing_subscriber::fmt::try_init();

    let server = MemoryServer::start("memory://gone", ServerOptions::default()).unwrap();
    let mut client = connect(ConnectOptions {
        max_reconnect: Some(2),
        ..options("memory://gone")
    })
    .await;

    server.shutdown();
    let mut seen = Vec::new();
    while let Some(event) = client.events.recv().await {
        let closed = event == TransportEvent::Closed;
        seen.push(event);
        if closed {
            break;
        }
    }

    assert_eq!(
        seen,
        vec![
            TransportEvent::Disconnected,
            TransportEvent::Reconnecting { attempt: 1 },
            TransportEvent::Reconnecting { attempt: 2 },
            TransportEvent::Closed,
        ]
    );
    assert!(matches!(
        client.transport.flush(Duration::from_millis(10)).await,
        Err(TransportError::Closed)
    ));
}

#[tokio::test]
async fn test_failover_to_second_server() {
    let _ = tracing_subscriber::fmt::try_init();

    let first = MemoryServer::start("memory://primary", ServerOptions::default()).unwrap();
    let _second = MemoryServer::start("memory://secondary", ServerOptions::default()).unwrap();
    first.shutdown();

    let client = connect(ConnectOptions {
        servers: vec!["memory://primary".to_string(), "memory://secondary".to_string()],
        randomize: false,
        ..ConnectOptions::default()
    })
    .await;

    assert_eq!(
        client.transport.connected_server().as_deref(),
        Some("memory://secondary")
    );
}
