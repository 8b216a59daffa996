#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use courier_client::{ConnectOptions, Connection, Message, Status};
use courier_transport_memory::{
    ConsumerConfig, MemoryConnector, MemoryServer, ServerOptions, StreamConfig,
};
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn start_server(url: &str) -> MemoryServer {
    let _ = tracing_subscriber::fmt::try_init();
    MemoryServer::start(url, ServerOptions::default()).expect("Failed to start server")
}

/// A server with an `ORDERS` stream on `orders.>`, a pull consumer `pull` and
/// a push consumer `push` using `ack_wait`.
pub fn orders_server(url: &str, ack_wait: Duration) -> MemoryServer {
    let server = start_server(url);
    server
        .add_stream(StreamConfig::new("ORDERS", ["orders.>"]))
        .expect("Failed to add stream");
    server
        .add_consumer("ORDERS", ConsumerConfig::new("pull").with_ack_wait(ack_wait))
        .expect("Failed to add consumer");
    server
        .add_consumer("ORDERS", ConsumerConfig::new("push").with_ack_wait(ack_wait))
        .expect("Failed to add consumer");
    server
}

pub fn options(url: &str) -> ConnectOptions {
    ConnectOptions {
        servers: vec![url.to_string()],
        reconnect_wait: Duration::from_millis(20),
        ..ConnectOptions::default()
    }
}

pub async fn connect(url: &str) -> Connection {
    Connection::connect(&MemoryConnector, options(url))
        .await
        .expect("Failed to connect")
}

pub async fn recv(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("Timed out waiting for a message")
        .expect("Channel closed")
}

/// Asserts nothing arrives within a short window.
pub async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Message>) {
    let received = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
    assert!(received.is_err(), "Unexpected message: {received:?}");
}

pub async fn wait_for_status(connection: &Connection, status: Status) {
    let mut changes = connection.status_changes();
    tokio::time::timeout(WAIT, changes.wait_for(|current| *current == status))
        .await
        .unwrap_or_else(|_| panic!("Timed out waiting for status {status}"))
        .expect("Status channel closed");
}

pub async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Condition not met in time");
}
