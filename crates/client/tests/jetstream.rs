//! JetStream publishing and consumption against the memory transport

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use common::{assert_quiet, connect, orders_server, recv};
use courier_client::{Error, JetStreamEvent, JetStreamOptions, Message, PublishOptions};
use tokio::sync::mpsc;

const LONG_ACK_WAIT: Duration = Duration::from_secs(30);

fn order(n: u32) -> Message {
    Message::new(format!("orders.{n}"), n.to_string())
}

#[tokio::test]
async fn test_publish_returns_ack() {
    let server = orders_server("memory://js-publish", LONG_ACK_WAIT);
    let connection = connect("memory://js-publish").await;
    let js = connection.jetstream(JetStreamOptions::default()).unwrap();

    let first = js.publish(order(1), &PublishOptions::default()).await.unwrap();
    let second = js.publish(order(2), &PublishOptions::default()).await.unwrap();

    assert_eq!(first.stream, "ORDERS");
    assert_eq!(first.sequence, 1);
    assert_eq!(second.sequence, 2);
    assert!(!second.duplicate);
    assert_eq!(server.stream_info("ORDERS").unwrap().messages, 2);

    connection.close().await;
}

#[tokio::test]
async fn test_duplicate_msg_id_is_stored_once() {
    let server = orders_server("memory://js-dedup", LONG_ACK_WAIT);
    let connection = connect("memory://js-dedup").await;
    let js = connection.jetstream(JetStreamOptions::default()).unwrap();
    let options = PublishOptions::with_msg_id("order-1");

    let first = js.publish(order(1), &options).await.unwrap();
    let second = js.publish(order(1), &options).await.unwrap();

    assert!(!first.duplicate);
    assert!(second.duplicate);
    assert_eq!(second.sequence, first.sequence);
    assert_eq!(server.stream_info("ORDERS").unwrap().messages, 1);

    connection.close().await;
}

#[tokio::test]
async fn test_expectations_guard_appends() {
    let server = orders_server("memory://js-expectations", LONG_ACK_WAIT);
    let connection = connect("memory://js-expectations").await;
    let js = connection.jetstream(JetStreamOptions::default()).unwrap();

    js.publish(order(1), &PublishOptions::default()).await.unwrap();

    let wrong_sequence = PublishOptions {
        expected_last_sequence: Some(7),
        ..PublishOptions::default()
    };
    assert_matches!(
        js.publish(order(2), &wrong_sequence).await,
        Err(Error::StreamStateConflict(_))
    );

    let wrong_stream = PublishOptions {
        expected_stream: Some("PAYMENTS".to_string()),
        ..PublishOptions::default()
    };
    assert_matches!(
        js.publish(order(2), &wrong_stream).await,
        Err(Error::StreamStateConflict(_))
    );

    let already_there = PublishOptions {
        expect_no_message: true,
        ..PublishOptions::default()
    };
    assert_matches!(
        js.publish(order(1), &already_there).await,
        Err(Error::StreamStateConflict(_))
    );
    assert_eq!(server.stream_info("ORDERS").unwrap().messages, 1);

    let right_sequence = PublishOptions {
        expected_last_sequence: Some(1),
        ..PublishOptions::default()
    };
    let ack = js.publish(order(2), &right_sequence).await.unwrap();
    assert_eq!(ack.sequence, 2);

    let contradicting = PublishOptions {
        expect_no_message: true,
        expected_last_subject_sequence: Some(3),
        ..PublishOptions::default()
    };
    assert_matches!(
        js.publish(order(3), &contradicting).await,
        Err(Error::Configuration(_))
    );

    connection.close().await;
}

#[tokio::test]
async fn test_last_msg_id_and_subject_sequence_guards() {
    let server = orders_server("memory://js-chained-guards", LONG_ACK_WAIT);
    let connection = connect("memory://js-chained-guards").await;
    let js = connection.jetstream(JetStreamOptions::default()).unwrap();

    js.publish(order(1), &PublishOptions::with_msg_id("first"))
        .await
        .unwrap();

    let stale_id = PublishOptions {
        expected_last_msg_id: Some("elsewhere".to_string()),
        ..PublishOptions::default()
    };
    assert_matches!(
        js.publish(order(2), &stale_id).await,
        Err(Error::StreamStateConflict(_))
    );

    let chained = PublishOptions {
        msg_id: Some("second".to_string()),
        expected_last_msg_id: Some("first".to_string()),
        ..PublishOptions::default()
    };
    let ack = js.publish(order(2), &chained).await.unwrap();
    assert_eq!(ack.sequence, 2);

    let stale_subject = PublishOptions {
        expected_last_subject_sequence: Some(1),
        ..PublishOptions::default()
    };
    assert_matches!(
        js.publish(order(2), &stale_subject).await,
        Err(Error::StreamStateConflict(_))
    );

    let current_subject = PublishOptions {
        expected_last_subject_sequence: Some(2),
        ..PublishOptions::default()
    };
    let ack = js.publish(order(2), &current_subject).await.unwrap();
    assert_eq!(ack.sequence, 3);
    assert_eq!(server.stream_info("ORDERS").unwrap().messages, 3);

    connection.close().await;
}

#[tokio::test]
async fn test_unknown_subject_has_no_stream() {
    let _server = orders_server("memory://js-no-stream", LONG_ACK_WAIT);
    let connection = connect("memory://js-no-stream").await;
    let js = connection.jetstream(JetStreamOptions::default()).unwrap();

    assert_matches!(
        js.publish(Message::new("payments.1", "1"), &PublishOptions::default())
            .await,
        Err(Error::StreamNotFound(_))
    );
    assert_matches!(
        js.stream_by_subject("payments.1").await,
        Err(Error::StreamNotFound(_))
    );
    assert_eq!(js.stream_by_subject("orders.9").await.unwrap(), "ORDERS");

    connection.close().await;
}

#[tokio::test]
async fn test_async_publish_and_wait() {
    let server = orders_server("memory://js-async", LONG_ACK_WAIT);
    let connection = connect("memory://js-async").await;
    let js = connection.jetstream(JetStreamOptions::default()).unwrap();

    for n in 0..10 {
        js.async_publish(order(n), PublishOptions::default()).unwrap();
    }
    js.wait_for_publish_completed(Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(js.pending_publishes(), 0);
    assert_eq!(server.stream_info("ORDERS").unwrap().messages, 10);

    connection.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_async_publishes_are_stored_in_call_order() {
    let _server = orders_server("memory://js-async-order", LONG_ACK_WAIT);
    let connection = connect("memory://js-async-order").await;
    let js = connection.jetstream(JetStreamOptions::default()).unwrap();

    for n in 0..200 {
        js.async_publish(order(n), PublishOptions::default()).unwrap();
    }
    js.wait_for_publish_completed(Duration::from_secs(5))
        .await
        .unwrap();

    let pull = js.pull_subscribe("orders.>", "ORDERS", "pull").await.unwrap();
    let batch = pull.fetch(200, Duration::from_secs(1)).await.unwrap();
    let stored: Vec<String> = batch
        .iter()
        .map(|m| String::from_utf8_lossy(&m.payload).into_owned())
        .collect();
    let expected: Vec<String> = (0..200).map(|n| n.to_string()).collect();
    assert_eq!(stored, expected);

    connection.close().await;
}

#[tokio::test]
async fn test_async_publish_failure_is_reported() {
    let _server = orders_server("memory://js-async-failure", LONG_ACK_WAIT);
    let connection = connect("memory://js-async-failure").await;
    let js = connection.jetstream(JetStreamOptions::default()).unwrap();
    let mut events = js.events();

    js.async_publish(Message::new("payments.1", "lost"), PublishOptions::default())
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    let JetStreamEvent::PublishFailed { message, error } = event;
    assert_eq!(message.subject, "payments.1");
    assert_eq!(message.payload, "lost");
    assert_matches!(error, Error::StreamNotFound(_));

    js.wait_for_publish_completed(Duration::from_secs(1))
        .await
        .unwrap();

    connection.close().await;
}

#[tokio::test]
async fn test_wait_times_out_with_pending_count() {
    let server = orders_server("memory://js-pending", LONG_ACK_WAIT);
    let connection = connect("memory://js-pending").await;
    let js = connection.jetstream(JetStreamOptions::default()).unwrap();
    server.set_jetstream_latency(Duration::from_millis(300));

    for n in 0..3 {
        js.async_publish(order(n), PublishOptions::default()).unwrap();
    }
    let early = js.wait_for_publish_completed(Duration::from_millis(20)).await;
    assert_matches!(early, Err(Error::PublishesPending(3)));
    assert!(early.unwrap_err().is_recoverable());

    // The publishes kept running.
    js.wait_for_publish_completed(Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(server.stream_info("ORDERS").unwrap().messages, 3);

    connection.close().await;
}

#[tokio::test]
async fn test_fetch_returns_what_is_available() {
    let _server = orders_server("memory://js-fetch", LONG_ACK_WAIT);
    let connection = connect("memory://js-fetch").await;
    let js = connection.jetstream(JetStreamOptions::default()).unwrap();

    for n in 0..3 {
        js.publish(order(n), &PublishOptions::default()).await.unwrap();
    }

    let pull = js.pull_subscribe("orders.>", "ORDERS", "pull").await.unwrap();
    let batch = pull.fetch(10, Duration::from_millis(200)).await.unwrap();
    assert_eq!(batch.len(), 3);
    for (n, message) in batch.iter().enumerate() {
        assert_eq!(message.payload, n.to_string());
        assert!(message.is_acknowledgeable());
        message.ack().await.unwrap();
    }

    let empty = pull.fetch(10, Duration::from_millis(100)).await.unwrap();
    assert!(empty.is_empty());

    assert_matches!(
        pull.fetch(0, Duration::from_millis(100)).await,
        Err(Error::Configuration(_))
    );

    connection.close().await;
}

#[tokio::test]
async fn test_fetch_with_unbounded_timeout() {
    let _server = orders_server("memory://js-fetch-forever", LONG_ACK_WAIT);
    let connection = connect("memory://js-fetch-forever").await;
    let js = connection.jetstream(JetStreamOptions::default()).unwrap();
    js.publish(order(1), &PublishOptions::default()).await.unwrap();

    let pull = js.pull_subscribe("orders.>", "ORDERS", "pull").await.unwrap();
    let batch = pull.fetch(1, Duration::MAX).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].payload, "1");
    batch[0].ack().await.unwrap();

    connection.close().await;
}

#[tokio::test]
async fn test_pull_subscribe_checks_consumer() {
    let _server = orders_server("memory://js-missing-consumer", LONG_ACK_WAIT);
    let connection = connect("memory://js-missing-consumer").await;
    let js = connection.jetstream(JetStreamOptions::default()).unwrap();

    let missing = js.pull_subscribe("orders.>", "ORDERS", "ghost").await;
    assert_matches!(
        missing,
        Err(Error::ConsumerNotFound { stream, consumer }) if stream == "ORDERS" && consumer == "ghost"
    );

    // An empty stream name is resolved from the subject.
    let pull = js.pull_subscribe("orders.>", "", "pull").await.unwrap();
    assert_eq!(pull.stream(), "ORDERS");
    assert_eq!(pull.consumer(), "pull");

    connection.close().await;
}

#[tokio::test]
async fn test_nak_and_term() {
    let _server = orders_server("memory://js-nak-term", LONG_ACK_WAIT);
    let connection = connect("memory://js-nak-term").await;
    let js = connection.jetstream(JetStreamOptions::default()).unwrap();
    js.publish(order(1), &PublishOptions::default()).await.unwrap();

    let pull = js.pull_subscribe("orders.>", "ORDERS", "pull").await.unwrap();
    let first = pull.fetch(1, Duration::from_millis(200)).await.unwrap();
    first[0].nak(None).await.unwrap();

    let again = pull.fetch(1, Duration::from_millis(200)).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].payload, "1");
    again[0].in_progress().await.unwrap();
    again[0].term().await.unwrap();
    assert_matches!(again[0].ack().await, Err(Error::AlreadyAcknowledged));

    let after_term = pull.fetch(1, Duration::from_millis(100)).await.unwrap();
    assert!(after_term.is_empty());

    connection.close().await;
}

#[tokio::test]
async fn test_push_subscription_manual_ack() {
    let server = orders_server("memory://js-push", LONG_ACK_WAIT);
    let connection = connect("memory://js-push").await;
    let js = connection.jetstream(JetStreamOptions::default()).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let push = js.subscribe("orders.>", "ORDERS", "push", tx).await.unwrap();
    assert_eq!(push.stream(), "ORDERS");
    assert!(push.is_valid());

    js.publish(order(1), &PublishOptions::default()).await.unwrap();
    let message = recv(&mut rx).await;
    assert_eq!(message.subject, "orders.1");
    assert_eq!(server.consumer_info("ORDERS", "push").unwrap().ack_pending, 1);

    message.ack().await.unwrap();
    assert_matches!(message.ack().await, Err(Error::AlreadyAcknowledged));
    assert_eq!(server.consumer_info("ORDERS", "push").unwrap().ack_pending, 0);

    push.unsubscribe().await.unwrap();
    assert!(!push.is_valid());
    js.publish(order(2), &PublishOptions::default()).await.unwrap();
    assert_quiet(&mut rx).await;

    connection.close().await;
}

#[tokio::test]
async fn test_unacked_push_message_is_redelivered() {
    let server = orders_server("memory://js-redeliver", Duration::from_millis(100));
    let connection = connect("memory://js-redeliver").await;
    let js = connection.jetstream(JetStreamOptions::default()).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let push = js.subscribe("orders.>", "ORDERS", "push", tx).await.unwrap();
    js.publish(order(1), &PublishOptions::default()).await.unwrap();

    let first = recv(&mut rx).await;
    let second = recv(&mut rx).await;
    assert_eq!(first.payload, second.payload);
    second.ack().await.unwrap();

    assert!(push.delivered() >= 2);
    assert!(server.consumer_info("ORDERS", "push").unwrap().redelivered >= 1);

    connection.close().await;
}

#[tokio::test]
async fn test_push_subscribe_requires_consumer() {
    let _server = orders_server("memory://js-push-missing", LONG_ACK_WAIT);
    let connection = connect("memory://js-push-missing").await;
    let js = connection.jetstream(JetStreamOptions::default()).unwrap();

    let (tx, _rx) = mpsc::unbounded_channel();
    assert_matches!(
        js.subscribe("orders.>", "ORDERS", "ghost", tx.clone()).await,
        Err(Error::ConsumerNotFound { .. })
    );
    assert_matches!(
        js.subscribe("payments.>", "", "push", tx).await,
        Err(Error::StreamNotFound(_))
    );

    connection.close().await;
}

#[tokio::test]
async fn test_context_closes_with_connection() {
    let _server = orders_server("memory://js-closed", LONG_ACK_WAIT);
    let connection = connect("memory://js-closed").await;
    let js = connection.jetstream(JetStreamOptions::default()).unwrap();
    let pull = js.pull_subscribe("orders.>", "ORDERS", "pull").await.unwrap();

    connection.close().await;

    assert_matches!(
        js.publish(order(1), &PublishOptions::default()).await,
        Err(Error::Closed)
    );
    assert_matches!(
        js.async_publish(order(1), PublishOptions::default()),
        Err(Error::Closed)
    );
    assert_matches!(
        pull.fetch(1, Duration::from_millis(10)).await,
        Err(Error::Closed)
    );
}

#[tokio::test]
async fn test_drain_waits_for_async_publishes() {
    let server = orders_server("memory://js-drain", LONG_ACK_WAIT);
    let connection = connect("memory://js-drain").await;
    let js = connection.jetstream(JetStreamOptions::default()).unwrap();
    server.set_jetstream_latency(Duration::from_millis(50));

    for n in 0..5 {
        js.async_publish(order(n), PublishOptions::default()).unwrap();
    }
    connection.drain(Duration::from_secs(2)).await.unwrap();

    assert_eq!(server.stream_info("ORDERS").unwrap().messages, 5);
    assert!(connection.is_closed());
}

#[tokio::test]
async fn test_domain_must_be_served() {
    let _server = orders_server("memory://js-domain", LONG_ACK_WAIT);
    let connection = connect("memory://js-domain").await;

    let js = connection
        .jetstream(JetStreamOptions {
            domain: Some("hub".to_string()),
            ..JetStreamOptions::default()
        })
        .unwrap();
    assert_matches!(
        js.publish(order(1), &PublishOptions::default()).await,
        Err(Error::Protocol(_))
    );

    assert_matches!(
        connection.jetstream(JetStreamOptions {
            wait: Duration::ZERO,
            ..JetStreamOptions::default()
        }),
        Err(Error::Configuration(_))
    );

    connection.close().await;
}
