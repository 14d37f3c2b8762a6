use std::time::Duration;

use futures::StreamExt;

use super::memory::MemoryBroker;
use super::topic;
use super::{
    Connection, DELIVERY_COUNT_HEADER, DeliveryStream, ExchangeKind, Message, QueueDeclaration,
};
use crate::utils::error::PubSubError;

fn durable(name: &str) -> QueueDeclaration {
    QueueDeclaration {
        name: name.to_string(),
        durable: true,
        auto_delete: false,
        exclusive: false,
        dead_letter_exchange: Some("dlx".to_string()),
    }
}

fn transient(name: &str) -> QueueDeclaration {
    QueueDeclaration {
        name: name.to_string(),
        durable: false,
        auto_delete: true,
        exclusive: true,
        dead_letter_exchange: Some("dlx".to_string()),
    }
}

fn text(routing_key: &str, body: &str) -> Message {
    Message::new(routing_key, "text/plain", body.as_bytes().to_vec())
}

async fn next_within(stream: &mut DeliveryStream, millis: u64) -> Option<super::Delivery> {
    match tokio::time::timeout(Duration::from_millis(millis), stream.next()).await {
        Ok(Some(Ok(delivery))) => Some(delivery),
        _ => None,
    }
}

#[test]
fn test_topic_single_word_wildcard() {
    assert!(topic::matches("army.*", "army.alice"));
    assert!(!topic::matches("army.*", "army.alice.bob"));
    assert!(!topic::matches("army.*", "army"));
    assert!(topic::matches("*.alice", "army.alice"));
}

#[test]
fn test_topic_multi_word_wildcard() {
    assert!(topic::matches("army.#", "army.alice"));
    assert!(topic::matches("army.#", "army.alice.bob"));
    assert!(topic::matches("army.#", "army"));
    assert!(topic::matches("#", "anything.at.all"));
    assert!(topic::matches("a.#.z", "a.z"));
    assert!(topic::matches("a.#.z", "a.b.c.z"));
    assert!(!topic::matches("a.#.z", "a.b.c"));
    assert!(topic::matches("#.#", "x"));
}

#[test]
fn test_topic_literal() {
    assert!(topic::matches("pause", "pause"));
    assert!(!topic::matches("pause", "pause.alice"));
    assert!(!topic::matches("pause.alice", "pause"));
}

#[tokio::test]
async fn test_declare_queue_is_idempotent() {
    let broker = MemoryBroker::new();
    let session = broker.open_session().await.unwrap();

    let first = session.declare_queue(&durable("game_logs")).await.unwrap();
    let second = session.declare_queue(&durable("game_logs")).await.unwrap();
    assert_eq!(first, second);
    assert!(broker.queue_exists("game_logs"));
}

#[tokio::test]
async fn test_declare_queue_with_conflicting_flags_fails() {
    let broker = MemoryBroker::new();
    let session = broker.open_session().await.unwrap();
    session.declare_queue(&durable("game_logs")).await.unwrap();

    let mut conflicting = durable("game_logs");
    conflicting.durable = false;
    let err = session.declare_queue(&conflicting).await.unwrap_err();
    assert!(matches!(err, PubSubError::Topology(_)));

    let mut other_dlx = durable("game_logs");
    other_dlx.dead_letter_exchange = None;
    assert!(session.declare_queue(&other_dlx).await.is_err());
}

#[tokio::test]
async fn test_exclusive_queue_is_locked_to_owner() {
    let broker = MemoryBroker::new();
    let owner = broker.open_session().await.unwrap();
    let other = broker.open_session().await.unwrap();

    owner.declare_queue(&transient("pause.alice")).await.unwrap();
    let err = other.declare_queue(&transient("pause.alice")).await.unwrap_err();
    assert!(matches!(err, PubSubError::Topology(_)));
    assert!(other.consume("pause.alice", "").await.is_err());
}

#[tokio::test]
async fn test_transient_queue_removed_when_session_closes() {
    let broker = MemoryBroker::new();
    let session = broker.open_session().await.unwrap();
    session
        .declare_exchange("topic", ExchangeKind::Topic, true)
        .await
        .unwrap();
    session.declare_queue(&transient("pause.alice")).await.unwrap();
    session.bind_queue("pause.alice", "topic", "pause").await.unwrap();
    assert!(broker.queue_exists("pause.alice"));

    session.close().await.unwrap();
    assert!(!broker.queue_exists("pause.alice"));

    // the same identity can take the name again from a new session
    let again = broker.open_session().await.unwrap();
    again.declare_queue(&transient("pause.alice")).await.unwrap();
    drop(again);
    assert!(!broker.queue_exists("pause.alice"));
}

#[tokio::test]
async fn test_bind_to_missing_exchange_fails() {
    let broker = MemoryBroker::new();
    let session = broker.open_session().await.unwrap();
    session.declare_queue(&durable("q")).await.unwrap();
    let err = session.bind_queue("q", "nope", "#").await.unwrap_err();
    assert!(matches!(err, PubSubError::Topology(_)));
}

#[tokio::test]
async fn test_publish_to_missing_exchange_fails() {
    let broker = MemoryBroker::new();
    let session = broker.open_session().await.unwrap();
    let err = session.publish("nope", text("k", "x")).await.unwrap_err();
    assert!(matches!(err, PubSubError::Publish(_)));
}

#[tokio::test]
async fn test_publish_on_closed_session_fails() {
    let broker = MemoryBroker::new();
    let session = broker.open_session().await.unwrap();
    session.close().await.unwrap();
    let err = session.publish("", text("k", "x")).await.unwrap_err();
    assert!(matches!(err, PubSubError::Publish(_)));
}

#[tokio::test]
async fn test_topic_routing_through_engine() {
    let broker = MemoryBroker::new();
    let session = broker.open_session().await.unwrap();
    session
        .declare_exchange("topic", ExchangeKind::Topic, true)
        .await
        .unwrap();
    session.declare_queue(&durable("one_word")).await.unwrap();
    session.declare_queue(&durable("many_words")).await.unwrap();
    session.bind_queue("one_word", "topic", "army.*").await.unwrap();
    session.bind_queue("many_words", "topic", "army.#").await.unwrap();

    session.publish("topic", text("army.alice", "a")).await.unwrap();
    session.publish("topic", text("army.alice.bob", "b")).await.unwrap();
    session.publish("topic", text("navy.alice", "c")).await.unwrap();

    assert_eq!(broker.queue_stats("one_word").unwrap().ready, 1);
    assert_eq!(broker.queue_stats("many_words").unwrap().ready, 2);
}

#[tokio::test]
async fn test_default_exchange_routes_by_queue_name() {
    let broker = MemoryBroker::new();
    let session = broker.open_session().await.unwrap();
    session.declare_queue(&durable("direct_q")).await.unwrap();
    session.publish("", text("direct_q", "x")).await.unwrap();
    session.publish("", text("missing_q", "x")).await.unwrap();
    assert_eq!(broker.queue_stats("direct_q").unwrap().ready, 1);
}

#[tokio::test]
async fn test_prefetch_bounds_outstanding_deliveries() {
    let broker = MemoryBroker::new();
    let session = broker.open_session().await.unwrap();
    session.declare_queue(&durable("work")).await.unwrap();
    for i in 0..25 {
        session.publish("", text("work", &i.to_string())).await.unwrap();
    }

    session.set_prefetch(10).await.unwrap();
    let mut stream = session.consume("work", "worker").await.unwrap();

    let mut held = Vec::new();
    while let Some(delivery) = next_within(&mut stream, 50).await {
        held.push(delivery);
    }
    assert_eq!(held.len(), 10);
    let stats = broker.queue_stats("work").unwrap();
    assert_eq!(stats.unacked, 10);
    assert_eq!(stats.ready, 15);

    // settling one frees exactly one slot
    held.remove(0).acker.ack().await.unwrap();
    assert!(next_within(&mut stream, 50).await.is_some());
    assert!(next_within(&mut stream, 50).await.is_none());
    assert_eq!(broker.queue_stats("work").unwrap().peak_outstanding, 10);
}

#[tokio::test]
async fn test_double_ack_is_rejected() {
    let broker = MemoryBroker::new();
    let session = broker.open_session().await.unwrap();
    session.declare_queue(&durable("q")).await.unwrap();
    session.publish("", text("q", "x")).await.unwrap();
    let mut stream = session.consume("q", "").await.unwrap();

    let delivery = next_within(&mut stream, 100).await.unwrap();
    delivery.acker.ack().await.unwrap();
    let err = delivery.acker.ack().await.unwrap_err();
    assert!(matches!(err, PubSubError::Ack(_)));
    assert_eq!(broker.queue_stats("q").unwrap().acked, 1);
}

#[tokio::test]
async fn test_requeue_marks_redelivered_and_counts() {
    let broker = MemoryBroker::new();
    let session = broker.open_session().await.unwrap();
    session.declare_queue(&durable("q")).await.unwrap();
    session.publish("", text("q", "x")).await.unwrap();
    let mut stream = session.consume("q", "").await.unwrap();

    let first = next_within(&mut stream, 100).await.unwrap();
    assert!(!first.redelivered);
    assert_eq!(first.delivery_count(), None);
    first.acker.nack(true).await.unwrap();

    let second = next_within(&mut stream, 100).await.unwrap();
    assert!(second.redelivered);
    assert_eq!(second.message.header(DELIVERY_COUNT_HEADER), Some("1"));
    assert_eq!(second.message.payload, b"x");
    assert_eq!(broker.queue_stats("q").unwrap().requeued, 1);
}

#[tokio::test]
async fn test_reject_routes_to_dead_letter_exchange() {
    let broker = MemoryBroker::new();
    let session = broker.open_session().await.unwrap();
    session
        .declare_exchange("dlx", ExchangeKind::Fanout, true)
        .await
        .unwrap();
    let mut dlq = durable("dlq");
    dlq.dead_letter_exchange = None;
    session.declare_queue(&dlq).await.unwrap();
    session.bind_queue("dlq", "dlx", "").await.unwrap();
    session.declare_queue(&durable("q")).await.unwrap();

    session.publish("", text("q", "poison")).await.unwrap();
    let mut stream = session.consume("q", "").await.unwrap();
    let delivery = next_within(&mut stream, 100).await.unwrap();
    delivery.acker.nack(false).await.unwrap();

    let q = broker.queue_stats("q").unwrap();
    assert_eq!(q.dead_lettered, 1);
    assert_eq!(q.ready, 0);
    assert_eq!(broker.queue_stats("dlq").unwrap().ready, 1);
}

#[tokio::test]
async fn test_unacked_deliveries_return_when_session_closes() {
    let broker = MemoryBroker::new();
    let admin = broker.open_session().await.unwrap();
    admin.declare_queue(&durable("q")).await.unwrap();
    admin.publish("", text("q", "first")).await.unwrap();
    admin.publish("", text("q", "second")).await.unwrap();

    let consumer = broker.open_session().await.unwrap();
    let mut stream = consumer.consume("q", "").await.unwrap();
    assert!(next_within(&mut stream, 100).await.is_some());
    assert!(next_within(&mut stream, 100).await.is_some());
    assert_eq!(broker.queue_stats("q").unwrap().unacked, 2);

    drop(stream);
    consumer.close().await.unwrap();

    let stats = broker.queue_stats("q").unwrap();
    assert_eq!(stats.unacked, 0);
    assert_eq!(stats.ready, 2);

    let fresh = broker.open_session().await.unwrap();
    let mut stream = fresh.consume("q", "").await.unwrap();
    let redelivered = next_within(&mut stream, 100).await.unwrap();
    assert!(redelivered.redelivered);
    assert_eq!(redelivered.message.payload, b"first");
}

#[tokio::test]
async fn test_round_robin_between_competing_consumers() {
    let broker = MemoryBroker::new();
    let admin = broker.open_session().await.unwrap();
    admin.declare_queue(&durable("q")).await.unwrap();

    let a = broker.open_session().await.unwrap();
    let b = broker.open_session().await.unwrap();
    let mut stream_a = a.consume("q", "").await.unwrap();
    let mut stream_b = b.consume("q", "").await.unwrap();

    for i in 0..4 {
        admin.publish("", text("q", &i.to_string())).await.unwrap();
    }

    let mut got_a = 0;
    while next_within(&mut stream_a, 50).await.is_some() {
        got_a += 1;
    }
    let mut got_b = 0;
    while next_within(&mut stream_b, 50).await.is_some() {
        got_b += 1;
    }
    assert_eq!((got_a, got_b), (2, 2));
}

#[tokio::test]
async fn test_closed_connection_refuses_sessions() {
    let broker = MemoryBroker::new();
    let session = broker.open_session().await.unwrap();
    session.declare_queue(&transient("t")).await.unwrap();

    broker.close().await.unwrap();
    assert!(!broker.is_open());
    assert!(!broker.queue_exists("t"));
    assert!(matches!(
        broker.open_session().await,
        Err(PubSubError::Connection(_))
    ));
}
