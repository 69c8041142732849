//! Retry, dead-lettering, ack timeout, and unsubscribe semantics.

use super::message;
use fabric_bus::{
    handler_fn, BackoffPolicy, Broker, BrokerConfig, HandlerError, InMemoryBroker,
    SubscriptionSpec,
};
use fabric_types::{Channel, ChannelType, Message};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

fn fast_broker() -> InMemoryBroker {
    InMemoryBroker::new(BrokerConfig {
        backoff: BackoffPolicy {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(20),
        },
        sweep_interval: Duration::from_millis(20),
        ..BrokerConfig::default()
    })
}

#[tokio::test]
async fn test_failing_handler_hits_dlq_after_max_retries() {
    let broker = fast_broker();
    let mut channel = Channel::new("tasks.created", ChannelType::Topic);
    channel.qos.max_retries = 4;
    broker.channels().create(channel).unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&attempts);
    broker
        .subscribe(
            SubscriptionSpec::new("tasks.created").unwrap(),
            handler_fn(move |_m: Message| {
                let counted = Arc::clone(&counted);
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err(HandlerError::new("always fails"))
                }
            }),
        )
        .await
        .unwrap();

    let (dlq_tx, mut dlq_rx) = mpsc::unbounded_channel();
    broker
        .subscribe(
            SubscriptionSpec::new("tasks.created.dlq").unwrap(),
            handler_fn(move |m: Message| {
                let tx = dlq_tx.clone();
                async move {
                    let _ = tx.send(m);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    let id = broker
        .publish("tasks.created", message("tasks.created", json!({"job": 9})))
        .await
        .unwrap();

    let dead = timeout(Duration::from_secs(3), dlq_rx.recv())
        .await
        .expect("message must reach the DLQ")
        .unwrap();

    assert_eq!(dead.id, id, "the dead letter is the original message");
    assert_eq!(dead.payload, json!({"job": 9}), "payload unmodified");
    assert_eq!(
        attempts.load(Ordering::SeqCst),
        4,
        "exactly qos.max_retries attempts"
    );
    assert_eq!(
        dead.metadata.retry_count, 3,
        "retry count incremented monotonically across attempts"
    );
}

#[tokio::test]
async fn test_retry_count_monotonic_across_attempts() {
    let broker = fast_broker();
    let mut channel = Channel::new("tasks.created", ChannelType::Topic);
    channel.qos.max_retries = 3;
    broker.channels().create(channel).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    broker
        .subscribe(
            SubscriptionSpec::new("tasks.created").unwrap(),
            handler_fn(move |m: Message| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(m.metadata.retry_count);
                    Err(HandlerError::new("fail"))
                }
            }),
        )
        .await
        .unwrap();

    broker
        .publish("tasks.created", message("tasks.created", json!({})))
        .await
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(
            timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap(),
        );
    }
    assert_eq!(seen, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_unsubscribed_handler_never_fires_again() {
    let broker = fast_broker();
    broker
        .channels()
        .create(Channel::new("tasks.created", ChannelType::Topic))
        .unwrap();

    let removed = Arc::new(AtomicUsize::new(0));
    let kept = Arc::new(AtomicUsize::new(0));

    let removed_counter = Arc::clone(&removed);
    let handle = broker
        .subscribe(
            SubscriptionSpec::new("tasks.created").unwrap(),
            handler_fn(move |_m| {
                let c = Arc::clone(&removed_counter);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();
    let kept_counter = Arc::clone(&kept);
    broker
        .subscribe(
            SubscriptionSpec::new("tasks.created").unwrap(),
            handler_fn(move |_m| {
                let c = Arc::clone(&kept_counter);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    handle.unsubscribe();
    handle.unsubscribe(); // idempotent

    broker
        .publish("tasks.created", message("tasks.created", json!({})))
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(removed.load(Ordering::SeqCst), 0);
    assert_eq!(kept.load(Ordering::SeqCst), 1, "other subscriptions still fire");
}

#[tokio::test]
async fn test_ack_timeout_counts_as_failure() {
    let broker = fast_broker();
    let mut channel = Channel::new("tasks.created", ChannelType::Topic);
    channel.qos.max_retries = 2;
    channel.qos.ack_timeout = Duration::from_millis(40);
    broker.channels().create(channel).unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&attempts);
    broker
        .subscribe(
            SubscriptionSpec::new("tasks.created")
                .unwrap()
                .with_max_concurrency(4),
            handler_fn(move |_m: Message| {
                let counted = Arc::clone(&counted);
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    // Never acknowledges within the timeout.
                    sleep(Duration::from_secs(30)).await;
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    broker
        .publish("tasks.created", message("tasks.created", json!({})))
        .await
        .unwrap();
    sleep(Duration::from_millis(400)).await;

    assert!(
        attempts.load(Ordering::SeqCst) >= 2,
        "stalled deliveries are retried by the sweeper"
    );
    assert!(broker.stats().failed >= 1);
}

#[tokio::test]
async fn test_explicit_nack_without_requeue_dead_letters_immediately() {
    let broker = fast_broker();
    let mut channel = Channel::new("tasks.created", ChannelType::Topic);
    channel.qos.max_retries = 50; // retries would take a while; nack skips them
    broker.channels().create(channel).unwrap();

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    broker
        .subscribe(
            SubscriptionSpec::new("tasks.created").unwrap(),
            handler_fn(move |m: Message| {
                let tx = seen_tx.clone();
                async move {
                    let _ = tx.send(m.id);
                    sleep(Duration::from_secs(30)).await;
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    let id = broker
        .publish("tasks.created", message("tasks.created", json!({})))
        .await
        .unwrap();
    timeout(Duration::from_secs(1), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();

    broker.nack(id, false).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.stats().dead_lettered, 1);
}
