//! Durable transport: file-backed redelivery across broker restarts.

use super::message;
use fabric_bus::{handler_fn, BackoffPolicy, Broker, BrokerConfig, InMemoryBroker, SubscriptionSpec};
use fabric_pool::PoolConfig;
use fabric_transport::{DurableBroker, FileEventLog, InMemoryEventLog, TransportConfig};
use fabric_types::{Channel, ChannelType, Message};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

fn fast_config() -> TransportConfig {
    TransportConfig {
        batch_size: 8,
        batch_timeout: Duration::from_millis(2),
        poll_interval: Duration::from_millis(10),
        backoff: BackoffPolicy {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(20),
        },
        store_retry_attempts: 2,
        pool: PoolConfig {
            min_size: 0,
            max_size: 4,
            acquire_timeout: Duration::from_secs(1),
            ..PoolConfig::default()
        },
        ..TransportConfig::default()
    }
}

#[tokio::test]
async fn test_file_log_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    // First broker instance: consume one message, leave one unacked.
    {
        let log = Arc::new(FileEventLog::open(dir.path()).unwrap());
        let broker = DurableBroker::new(log, fast_config());
        broker
            .channels()
            .create(Channel::new("tasks.created", ChannelType::Topic))
            .unwrap();

        let handler = handler_fn(|m: Message| async move {
            if m.payload["n"] == json!(0) {
                Ok(())
            } else {
                // Crash simulation: never acknowledge the second message.
                sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        });
        broker
            .subscribe(
                SubscriptionSpec::new("tasks.created")
                    .unwrap()
                    .with_group("workers")
                    .with_max_concurrency(2),
                handler,
            )
            .await
            .unwrap();

        broker
            .publish("tasks.created", message("tasks.created", json!({"n": 0})))
            .await
            .unwrap();
        broker
            .publish("tasks.created", message("tasks.created", json!({"n": 1})))
            .await
            .unwrap();
        sleep(Duration::from_millis(400)).await;
    }

    // Give the first instance's background tasks a beat to drop their
    // store handles so the directory lock frees up.
    sleep(Duration::from_millis(100)).await;

    // Second instance over the same directory: only the unacknowledged
    // message comes back.
    let log = Arc::new(FileEventLog::open(dir.path()).unwrap());
    let broker = DurableBroker::new(log, fast_config());
    broker
        .channels()
        .create(Channel::new("tasks.created", ChannelType::Topic))
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    broker
        .subscribe(
            SubscriptionSpec::new("tasks.created")
                .unwrap()
                .with_group("workers"),
            handler_fn(move |m: Message| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(m.payload["n"].clone());
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    let redelivered = timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("unacked message must be redelivered")
        .unwrap();
    assert_eq!(redelivered, json!(1));
    assert!(
        rx.try_recv().is_err(),
        "acknowledged prefix is never redelivered"
    );
}

#[tokio::test]
async fn test_small_burst_flushes_within_batch_timeout() {
    let log = Arc::new(InMemoryEventLog::new());
    let config = TransportConfig {
        batch_size: 1000, // far larger than the burst
        ..fast_config()
    };
    let broker = DurableBroker::new(log.clone(), config);
    broker
        .channels()
        .create(Channel::new("tasks.created", ChannelType::Topic))
        .unwrap();

    // publish() returns only after durable acceptance, so a completed
    // call proves the partial batch flushed on the timeout.
    for n in 0..3u64 {
        timeout(
            Duration::from_secs(1),
            broker.publish("tasks.created", message("tasks.created", json!({"n": n}))),
        )
        .await
        .expect("publish must not wait for a full batch")
        .unwrap();
    }
    assert_eq!(log.len(), 3);
}

#[tokio::test]
async fn test_group_cursor_is_shared_across_members() {
    let log = Arc::new(InMemoryEventLog::new());
    let broker = DurableBroker::new(log, fast_config());
    broker
        .channels()
        .create(Channel::new("tasks.created", ChannelType::Topic))
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    for _ in 0..2 {
        let tx = tx.clone();
        broker
            .subscribe(
                SubscriptionSpec::new("tasks.created")
                    .unwrap()
                    .with_group("workers"),
                handler_fn(move |m: Message| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(m.id);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();
    }

    for n in 0..10u64 {
        broker
            .publish("tasks.created", message("tasks.created", json!({"n": n})))
            .await
            .unwrap();
    }

    let mut ids = Vec::new();
    for _ in 0..10 {
        ids.push(
            timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap(),
        );
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 10, "each message consumed exactly once by the group");
    assert!(rx.try_recv().is_err(), "no duplicate deliveries");
}

#[tokio::test]
async fn test_durable_dlq_messages_are_stored() {
    let log = Arc::new(InMemoryEventLog::new());
    let broker = DurableBroker::new(log.clone(), fast_config());
    let mut channel = Channel::new("tasks.created", ChannelType::Topic);
    channel.qos.max_retries = 1;
    broker.channels().create(channel).unwrap();

    broker
        .subscribe(
            SubscriptionSpec::new("tasks.created").unwrap(),
            handler_fn(|_m| async { Err(fabric_bus::HandlerError::new("no")) }),
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

    broker
        .publish("tasks.created", message("tasks.created", json!({"job": 1})))
        .await
        .unwrap();

    let dead = timeout(Duration::from_secs(3), dlq_rx.recv())
        .await
        .expect("dead letter delivered")
        .unwrap();
    assert_eq!(dead.payload, json!({"job": 1}));
    // Original entry plus the durable dead-letter entry.
    assert_eq!(log.len(), 2);
}

#[tokio::test]
async fn test_in_memory_and_durable_brokers_interchangeable() {
    // The same collaborator code runs against either implementation.
    async fn run(broker: Arc<dyn Broker>) -> serde_json::Value {
        broker
            .channels()
            .create(Channel::new("tasks.created", ChannelType::Topic))
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker
            .subscribe(
                SubscriptionSpec::new("tasks.created").unwrap(),
                handler_fn(move |m: Message| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(m.payload);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();
        broker
            .publish("tasks.created", message("tasks.created", json!({"ok": true})))
            .await
            .unwrap();
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    let in_memory: Arc<dyn Broker> = Arc::new(InMemoryBroker::new(BrokerConfig::default()));
    assert_eq!(run(in_memory).await, json!({"ok": true}));

    let durable: Arc<dyn Broker> = Arc::new(DurableBroker::new(
        Arc::new(InMemoryEventLog::new()),
        fast_config(),
    ));
    assert_eq!(run(durable).await, json!({"ok": true}));
}
