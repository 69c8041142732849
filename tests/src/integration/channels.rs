//! Channel model and pattern matching exercised through a live broker.

use super::message;
use fabric_bus::{handler_fn, Broker, BrokerConfig, InMemoryBroker, PublishError};
use fabric_types::{
    Channel, ChannelError, ChannelType, ChannelUpdate, QosPolicy, TopicPattern,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn broker() -> InMemoryBroker {
    InMemoryBroker::new(BrokerConfig::default())
}

#[tokio::test]
async fn test_channel_lifecycle_through_broker() {
    let broker = broker();
    let channels = broker.channels();

    channels
        .create(Channel::new("agents.worker.inbox", ChannelType::Direct))
        .unwrap();
    channels
        .create(Channel::new("agents.broadcast.alerts", ChannelType::Broadcast))
        .unwrap();
    channels
        .create(Channel::new("tasks.created", ChannelType::Topic))
        .unwrap();

    // get/exists/list/get_by_type
    assert!(channels.exists("agents.worker.inbox"));
    assert_eq!(
        channels.get("tasks.created").unwrap().channel_type,
        ChannelType::Topic
    );
    // The registry also seeds the system broadcast channel.
    assert!(channels.exists(fabric_bus::SYSTEM_BROADCAST_CHANNEL));
    assert_eq!(channels.get_by_type(ChannelType::Broadcast).len(), 2);

    // update is whole-object replace with re-validation
    let updated = channels
        .update(
            "tasks.created",
            &ChannelUpdate {
                qos: Some(QosPolicy {
                    max_retries: 7,
                    ..QosPolicy::default()
                }),
                ..ChannelUpdate::default()
            },
        )
        .unwrap();
    assert_eq!(updated.qos.max_retries, 7);

    // delete cascades through the broker
    broker.delete_channel("tasks.created").await.unwrap();
    assert!(!channels.exists("tasks.created"));
}

#[tokio::test]
async fn test_per_type_name_rules() {
    let channels = broker().channels();

    // Direct channels must be agents.<name>.<suffix>.
    assert!(matches!(
        channels.create(Channel::new("workers.w1.inbox", ChannelType::Direct)),
        Err(ChannelError::InvalidName { .. })
    ));

    // Broadcast channels must start with agents.broadcast.
    assert!(matches!(
        channels.create(Channel::new("agents.alerts", ChannelType::Broadcast)),
        Err(ChannelError::InvalidName { .. })
    ));

    // General grammar violations fail regardless of type.
    assert!(matches!(
        channels.create(Channel::new("tasks..created", ChannelType::Topic)),
        Err(ChannelError::InvalidName { .. })
    ));
}

#[tokio::test]
async fn test_find_by_pattern_agrees_with_dispatch() {
    let broker = broker();
    let channels = broker.channels();
    channels
        .create(Channel::new("agents.test.message", ChannelType::Topic))
        .unwrap();
    channels
        .create(Channel::new("agents.a.b.message", ChannelType::Topic))
        .unwrap();

    // Preview: `agents.*.message` matches the 3-segment name only.
    let preview = channels.find_by_pattern(&TopicPattern::parse("agents.*.message").unwrap());
    assert_eq!(preview.len(), 1);
    assert_eq!(preview[0].name, "agents.test.message");

    // Dispatch: the same pattern delivers only from the previewed channel.
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let handler = handler_fn(move |m: fabric_types::Message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(m.channel);
            Ok(())
        }
    });
    broker
        .subscribe(
            fabric_bus::SubscriptionSpec::new("agents.*.message").unwrap(),
            handler,
        )
        .await
        .unwrap();

    broker
        .publish(
            "agents.test.message",
            message("agents.test.message", json!({})),
        )
        .await
        .unwrap();
    broker
        .publish("agents.a.b.message", message("agents.a.b.message", json!({})))
        .await
        .unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered, "agents.test.message");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_publish_validations() {
    let broker = broker();

    // Unknown channel.
    assert!(matches!(
        broker
            .publish("tasks.created", message("tasks.created", json!({})))
            .await,
        Err(PublishError::Channel(ChannelError::NotFound { .. }))
    ));

    // Bad sender URI.
    broker
        .channels()
        .create(Channel::new("tasks.created", ChannelType::Topic))
        .unwrap();
    let mut bad_sender = message("tasks.created", json!({}));
    bad_sender.sender = "http://not-an-agent".to_string();
    assert!(matches!(
        broker.publish("tasks.created", bad_sender).await,
        Err(PublishError::Message(_))
    ));
}

#[tokio::test]
async fn test_broker_as_trait_object() {
    // Collaborators hold Arc<dyn Broker>; nothing depends on the concrete
    // implementation.
    let concrete = broker();
    concrete
        .channels()
        .create(Channel::new("tasks.created", ChannelType::Topic))
        .unwrap();
    let broker: Arc<dyn Broker> = Arc::new(concrete);

    let id = broker
        .publish("tasks.created", message("tasks.created", json!({"n": 1})))
        .await
        .unwrap();
    assert!(!id.is_nil());
    assert_eq!(broker.stats().published, 1);
}
