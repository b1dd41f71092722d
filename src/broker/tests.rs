use super::Broker;
use super::topic::{Topic, normalize};
use crate::client::{ChannelClient, MessageClient};
use crate::config::BrokerSettings;
use crate::protocol::{
    AcknowledgeMessage, ClientEnvelope, DeliverMessage, GreetingMessage, Headers, HelloMessage,
    Message, PublishMessage, RejectMessage, ServerEnvelope, SubscribeMessage, UnsubscribeMessage,
};
use crate::utils::error::BrokerError;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tokio::time::{Instant, timeout};
use tungstenite::protocol::frame::coding::CloseCode;
use uuid::Uuid;

fn envelope(message: Message) -> ClientEnvelope {
    ClientEnvelope::for_message(message)
}

fn subscribe(topic: &str) -> ClientEnvelope {
    envelope(Message::Subscribe(SubscribeMessage {
        topic: topic.to_string(),
    }))
}

fn unsubscribe(topic: &str) -> ClientEnvelope {
    envelope(Message::Unsubscribe(UnsubscribeMessage {
        topic: topic.to_string(),
    }))
}

fn publish(topic: &str, payload: serde_json::Value) -> PublishMessage {
    let mut headers = Headers::new();
    headers.insert("source".to_string(), vec!["test".to_string()]);
    PublishMessage {
        id: Uuid::new_v4(),
        topic: topic.to_string(),
        headers,
        payload,
    }
}

fn acknowledge(deliver: &DeliverMessage) -> ClientEnvelope {
    envelope(Message::Acknowledge(AcknowledgeMessage {
        id: deliver.id,
        topic: deliver.topic.clone(),
    }))
}

fn reject(deliver: &DeliverMessage) -> ClientEnvelope {
    envelope(Message::Reject(RejectMessage {
        id: deliver.id,
        topic: deliver.topic.clone(),
    }))
}

/// Registers a fresh client and consumes its greeting.
async fn connect(broker: &Broker) -> (Arc<ChannelClient>, Receiver<ServerEnvelope>) {
    let (client, mut rx) = ChannelClient::new(16);
    let client = Arc::new(client);
    assert!(broker.register_client(client.clone()).await.unwrap());
    let greeting = rx.recv().await.unwrap();
    assert!(matches!(greeting.message, Message::Greeting(_)));
    (client, rx)
}

async fn next_deliver(rx: &mut Receiver<ServerEnvelope>) -> DeliverMessage {
    let envelope = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("channel closed");
    match envelope.message {
        Message::Deliver(deliver) => deliver,
        other => panic!("Expected a deliver, got {other:?}"),
    }
}

#[test]
fn test_topic_new() {
    let topic = Topic::new("Orders");
    assert_eq!(topic.name, "orders");
    assert!(topic.subscribers.is_empty());
}

#[test]
fn test_topic_subscribe_and_unsubscribe() {
    let mut topic = Topic::new("orders");
    let id = Uuid::new_v4();
    assert!(topic.subscribe(id));
    assert!(!topic.subscribe(id));
    assert!(topic.is_subscribed(&id));
    assert!(topic.unsubscribe(&id));
    assert!(!topic.unsubscribe(&id));
    assert!(!topic.is_subscribed(&id));
}

#[test]
fn test_normalize_ignores_case() {
    assert_eq!(normalize("ORDERS"), normalize("orders"));
    assert_eq!(normalize("Orders"), "orders");
}

#[tokio::test]
async fn test_register_sends_exactly_one_greeting() {
    let broker = Broker::default();
    let (client, mut rx) = ChannelClient::new(4);
    let client = Arc::new(client);

    assert!(broker.register_client(client.clone()).await.unwrap());
    assert!(!broker.register_client(client.clone()).await.unwrap());

    match rx.recv().await.unwrap().message {
        Message::Greeting(GreetingMessage {
            version,
            informational_version,
            ..
        }) => {
            assert_eq!(version, crate::protocol::PROTOCOL_VERSION);
            assert_eq!(
                informational_version.as_deref(),
                Some(crate::protocol::BUILD_LABEL)
            );
        }
        other => panic!("Expected a greeting, got {other:?}"),
    }
    assert!(rx.try_recv().is_err());
    assert_eq!(broker.client_count(), 1);
}

#[tokio::test]
async fn test_greeting_failure_leaves_client_registered() {
    let broker = Broker::default();
    let (client, rx) = ChannelClient::new(1);
    drop(rx);
    let client = Arc::new(client);

    assert!(broker.register_client(client.clone()).await.is_err());
    assert!(broker.is_registered(client.id()));
    assert!(broker.unregister_client(client.id()));
}

#[tokio::test]
async fn test_unregistered_client_is_rejected() {
    let broker = Broker::default();
    let (client, _rx) = ChannelClient::new(4);

    let result = broker.handle_message(&client, subscribe("orders")).await;
    assert!(matches!(result, Err(BrokerError::ClientNotRegistered(id)) if id == client.id()));
    assert!(broker.subscribers("orders").is_empty());
}

#[tokio::test]
async fn test_unregister_unknown_client_is_safe() {
    let broker = Broker::default();
    assert!(!broker.unregister_client(Uuid::new_v4()));
}

#[tokio::test]
async fn test_hello_is_accepted_after_greeting() {
    let broker = Broker::default();
    let (client, mut rx) = connect(&broker).await;
    let hello = envelope(Message::Hello(HelloMessage {
        id: Uuid::new_v4(),
        capabilities: vec![],
    }));

    broker.handle_message(&*client, hello).await.unwrap();
    assert!(rx.try_recv().is_err());
    assert!(!client.is_disconnected());
}

#[tokio::test]
async fn test_membership_follows_last_operation() {
    let broker = Broker::default();
    let (client, _rx) = connect(&broker).await;
    let id = client.id();

    let ops: [(bool, &str); 6] = [
        (true, "orders"),
        (true, "ORDERS"),
        (false, "Orders"),
        (false, "orders"),
        (true, "orders"),
        (false, "missing"),
    ];
    for (is_subscribe, topic) in ops {
        let env = if is_subscribe {
            subscribe(topic)
        } else {
            unsubscribe(topic)
        };
        broker.handle_message(&*client, env).await.unwrap();
    }

    assert_eq!(broker.subscribers("orders"), vec![id]);
    assert!(broker.subscribers("missing").is_empty());

    broker
        .handle_message(&*client, unsubscribe("orders"))
        .await
        .unwrap();
    assert!(broker.subscribers("orders").is_empty());
}

#[tokio::test]
async fn test_publish_fans_out_one_delivery_per_subscriber() {
    let broker = Broker::default();
    let mut subscribers = Vec::new();
    for _ in 0..3 {
        let (client, rx) = connect(&broker).await;
        broker
            .handle_message(&*client, subscribe("orders"))
            .await
            .unwrap();
        subscribers.push((client, rx));
    }
    let (publisher, mut publisher_rx) = connect(&broker).await;

    let message = publish("orders", json!({"sku": "X1"}));
    broker
        .handle_message(&*publisher, envelope(Message::Publish(message.clone())))
        .await
        .unwrap();

    let mut ids = HashSet::new();
    for (client, rx) in subscribers.iter_mut() {
        let deliver = next_deliver(rx).await;
        assert_eq!(deliver.topic, message.topic);
        assert_eq!(deliver.headers, message.headers);
        assert_eq!(deliver.payload, message.payload);
        assert_ne!(deliver.id, message.id);
        assert!(broker.is_in_flight(client.id(), deliver.id));
        ids.insert(deliver.id);
        assert!(rx.try_recv().is_err());
    }
    assert_eq!(ids.len(), 3);
    assert_eq!(broker.in_flight_len(), 3);
    assert!(publisher_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_publish_without_subscribers_creates_topic() {
    let broker = Broker::default();
    let (publisher, _rx) = connect(&broker).await;

    broker
        .publish(publisher.id(), publish("empty", json!(null)))
        .await;
    assert!(broker.subscribers("empty").is_empty());
    assert_eq!(broker.in_flight_len(), 0);
}

#[tokio::test]
async fn test_subscribe_publish_acknowledge() {
    let broker = Broker::default();
    let (client, mut rx) = connect(&broker).await;

    broker
        .handle_message(&*client, subscribe("orders"))
        .await
        .unwrap();
    broker
        .handle_message(
            &*client,
            envelope(Message::Publish(publish("orders", json!({"sku": "X1"})))),
        )
        .await
        .unwrap();

    let deliver = next_deliver(&mut rx).await;
    assert_eq!(deliver.payload, json!({"sku": "X1"}));
    assert!(broker.is_in_flight(client.id(), deliver.id));

    broker
        .handle_message(&*client, acknowledge(&deliver))
        .await
        .unwrap();
    assert!(!broker.is_in_flight(client.id(), deliver.id));
    assert_eq!(broker.in_flight_len(), 0);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_topic_names_are_case_insensitive() {
    let broker = Broker::default();
    let (upper, mut upper_rx) = connect(&broker).await;
    let (lower, mut lower_rx) = connect(&broker).await;

    broker
        .handle_message(&*upper, subscribe("ORDERS"))
        .await
        .unwrap();
    broker
        .handle_message(&*lower, subscribe("orders"))
        .await
        .unwrap();
    broker
        .publish(upper.id(), publish("Orders", json!({"sku": "X1"})))
        .await;

    assert_eq!(next_deliver(&mut upper_rx).await.topic, "Orders");
    assert_eq!(next_deliver(&mut lower_rx).await.topic, "Orders");
}

#[tokio::test]
async fn test_unmatched_acknowledge_is_not_fatal() {
    let broker = Broker::default();
    let (client, mut rx) = connect(&broker).await;
    broker
        .handle_message(&*client, subscribe("orders"))
        .await
        .unwrap();
    broker
        .publish(client.id(), publish("orders", json!(1)))
        .await;
    let deliver = next_deliver(&mut rx).await;

    let bogus = envelope(Message::Acknowledge(AcknowledgeMessage {
        id: Uuid::new_v4(),
        topic: "orders".to_string(),
    }));
    broker.handle_message(&*client, bogus).await.unwrap();

    assert!(!client.is_disconnected());
    assert!(broker.is_in_flight(client.id(), deliver.id));
    assert_eq!(broker.in_flight_len(), 1);
}

#[tokio::test]
async fn test_acknowledge_only_resolves_own_deliveries() {
    let broker = Broker::default();
    let (owner, mut owner_rx) = connect(&broker).await;
    let (other, _other_rx) = connect(&broker).await;
    broker
        .handle_message(&*owner, subscribe("orders"))
        .await
        .unwrap();
    broker.publish(other.id(), publish("orders", json!(1))).await;
    let deliver = next_deliver(&mut owner_rx).await;

    broker
        .handle_message(&*other, acknowledge(&deliver))
        .await
        .unwrap();
    assert!(broker.is_in_flight(owner.id(), deliver.id));
}

#[tokio::test]
async fn test_reject_redelivers_once_then_dead_letters() {
    let broker = Broker::default();
    let (client, mut rx) = connect(&broker).await;
    broker
        .handle_message(&*client, subscribe("orders"))
        .await
        .unwrap();
    broker
        .publish(client.id(), publish("orders", json!({"sku": "X1"})))
        .await;

    let first = next_deliver(&mut rx).await;
    broker.handle_message(&*client, reject(&first)).await.unwrap();

    let second = next_deliver(&mut rx).await;
    assert_eq!(second.id, first.id);
    assert_eq!(second.payload, first.payload);
    assert!(broker.is_in_flight(client.id(), second.id));

    broker
        .handle_message(&*client, reject(&second))
        .await
        .unwrap();
    assert!(rx.try_recv().is_err());
    assert_eq!(broker.in_flight_len(), 0);
    assert_eq!(broker.dead_letter_count(), 1);
}

#[tokio::test]
async fn test_redelivery_limit_is_configurable() {
    let broker = Broker::new(BrokerSettings {
        max_redeliveries: 0,
        ..BrokerSettings::default()
    });
    let (client, mut rx) = connect(&broker).await;
    broker
        .handle_message(&*client, subscribe("orders"))
        .await
        .unwrap();
    broker.publish(client.id(), publish("orders", json!(1))).await;

    let deliver = next_deliver(&mut rx).await;
    broker
        .handle_message(&*client, reject(&deliver))
        .await
        .unwrap();
    assert!(rx.try_recv().is_err());
    assert_eq!(broker.dead_letter_count(), 1);
}

#[tokio::test]
async fn test_unregister_removes_client_from_every_topic() {
    let broker = Broker::default();
    let (client, mut rx) = connect(&broker).await;
    let (stays, _stays_rx) = connect(&broker).await;
    for topic in ["a", "b", "c"] {
        broker
            .handle_message(&*client, subscribe(topic))
            .await
            .unwrap();
        broker
            .handle_message(&*stays, subscribe(topic))
            .await
            .unwrap();
    }
    broker.publish(stays.id(), publish("a", json!(1))).await;
    next_deliver(&mut rx).await;
    let dead_before = broker.dead_letter_count();

    assert!(broker.unregister_client(client.id()));
    for topic in ["a", "b", "c"] {
        assert_eq!(broker.subscribers(topic), vec![stays.id()]);
    }
    assert!(!broker.is_registered(client.id()));
    assert_eq!(broker.dead_letter_count(), dead_before + 1);

    let result = broker.handle_message(&*client, subscribe("a")).await;
    assert!(matches!(result, Err(BrokerError::ClientNotRegistered(_))));
}

#[tokio::test]
async fn test_server_only_message_disconnects_sender() {
    let broker = Broker::default();
    let (client, _rx) = connect(&broker).await;

    let greeting = envelope(Message::Greeting(GreetingMessage::create()));
    broker.handle_message(&*client, greeting).await.unwrap();

    assert!(client.is_disconnected());
    let reason = client.close_reason().unwrap();
    assert_eq!(reason.code, CloseCode::Protocol);
    assert!(reason.reason.contains("greeting"));
}

#[tokio::test]
async fn test_slow_subscriber_does_not_block_others() {
    let broker = Arc::new(Broker::default());

    // capacity 1, the unread greeting keeps it full
    let (slow, _slow_rx) = ChannelClient::new(1);
    let slow = Arc::new(slow);
    assert!(broker.register_client(slow.clone()).await.unwrap());
    broker.subscribe(slow.id(), "orders");

    let (fast, mut fast_rx) = connect(&broker).await;
    broker.subscribe(fast.id(), "orders");

    let publishing = {
        let broker = broker.clone();
        let publisher = fast.id();
        tokio::spawn(async move {
            broker
                .publish(publisher, publish("orders", json!({"sku": "X1"})))
                .await
        })
    };

    let deliver = next_deliver(&mut fast_rx).await;
    assert_eq!(deliver.payload, json!({"sku": "X1"}));
    assert!(!publishing.is_finished());

    slow.disconnect(crate::utils::error::CloseReason::normal())
        .await;
    timeout(Duration::from_secs(1), publishing)
        .await
        .expect("publish did not finish")
        .unwrap();
    assert_eq!(broker.in_flight_len(), 1);
}

#[tokio::test]
async fn test_expired_delivery_is_redelivered_then_dead_lettered() {
    let broker = Broker::new(BrokerSettings {
        ack_timeout_ms: 100,
        ..BrokerSettings::default()
    });
    let (client, mut rx) = connect(&broker).await;
    broker.subscribe(client.id(), "orders");
    broker.publish(client.id(), publish("orders", json!(1))).await;

    let first = next_deliver(&mut rx).await;
    // never written, never expires
    assert_eq!(broker.expire_in_flight_at(Instant::now() + Duration::from_secs(60)).await, 0);

    let sent = ServerEnvelope::for_message(Message::Deliver(first.clone()));
    broker.notify_message_sent(client.id(), &sent);
    assert_eq!(broker.expire_in_flight_at(Instant::now()).await, 0);

    let later = Instant::now() + Duration::from_millis(150);
    assert_eq!(broker.expire_in_flight_at(later).await, 1);
    let second = next_deliver(&mut rx).await;
    assert_eq!(second.id, first.id);

    let sent = ServerEnvelope::for_message(Message::Deliver(second));
    broker.notify_message_sent(client.id(), &sent);
    let later = Instant::now() + Duration::from_millis(150);
    assert_eq!(broker.expire_in_flight_at(later).await, 1);
    assert!(rx.try_recv().is_err());
    assert_eq!(broker.in_flight_len(), 0);
    assert_eq!(broker.dead_letter_count(), 1);
}

#[tokio::test]
async fn test_expiry_redelivers_past_a_full_subscriber() {
    let broker = Arc::new(Broker::new(BrokerSettings {
        ack_timeout_ms: 100,
        ..BrokerSettings::default()
    }));

    let (slow, mut slow_rx) = ChannelClient::new(2);
    let slow = Arc::new(slow);
    assert!(broker.register_client(slow.clone()).await.unwrap());
    broker.subscribe(slow.id(), "orders");

    let mut healthy = Vec::new();
    for _ in 0..4 {
        let (client, rx) = connect(&broker).await;
        broker.subscribe(client.id(), "orders");
        healthy.push((client, rx));
    }

    let publisher = healthy[0].0.id();
    broker.publish(publisher, publish("orders", json!({"sku": "X1"}))).await;

    let greeting = slow_rx.recv().await.unwrap();
    assert!(matches!(greeting.message, Message::Greeting(_)));
    let slow_deliver = next_deliver(&mut slow_rx).await;
    broker.notify_message_sent(
        slow.id(),
        &ServerEnvelope::for_message(Message::Deliver(slow_deliver.clone())),
    );

    let mut first = Vec::new();
    for (client, rx) in healthy.iter_mut() {
        let deliver = next_deliver(rx).await;
        broker.notify_message_sent(
            client.id(),
            &ServerEnvelope::for_message(Message::Deliver(deliver.clone())),
        );
        first.push(deliver);
    }

    // fill the slow channel so its redelivery cannot complete
    for _ in 0..2 {
        let filler = ServerEnvelope::for_message(Message::Greeting(GreetingMessage::create()));
        slow.send_message(filler).await.unwrap();
    }

    let sweep = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .expire_in_flight_at(Instant::now() + Duration::from_millis(150))
                .await
        })
    };

    for ((_, rx), first) in healthy.iter_mut().zip(&first) {
        let again = next_deliver(rx).await;
        assert_eq!(again.id, first.id);
    }
    assert!(!sweep.is_finished());

    slow.disconnect(crate::utils::error::CloseReason::normal())
        .await;
    let expired = timeout(Duration::from_secs(1), sweep)
        .await
        .expect("sweep did not finish")
        .unwrap();
    assert_eq!(expired, 5);
}

#[tokio::test]
async fn test_zero_ack_timeout_disables_expiry() {
    let broker = Broker::new(BrokerSettings {
        ack_timeout_ms: 0,
        ..BrokerSettings::default()
    });
    let (client, mut rx) = connect(&broker).await;
    broker.subscribe(client.id(), "orders");
    broker.publish(client.id(), publish("orders", json!(1))).await;
    let deliver = next_deliver(&mut rx).await;
    broker.notify_message_sent(
        client.id(),
        &ServerEnvelope::for_message(Message::Deliver(deliver.clone())),
    );

    let later = Instant::now() + Duration::from_secs(3600);
    assert_eq!(broker.expire_in_flight_at(later).await, 0);
    assert!(broker.is_in_flight(client.id(), deliver.id));
}

#[tokio::test]
async fn test_expiry_loop_stops_on_cancel() {
    let broker = Arc::new(Broker::new(BrokerSettings {
        expiry_interval_ms: 10,
        ..BrokerSettings::default()
    }));
    let cancel = tokio_util::sync::CancellationToken::new();
    let handle = broker.clone().start_expiry_loop(cancel.clone());

    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel.cancel();
    timeout(Duration::from_secs(1), handle)
        .await
        .expect("expiry loop did not stop")
        .unwrap();
}
