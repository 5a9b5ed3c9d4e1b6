use super::topic::Topic;
use super::{Broker, PublishError, Subscriber};
use crate::broker::message::Message;
use tokio::sync::mpsc;

fn message(topic: &str, payload: &str) -> Message {
    Message::new("id-1", topic, payload.as_bytes().to_vec())
}

#[test]
fn test_topic_subscribe_and_unsubscribe() {
    let mut topic = Topic::new("test_topic");
    assert_eq!(topic.name, "test_topic");
    topic.subscribe("client1".to_string());
    topic.subscribe("client1".to_string());
    assert_eq!(topic.subscribers.len(), 1);
    topic.unsubscribe(&"client1".to_string());
    assert!(topic.subscribers.is_empty());
}

#[test]
fn test_broker_new() {
    let broker = Broker::default();
    assert!(broker.topics.is_empty());
    assert!(broker.clients.is_empty());
}

#[test]
fn test_declare_topic_is_idempotent() {
    let mut broker = Broker::new();
    assert!(broker.declare_topic("orders"));
    assert!(!broker.declare_topic("orders"));
    assert!(broker.topics.contains_key("orders"));
    assert_eq!(broker.topics.len(), 1);
}

#[test]
fn test_broker_register_and_remove_client() {
    let mut broker = Broker::default();
    let (tx, _) = mpsc::unbounded_channel::<Message>();
    let client = Subscriber::new(tx);
    let client_id = client.id.clone();
    assert!(!client_id.is_empty());

    broker.register_client(client);
    assert!(broker.clients.contains_key(&client_id));

    broker.remove_client(&client_id);
    assert!(!broker.clients.contains_key(&client_id));
}

#[test]
fn test_broker_publish_fans_out() {
    let mut broker = Broker::default();
    let (tx_a, mut rx_a) = mpsc::unbounded_channel::<Message>();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel::<Message>();
    let a = Subscriber::new(tx_a);
    let b = Subscriber::new(tx_b);
    let (a_id, b_id) = (a.id.clone(), b.id.clone());
    broker.register_client(a);
    broker.register_client(b);
    broker.subscribe("test_topic", a_id);
    broker.subscribe("test_topic", b_id);

    let delivered = broker.publish(message("test_topic", "hello")).unwrap();
    assert_eq!(delivered, 2);

    for rx in [&mut rx_a, &mut rx_b] {
        let received = rx.try_recv().unwrap();
        assert_eq!(received.topic, "test_topic");
        assert_eq!(received.payload, b"hello");
    }
}

#[test]
fn test_publish_to_undeclared_topic_fails() {
    let broker = Broker::default();
    let err = broker
        .publish(message("nonexistent_topic", "hello"))
        .unwrap_err();
    assert_eq!(err, PublishError::UnknownTopic("nonexistent_topic".into()));
}

#[test]
fn test_publish_to_client_with_closed_channel() {
    let mut broker = Broker::default();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();
    let client = Subscriber::new(tx);
    let client_id = client.id.clone();
    broker.register_client(client);
    broker.subscribe("test_topic", client_id);

    // Drop the receiver to close the channel
    drop(rx);

    assert_eq!(broker.publish(message("test_topic", "hello")), Ok(0));
}

#[test]
fn test_broker_cleanup_client() {
    let mut broker = Broker::default();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let client = Subscriber::new(tx);
    let client_id = client.id.clone();
    broker.register_client(client);
    broker.subscribe("test_topic", client_id.clone());

    broker.cleanup_client(&client_id);
    assert!(!broker.clients.contains_key(&client_id));
    let topic = broker.topics.get("test_topic").unwrap();
    assert!(!topic.subscribers.contains(&client_id));

    // the broker held the only sender
    assert!(rx.try_recv().is_err());
    assert!(rx.is_closed());
}
