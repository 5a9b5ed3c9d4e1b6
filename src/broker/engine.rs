use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::message::Message;
use crate::broker::topic::{SubscriberId, Topic};

/// Handle to a broker shared between sessions of the same process.
pub type SharedBroker = Arc<Mutex<Broker>>;

/// Locks a shared broker, recovering the guard if a holder panicked.
pub fn lock(broker: &SharedBroker) -> MutexGuard<'_, Broker> {
    broker.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("topic `{0}` has not been declared")]
    UnknownTopic(String),
}

/// A registered receiver of messages.
#[derive(Debug)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub sender: UnboundedSender<Message>,
}

impl Subscriber {
    /// Create a subscriber with a fresh UUID.
    pub fn new(sender: UnboundedSender<Message>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender,
        }
    }
}

/// In-process broker: topics, the subscribers registered on them, and
/// fan-out of published messages.
///
/// Dropping a subscriber's registration drops its sender, which ends the
/// subscriber's receive side.
#[derive(Debug, Default)]
pub struct Broker {
    pub(crate) topics: HashMap<String, Topic>,
    pub(crate) clients: HashMap<SubscriberId, Subscriber>,
}

impl Broker {
    pub fn new() -> Self {
        Self {
            topics: HashMap::new(),
            clients: HashMap::new(),
        }
    }

    pub fn shared() -> SharedBroker {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Creates the topic if missing. Returns whether it was created.
    pub fn declare_topic(&mut self, name: &str) -> bool {
        if self.topics.contains_key(name) {
            return false;
        }
        self.topics.insert(name.to_string(), Topic::new(name));
        true
    }

    pub fn register_client(&mut self, client: Subscriber) {
        self.clients.insert(client.id.clone(), client);
    }

    pub fn remove_client(&mut self, client_id: &SubscriberId) {
        self.clients.remove(client_id);
    }

    /// Subscribes a client to a topic. Automatically creates the topic if it doesn't exist.
    pub fn subscribe(&mut self, topic: &str, subscriber: SubscriberId) {
        let topic = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(topic));
        topic.subscribe(subscriber);
    }

    /// Fans a message out to every subscriber of its topic and returns how
    /// many received it. Subscribers whose receiver is gone are skipped.
    pub fn publish(&self, msg: Message) -> Result<usize, PublishError> {
        let topic = self
            .topics
            .get(&msg.topic)
            .ok_or_else(|| PublishError::UnknownTopic(msg.topic.clone()))?;

        let mut delivered = 0;
        for sub_id in &topic.subscribers {
            match self.clients.get(sub_id) {
                Some(client) => {
                    if client.sender.send(msg.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        debug!(subscriber = %sub_id, "subscriber receiver dropped");
                    }
                }
                None => warn!(subscriber = %sub_id, "no client registered with id"),
            }
        }
        Ok(delivered)
    }

    /// Removes a client and unsubscribes it from every topic.
    pub fn cleanup_client(&mut self, client_id: &SubscriberId) {
        self.remove_client(client_id);

        for topic in self.topics.values_mut() {
            topic.unsubscribe(client_id);
        }

        debug!(client = %client_id, "cleaned up client");
    }
}
