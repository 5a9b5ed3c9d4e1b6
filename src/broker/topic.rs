use std::collections::HashSet;

pub type SubscriberId = String;

/// A named topic and the set of subscribers that receive its messages.
#[derive(Debug, Default)]
pub struct Topic {
    pub name: String,
    pub subscribers: HashSet<SubscriberId>,
}

impl Topic {
    /// Creates a topic with no subscribers.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: HashSet::new(),
        }
    }

    /// Adds a subscriber. Subscribing twice has no further effect.
    pub fn subscribe(&mut self, id: SubscriberId) {
        self.subscribers.insert(id);
    }

    /// Removes a subscriber if present.
    pub fn unsubscribe(&mut self, id: &SubscriberId) {
        self.subscribers.remove(id);
    }
}
