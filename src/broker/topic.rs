use std::collections::HashSet;

use crate::client::ClientId;

/// Topic names compare case-insensitively; this is the registry key.
pub fn normalize(name: &str) -> String {
    name.to_lowercase()
}

/// A topic and the set of clients subscribed to it.
#[derive(Debug, Default)]
pub struct Topic {
    pub name: String,
    pub subscribers: HashSet<ClientId>,
}

impl Topic {
    /// Creates a topic with no subscribers. The name is stored normalized.
    pub fn new(name: &str) -> Self {
        Self {
            name: normalize(name),
            subscribers: HashSet::new(),
        }
    }

    /// Adds a subscriber. Returns `false` if it was already subscribed.
    pub fn subscribe(&mut self, id: ClientId) -> bool {
        self.subscribers.insert(id)
    }

    /// Removes a subscriber. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&mut self, id: &ClientId) -> bool {
        self.subscribers.remove(id)
    }

    pub fn is_subscribed(&self, id: &ClientId) -> bool {
        self.subscribers.contains(id)
    }

    /// Copy of the current subscribers, taken for one fan-out.
    pub fn snapshot(&self) -> Vec<ClientId> {
        self.subscribers.iter().copied().collect()
    }
}
