//! Topic management
//!
//! A `Topic` holds the ids of the connections subscribed to one topic name.
//! Subscriptions are stored as a `HashSet` of `ConnectionId` so duplicate
//! subscriptions are a no-op. The topic never owns a connection; the registry
//! does.
//!
//! Concurrency note: callers must synchronize access to `Topic` (the topic
//! table keeps every topic behind its lock).

use std::collections::HashSet;

use crate::connection::ConnectionId;

#[derive(Debug, Default)]
pub struct Topic {
    pub name: String,
    pub subscribers: HashSet<ConnectionId>,
}

impl Topic {
    /// Create a new topic with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: HashSet::new(),
        }
    }

    /// Add a subscriber to the topic. Returns `false` if it was already there.
    pub fn subscribe(&mut self, id: ConnectionId) -> bool {
        self.subscribers.insert(id)
    }

    /// Remove a subscriber from the topic. Returns `false` if it was not there.
    pub fn unsubscribe(&mut self, id: &ConnectionId) -> bool {
        self.subscribers.remove(id)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.subscribers.contains(id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
