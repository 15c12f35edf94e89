//! Topic table
//!
//! Maps topic names to their subscriber sets and performs fan-out.
//!
//! Concurrency and usage notes:
//! - All topics live behind one `RwLock`. `publish` holds the read lock for
//!   the whole snapshot pass, so it never observes a half-applied
//!   subscribe/unsubscribe and a subscriber added mid-publish gets nothing
//!   from that publish.
//! - Delivery is `try_send` into each connection's bounded queue and never
//!   waits. A subscriber whose queue is full or closed is counted as skipped,
//!   removed from the topic once the pass is done, and evicted so that its
//!   handler tears the connection down.
//! - Topics are created on first subscribe and dropped when their last
//!   subscriber leaves.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::message::Message;
use super::topic::Topic;
use crate::connection::{ConnectionId, ConnectionRegistry};
use crate::utils::HubError;

/// Outcome of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub skipped: usize,
}

impl DeliveryReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.skipped
    }
}

#[derive(Debug)]
pub struct TopicTable {
    topics: RwLock<HashMap<String, Topic>>,
    registry: Arc<ConnectionRegistry>,
}

impl TopicTable {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            registry,
        }
    }

    /// Subscribes an open connection to a topic. Automatically creates the
    /// topic if it doesn't exist. Subscribing twice is a no-op.
    pub fn subscribe(&self, topic: &str, id: ConnectionId) -> Result<(), HubError> {
        let connection = self.registry.lookup(id)?;

        let mut topics = self.topics.write();
        // checked under the write lock: a closing connection takes this lock
        // to leave its topics, so it cannot be re-added afterwards
        if !connection.is_open() {
            return Err(HubError::ConnectionNotFound(id));
        }

        let added = topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(topic))
            .subscribe(id);
        connection.track_topic(topic);

        if added {
            debug!(conn = %id, topic, "subscribed");
        }
        Ok(())
    }

    /// Unsubscribes a connection from a topic. Unknown topics and
    /// non-members are ignored. Returns whether anything was removed.
    pub fn unsubscribe(&self, topic: &str, id: ConnectionId) -> bool {
        let removed = {
            let mut topics = self.topics.write();
            let removed = match topics.get_mut(topic) {
                Some(t) => t.unsubscribe(&id),
                None => false,
            };
            if topics.get(topic).is_some_and(Topic::is_empty) {
                topics.remove(topic);
            }
            removed
        };

        if let Ok(connection) = self.registry.lookup(id) {
            connection.untrack_topic(topic);
        }

        if removed {
            debug!(conn = %id, topic, "unsubscribed");
        } else {
            let inconsistency =
                HubError::RegistryInconsistency(format!("{id} is not subscribed to '{topic}'"));
            debug!(%inconsistency, "unsubscribe ignored");
        }
        removed
    }

    /// Delivers `message` to every current subscriber of `topic`.
    pub fn publish(&self, topic: &str, message: Arc<Message>) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut failed = Vec::new();

        {
            let topics = self.topics.read();
            let Some(entry) = topics.get(topic) else {
                debug!(topic, seq = message.sequence, "no subscribers, message dropped");
                return report;
            };

            for id in &entry.subscribers {
                let outcome = self
                    .registry
                    .lookup(*id)
                    .and_then(|connection| {
                        connection.try_deliver(message.clone()).inspect_err(|_| {
                            connection.evict();
                        })
                    });

                match outcome {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        warn!(topic, seq = message.sequence, error = %e, "delivery failed");
                        report.skipped += 1;
                        failed.push(*id);
                    }
                }
            }
        }

        for id in failed {
            self.unsubscribe(topic, id);
        }

        debug!(
            topic,
            seq = message.sequence,
            delivered = report.delivered,
            skipped = report.skipped,
            "published"
        );
        report
    }

    /// Removes a connection from every topic in one pass. Returns the number
    /// of topics it was removed from.
    pub fn remove_connection(&self, id: ConnectionId) -> usize {
        let removed = {
            let mut topics = self.topics.write();
            let mut removed = 0;
            topics.retain(|_, topic| {
                if topic.unsubscribe(&id) {
                    removed += 1;
                }
                !topic.is_empty()
            });
            removed
        };

        if let Ok(connection) = self.registry.lookup(id) {
            connection.clear_topics();
        }
        if removed > 0 {
            debug!(conn = %id, topics = removed, "removed connection from topics");
        }
        removed
    }

    /// Subscriber ids of `topic`, sorted; empty if the topic does not exist.
    pub fn subscribers(&self, topic: &str) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .topics
            .read()
            .get(topic)
            .map(|t| t.subscribers.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn is_subscribed(&self, topic: &str, id: ConnectionId) -> bool {
        self.topics
            .read()
            .get(topic)
            .is_some_and(|t| t.contains(&id))
    }

    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.topics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.read().is_empty()
    }
}
