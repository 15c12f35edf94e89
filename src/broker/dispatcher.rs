//! Broadcast dispatcher
//!
//! Turns an inbound SEND into a `Message` and publishes it. The sequence
//! number is stamped and the publish performed under the same lock, so the
//! order in which messages are accepted here is exactly the order in which
//! they land in every subscriber queue.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::message::Message;
use super::routing::Router;
use super::table::{DeliveryReport, TopicTable};
use crate::connection::ConnectionId;
use crate::utils::HubError;

#[derive(Debug)]
pub struct Dispatcher {
    router: Router,
    topics: Arc<TopicTable>,
    sequence: Mutex<u64>,
}

impl Dispatcher {
    pub fn new(router: Router, topics: Arc<TopicTable>) -> Self {
        Self {
            router,
            topics,
            sequence: Mutex::new(0),
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Routes, stamps and publishes one message. The body is passed through
    /// untouched.
    pub fn handle_inbound(
        &self,
        sender: Option<ConnectionId>,
        destination: &str,
        body: impl Into<String>,
        content_type: Option<String>,
    ) -> Result<DeliveryReport, HubError> {
        let topic = self
            .router
            .resolve(destination)
            .ok_or_else(|| HubError::Unroutable(destination.to_string()))?;

        let mut sequence = self.sequence.lock();
        *sequence += 1;
        let message = Arc::new(Message::new(
            *sequence,
            sender,
            destination,
            topic,
            body,
            content_type,
        ));
        let report = self.topics.publish(&message.topic, message.clone());
        drop(sequence);

        debug!(
            sender = ?sender.map(|id| id.to_string()),
            destination,
            topic = %message.topic,
            seq = message.sequence,
            "dispatched"
        );
        Ok(report)
    }

    /// Sequence number of the most recently accepted message (0 if none).
    pub fn last_sequence(&self) -> u64 {
        *self.sequence.lock()
    }
}
