//! Broker engine
//!
//! `Broker` is the hub state shared by every connection task. It owns:
//! - the connection registry
//! - the topic table (subscriptions and fan-out)
//! - the dispatcher (routing and arrival order)
//!
//! Concurrency and usage notes:
//! - The API is synchronous and `&self`; each component synchronizes
//!   internally, so the broker is shared as `Arc<Broker>` rather than behind
//!   an outer mutex. No method blocks on network I/O.
//! - `cleanup_client` removes a connection from every topic before dropping
//!   it from the registry and may be called any number of times.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use super::dispatcher::Dispatcher;
use super::routing::Router;
use super::table::{DeliveryReport, TopicTable};
use crate::config::HubSettings;
use crate::connection::{Connection, ConnectionId, ConnectionRegistry, OutboundSender};
use crate::utils::HubError;

#[derive(Debug)]
pub struct Broker {
    registry: Arc<ConnectionRegistry>,
    topics: Arc<TopicTable>,
    dispatcher: Dispatcher,
}

impl Default for Broker {
    fn default() -> Self {
        Self::with_router(Router::default(), usize::MAX)
    }
}

impl Broker {
    pub fn new(settings: &HubSettings) -> Result<Self, HubError> {
        let router = Router::from_settings(settings)?;
        Ok(Self::with_router(router, settings.max_connections))
    }

    pub fn with_router(router: Router, max_connections: usize) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(max_connections));
        let topics = Arc::new(TopicTable::new(registry.clone()));
        let dispatcher = Dispatcher::new(router, topics.clone());
        Self {
            registry,
            topics,
            dispatcher,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn topics(&self) -> &TopicTable {
        &self.topics
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn register_client(
        &self,
        sender: OutboundSender,
        peer: Option<SocketAddr>,
    ) -> Result<Arc<Connection>, HubError> {
        self.registry.register(sender, peer)
    }

    pub fn subscribe(&self, topic: &str, id: ConnectionId) -> Result<(), HubError> {
        self.topics.subscribe(topic, id)
    }

    pub fn unsubscribe(&self, topic: &str, id: ConnectionId) -> bool {
        self.topics.unsubscribe(topic, id)
    }

    /// Routes and publishes a SEND from `id`.
    pub fn handle_inbound(
        &self,
        id: ConnectionId,
        destination: &str,
        body: impl Into<String>,
        content_type: Option<String>,
    ) -> Result<DeliveryReport, HubError> {
        self.dispatcher
            .handle_inbound(Some(id), destination, body, content_type)
    }

    /// Stops all future deliveries to `id` while keeping it registered.
    pub fn detach(&self, id: ConnectionId) -> usize {
        self.topics.remove_connection(id)
    }

    /// Removes a client from every topic, then from the registry.
    /// Returns `true` if the client was still registered.
    pub fn cleanup_client(&self, id: ConnectionId) -> bool {
        self.topics.remove_connection(id);
        let removed = self.registry.unregister(id).is_some();
        if removed {
            info!(conn = %id, live = self.registry.len(), "cleaned up client");
        }
        removed
    }

    /// True when no connection is registered and no topic exists.
    pub fn is_idle(&self) -> bool {
        self.registry.is_empty() && self.topics.is_empty()
    }
}
