//! Connection registry
//!
//! Owns the `ConnectionId -> Connection` map. Registration hands out
//! monotonically increasing ids that are never reused within the process.
//! `unregister` is idempotent because a disconnect can be observed from the
//! transport, from the client and from server shutdown.
//!
//! Removing the connection from its topics is the caller's job (see
//! `Broker::cleanup_client`), which keeps this module free of any
//! dependency on the topic table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::connection::{Connection, ConnectionId, ConnectionState, OutboundSender};
use crate::utils::HubError;

#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicU64,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_connections,
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Registers a new open connection around `sender`.
    pub fn register(
        &self,
        sender: OutboundSender,
        peer: Option<SocketAddr>,
    ) -> Result<Arc<Connection>, HubError> {
        let mut connections = self.connections.write();
        if connections.len() >= self.max_connections {
            return Err(HubError::CapacityExceeded {
                limit: self.max_connections,
            });
        }

        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let connection = Arc::new(Connection::new(id, sender, peer));
        connections.insert(id, connection.clone());
        debug!(conn = %id, live = connections.len(), "registered connection");
        Ok(connection)
    }

    /// Removes a connection. Unknown ids are a no-op.
    pub fn unregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.write().remove(&id);
        match &removed {
            Some(connection) => {
                let leftover = connection.clear_topics();
                if leftover > 0 {
                    warn!(
                        conn = %id,
                        topics = leftover,
                        "connection unregistered while still tracking topics"
                    );
                }
                connection.advance(ConnectionState::Closed);
                debug!(conn = %id, "unregistered connection");
            }
            None => debug!(conn = %id, "unregister of unknown connection ignored"),
        }
        removed
    }

    pub fn lookup(&self, id: ConnectionId) -> Result<Arc<Connection>, HubError> {
        self.connections
            .read()
            .get(&id)
            .cloned()
            .ok_or(HubError::ConnectionNotFound(id))
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().contains_key(&id)
    }

    pub fn has_capacity(&self) -> bool {
        self.len() < self.max_connections
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.connections.read().keys().copied().collect();
        ids.sort();
        ids
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}
