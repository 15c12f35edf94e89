//! A live client connection as seen by the shared hub state.
//!
//! The registry holds `Arc<Connection>`; the WebSocket stream itself stays
//! with the connection handler task. What is shared here is the sending half
//! of the bounded outbound queue, the subscribed topic names and the
//! lifecycle state.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

use crate::broker::message::Message;
use crate::utils::HubError;

/// Process-unique connection identifier, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

pub type OutboundSender = mpsc::Sender<Arc<Message>>;
pub type OutboundReceiver = mpsc::Receiver<Arc<Message>>;

/// Creates the bounded outbound queue for one connection.
pub fn outbound_queue(capacity: usize) -> (OutboundSender, OutboundReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Lifecycle of a connection. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    session: Uuid,
    peer: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
    sender: OutboundSender,
    state: Mutex<ConnectionState>,
    topics: Mutex<HashSet<String>>,
    evicted: AtomicBool,
    evict_notify: Notify,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, sender: OutboundSender, peer: Option<SocketAddr>) -> Self {
        Self {
            id,
            session: Uuid::new_v4(),
            peer,
            connected_at: Utc::now(),
            sender,
            state: Mutex::new(ConnectionState::Open),
            topics: Mutex::new(HashSet::new()),
            evicted: AtomicBool::new(false),
            evict_notify: Notify::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Session id reported to the client in the `CONNECTED` frame.
    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Moves the state forward. Returns `false` (and changes nothing) when
    /// `next` is not later than the current state.
    pub fn advance(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if next > *state {
            *state = next;
            true
        } else {
            false
        }
    }

    /// Topic names this connection is subscribed to, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.lock().iter().cloned().collect();
        topics.sort();
        topics
    }

    pub(crate) fn track_topic(&self, topic: &str) -> bool {
        self.topics.lock().insert(topic.to_string())
    }

    pub(crate) fn untrack_topic(&self, topic: &str) -> bool {
        self.topics.lock().remove(topic)
    }

    pub(crate) fn clear_topics(&self) -> usize {
        let mut topics = self.topics.lock();
        let count = topics.len();
        topics.clear();
        count
    }

    /// Non-blocking enqueue onto the outbound queue.
    pub fn try_deliver(&self, message: Arc<Message>) -> Result<(), HubError> {
        self.sender.try_send(message).map_err(|e| {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "outbound queue full",
                mpsc::error::TrySendError::Closed(_) => "outbound queue closed",
            };
            HubError::DeliveryFailure {
                connection: self.id,
                reason: reason.to_string(),
            }
        })
    }

    /// Asks the owning handler to drop this connection.
    pub fn evict(&self) {
        if !self.evicted.swap(true, Ordering::SeqCst) {
            self.evict_notify.notify_one();
        }
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    /// Resolves once [`Connection::evict`] has been called.
    pub async fn evicted(&self) {
        loop {
            let notified = self.evict_notify.notified();
            if self.is_evicted() {
                return;
            }
            notified.await;
        }
    }
}
