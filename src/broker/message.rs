//! Message definitions for the broker
//!
//! `Message` is the internal representation of one accepted SEND. It is
//! built once by the dispatcher and shared as `Arc<Message>` by every
//! subscriber queue, so fan-out never copies the body.
//!
//! Notes on fields:
//! - `sequence`: arrival order stamped by the dispatcher; it is the only
//!   ordering the hub defines
//! - `sender`: the connection that sent it, `None` for messages injected by
//!   the server itself
//! - `destination`: the application destination the client addressed
//! - `topic`: the broadcast topic resolved from `destination`
//! - `body`: the exact text the client sent; it is forwarded as-is

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sequence: u64,
    pub sender: Option<ConnectionId>,
    pub destination: String,
    pub topic: String,
    pub body: String,
    pub content_type: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        sequence: u64,
        sender: Option<ConnectionId>,
        destination: impl Into<String>,
        topic: impl Into<String>,
        body: impl Into<String>,
        content_type: Option<String>,
    ) -> Self {
        Self {
            sequence,
            sender,
            destination: destination.into(),
            topic: topic.into(),
            body: body.into(),
            content_type,
            received_at: Utc::now(),
        }
    }

    /// Structured view of the body.
    pub fn payload(&self) -> Result<ChatPayload, serde_json::Error> {
        ChatPayload::parse(&self.body)
    }
}

/// The chat record carried in a SEND body.
///
/// `id` may be present with any JSON type; it is neither required nor
/// checked for uniqueness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub sender: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
}

impl ChatPayload {
    pub fn parse(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }
}
