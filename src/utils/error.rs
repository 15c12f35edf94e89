//! The `error` module defines the error taxonomy used throughout `chathub`.
//!
//! Every per-connection failure is contained to that connection: handlers log
//! the error, close their own socket and never propagate into the shared
//! broker state. Only the variants at the bottom (`Config`, `Io`, `WebSocket`)
//! surface at the process edge.

use thiserror::Error;

use crate::connection::ConnectionId;
use crate::transport::frame::DecodeError;

#[derive(Debug, Error)]
pub enum HubError {
    /// Upgrade refused (bad origin, wrong path, hub at capacity). The
    /// connection was never registered.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// Malformed frame or payload from a single client.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// A single subscriber could not accept a message.
    #[error("delivery to {connection} failed: {reason}")]
    DeliveryFailure {
        connection: ConnectionId,
        reason: String,
    },

    /// Internal bookkeeping mismatch; callers treat it as a no-op.
    #[error("registry inconsistency: {0}")]
    RegistryInconsistency(String),

    #[error("connection {0} not found")]
    ConnectionNotFound(ConnectionId),

    #[error("connection limit of {limit} reached")]
    CapacityExceeded { limit: usize },

    #[error("no route for destination '{0}'")]
    Unroutable(String),

    #[error("invalid route '{pattern}': {reason}")]
    InvalidRoute { pattern: String, reason: String },

    /// The server answered with something the client did not expect.
    #[error("unexpected server frame: {0}")]
    UnexpectedFrame(String),

    #[error("connection closed by peer")]
    Closed,

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),
}
