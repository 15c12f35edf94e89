//! The `connection` module defines the representation of a client connection
//! and the registry that tracks every live one.
//!
//! It provides the `Connection` struct, which encapsulates the shared state of
//! a single connected client (id, outbound queue, subscribed topics,
//! lifecycle), and the `ConnectionRegistry` that assigns ids and answers
//! lookups.

#[allow(clippy::module_inception)]
pub mod connection;
pub mod registry;

pub use connection::{
    Connection, ConnectionId, ConnectionState, OutboundReceiver, OutboundSender, outbound_queue,
};
pub use registry::ConnectionRegistry;
