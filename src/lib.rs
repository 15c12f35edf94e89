//! # ChatHub
//!
//! `chathub` is an in-memory chat broadcast hub. Clients connect over
//! WebSocket, speak a small subset of STOMP, subscribe to topics and send
//! chat messages to application destinations. Every accepted message is
//! routed to a topic and delivered to each current subscriber of that topic
//! in one global arrival order.
//!
//! ## Core Modules
//!
//! - `broker`: topics, routing, ordering and fan-out.
//! - `client`: a STOMP client for smoke tests.
//! - `config`: loads settings from defaults, file and environment.
//! - `connection`: per-connection state and the connection registry.
//! - `transport`: frame codec, handshake checks, connection handlers and the
//!   WebSocket server.
//! - `utils`: error type and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod connection;
pub mod transport;
pub mod utils;
