//! The `client` module provides `HubClient`, a STOMP-over-WebSocket client
//! for talking to a running hub from the command line and from tests.

pub mod hub_client;
pub use hub_client::HubClient;
