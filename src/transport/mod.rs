//! The `transport` module is responsible for network communication with
//! clients over WebSockets.
//!
//! It defines the STOMP frame codec and the commands carried in frames,
//! validates upgrade requests, runs one handler per connection and hosts the
//! accept loop that ties them to the broker.

pub mod frame;
pub mod handler;
pub mod handshake;
pub mod message;
pub mod websocket;


#[cfg(test)]
mod websocket_tests;
