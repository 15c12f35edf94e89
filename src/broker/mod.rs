//! The `broker` module contains the shared hub state: topics and their
//! subscribers, the routing table, the dispatcher that orders and publishes
//! inbound messages, and the `Broker` facade tying them to the connection
//! registry.

pub mod dispatcher;
pub mod engine;
pub mod message;
pub mod routing;
pub mod table;
pub mod topic;

pub use engine::Broker;
pub use message::{ChatPayload, Message};
pub use table::{DeliveryReport, TopicTable};
