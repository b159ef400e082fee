//! The `client` module is the library side of the protocol.
//!
//! It provides [`Client`], which connects to a broker, announces a
//! [`ClientInfo`], publishes and subscribes, and dispatches received
//! messages to registered callbacks.

pub mod pubsub_client;
pub use pubsub_client::{Client, ClientInfo};
