//! The `transport` module carries frames over TCP.
//!
//! `connection` wraps one stream: a writer task for outbound frames and the
//! read loop that decodes inbound frames, used the same way by the server
//! and by the client library. `server` accepts sockets and hands each
//! decoded message to the broker.

pub mod connection;
pub mod server;

pub use connection::{Connection, ReadLoopOptions, read_loop};
pub use server::Server;

use crate::protocol::CodecError;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Codec(#[from] CodecError),
    #[error("connection closed")]
    Closed,
}
