//! The `error` module defines the crate-level error type.
//!
//! Each layer has its own error enum; `Error` wraps them so the binary and
//! library callers can propagate any of them with `?`.

use crate::config::ConfigError;
use crate::persistence::PersistenceError;
use crate::protocol::CodecError;
use crate::transport::TransportError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
