//! The `persistence` module stores queue metadata and in-flight messages so
//! that permanent subscriptions and undelivered messages survive a restart.
//!
//! The broker only talks to the [`MessagePersistence`] trait; the
//! filesystem-backed [`FilesystemPersistence`] is the shipped adapter.
//! Writes happen synchronously on whichever task triggers them. There is no
//! transaction spanning the in-memory change and the durable write.

pub mod fs_store;

use std::path::PathBuf;

use crate::broker::queue::QueueRecord;
use crate::broker::wrapper::MessageWrapper;
use crate::protocol::CodecError;

pub use fs_store::FilesystemPersistence;

#[derive(thiserror::Error, Debug)]
pub enum PersistenceError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("stored message could not be decoded: {0}")]
    Codec(#[from] CodecError),
    #[error("corrupt record {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("queue name {0:?} cannot be stored")]
    InvalidQueueName(String),
}

pub trait MessagePersistence: Send + Sync + std::fmt::Debug {
    fn save_message(&self, wrapper: &MessageWrapper) -> Result<(), PersistenceError>;
    fn delete_message(&self, wrapper: &MessageWrapper) -> Result<(), PersistenceError>;
    fn save_queue(&self, queue: &QueueRecord) -> Result<(), PersistenceError>;
    fn load_queue(&self, name: &str) -> Result<Option<QueueRecord>, PersistenceError>;
    fn load_messages(&self, name: &str) -> Result<Vec<MessageWrapper>, PersistenceError>;
    fn queue_names(&self) -> Result<Vec<String>, PersistenceError>;
}
