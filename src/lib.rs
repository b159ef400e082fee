//! # TideMQ
//!
//! `tidemq` is a lightweight publish/subscribe broker built with Rust.
//! Clients connect over TCP and exchange length-delimited binary frames;
//! the broker keeps named queues, persists pending messages and permanent
//! subscriptions to disk, and retries delivery until every subscriber has
//! received a message.
//!
//! ## Core Modules
//!
//! - `protocol`: Message variants and the binary frame codec.
//! - `broker`: Queues, wildcard routing, the dispatcher and the delivery sweep.
//! - `persistence`: Storage trait and the filesystem adapter.
//! - `transport`: Per-socket connection handling and the TCP server.
//! - `client`: Client library used by applications and the CLI.
//! - `config`: Layered settings from defaults, file and environment.
//! - `utils`: Crate error type and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use utils::error::{Error, Result};
