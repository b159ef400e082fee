//! The `broker` module holds queue state and moves messages from publishers
//! to subscribers.
//!
//! - `queue`: a named FIFO of pending wrappers plus its subscriber set.
//! - `wrapper`: per-message delivery bookkeeping.
//! - `routing`: wildcard matching of queue names.
//! - `engine`: the [`Broker`] dispatcher that owns queues and connections.
//! - `delivery`: the sweep that pushes pending messages out.

pub mod delivery;
pub mod engine;
pub mod queue;
pub mod routing;
pub mod wrapper;

pub use delivery::SweepReport;
pub use engine::{Broker, BrokerOptions, RestoreStats};
pub use queue::{Queue, QueueRecord, Subscriber};
pub use wrapper::MessageWrapper;

#[cfg(test)]
mod tests;
