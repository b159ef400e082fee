//! The delivery sweep.
//!
//! One sweep visits every queue and pops exactly as many wrappers as were
//! pending when it reached that queue, so wrappers requeued during the sweep
//! wait for the next one. A wrapper leaves durable storage only once every
//! one of its targets has been reached.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::engine::Broker;
use super::queue::Queue;
use super::wrapper::MessageWrapper;
use crate::persistence::PersistenceError;
use crate::protocol::codec;

/// What happened to the wrapper at the head of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Delivered,
    Requeued,
    CoolingDown,
    /// No targets and no subscribers yet.
    Unaddressed,
    Failed,
    Empty,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub delivered: usize,
    pub requeued: usize,
    pub cooling_down: usize,
    pub unaddressed: usize,
    pub failed: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Delivered => self.delivered += 1,
            Outcome::Requeued => self.requeued += 1,
            Outcome::CoolingDown => self.cooling_down += 1,
            Outcome::Unaddressed => self.unaddressed += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Empty => {}
        }
    }
}

impl Broker {
    /// Run one pass over every queue with pending work.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for queue in self.queue_list() {
            let budget = queue.pending();
            for _ in 0..budget {
                let outcome = self.process_next(&queue, Utc::now()).await;
                if outcome == Outcome::Empty {
                    break;
                }
                report.record(outcome);
            }
        }
        report
    }

    /// Sweep until `shutdown` flips to true, sleeping briefly whenever a
    /// sweep delivered nothing.
    pub async fn run_delivery_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("delivery loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let report = self.sweep().await;
            if report.delivered > 0 {
                continue;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.options.idle_sleep) => {}
            }
        }
        info!("delivery loop stopped");
    }

    pub(crate) async fn process_next(&self, queue: &Queue, now: DateTime<Utc>) -> Outcome {
        let Some(mut wrapper) = queue.dequeue() else {
            return Outcome::Empty;
        };

        if wrapper.is_cooling_down(now, self.options.retry_cooldown) {
            queue.requeue(wrapper);
            return Outcome::CoolingDown;
        }

        if wrapper.targets.is_empty() {
            let subscribers = queue.subscriber_ids();
            if subscribers.is_empty() {
                queue.requeue(wrapper);
                return Outcome::Unaddressed;
            }
            wrapper.targets = subscribers;
        }

        let outcome = match self.try_deliver(&mut wrapper, now).await {
            Ok(true) => {
                info!(
                    queue = %queue.name(),
                    message = %wrapper.id,
                    recipients = wrapper.targets.len(),
                    "message delivered to all recipients"
                );
                return Outcome::Delivered;
            }
            Ok(false) => {
                if wrapper.attempts == 1 {
                    warn!(
                        queue = %queue.name(),
                        message = %wrapper.id,
                        remaining = wrapper.remaining().count(),
                        "partial delivery, will retry"
                    );
                }
                Outcome::Requeued
            }
            Err(e) => {
                error!(queue = %queue.name(), message = %wrapper.id, error = %e, "delivery attempt failed");
                wrapper.last_error = Some(e.to_string());
                wrapper.last_try = Some(now);
                Outcome::Failed
            }
        };

        queue.requeue(wrapper);
        outcome
    }

    /// Push `wrapper` to each remaining target. Returns whether it is complete.
    async fn try_deliver(
        &self,
        wrapper: &mut MessageWrapper,
        now: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        let frame = codec::encode(&wrapper.message);
        let remaining: Vec<_> = wrapper.remaining().collect();

        for target in remaining {
            let Some(conn) = self.connection(target) else {
                debug!(client = %target, message = %wrapper.id, "no live connection");
                continue;
            };
            if !conn.probe().await {
                self.drop_connection(target, &conn);
                continue;
            }
            match conn.send(frame.clone()).await {
                Ok(()) => wrapper.mark_delivered(target),
                Err(e) => debug!(client = %target, error = %e, "send failed"),
            }
        }

        if wrapper.is_complete() {
            self.persistence.delete_message(wrapper)?;
            return Ok(true);
        }

        wrapper.attempts += 1;
        wrapper.last_try = Some(now);
        self.persistence.save_message(wrapper)?;
        Ok(false)
    }
}
