//! Queue management
//!
//! A `Queue` is a named buffer of pending [`MessageWrapper`]s plus the set of
//! subscribers it delivers to. Both halves are safe to mutate concurrently:
//! subscribers live in a `DashMap` and the pending buffer behind its own
//! mutex, so connection tasks (producers) and the delivery loop (consumer)
//! never contend on a broker-wide lock.
//!
//! Only `PermanentConsumer` subscriptions are durable. Changing one rewrites
//! the queue record through the persistence adapter; temporary subscribers
//! never touch storage.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::broker::wrapper::MessageWrapper;
use crate::persistence::{MessagePersistence, PersistenceError};
use crate::protocol::{Message, SubscribeMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscriber {
    pub id: Uuid,
    pub mode: SubscribeMode,
}

/// The durable part of a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRecord {
    pub name: String,
    pub declared_by: Uuid,
    pub subscribers: Vec<Subscriber>,
}

#[derive(Debug)]
pub struct Queue {
    name: String,
    declared_by: Uuid,
    subscribers: DashMap<Uuid, SubscribeMode>,
    pending: Mutex<VecDeque<MessageWrapper>>,
    /// Serializes record snapshots with their writes.
    record_lock: Mutex<()>,
    persistence: Arc<dyn MessagePersistence>,
}

impl Queue {
    pub fn new(
        name: impl Into<String>,
        declared_by: Uuid,
        persistence: Arc<dyn MessagePersistence>,
    ) -> Self {
        Self {
            name: name.into(),
            declared_by,
            subscribers: DashMap::new(),
            pending: Mutex::new(VecDeque::new()),
            record_lock: Mutex::new(()),
            persistence,
        }
    }

    /// Rebuild a queue from its stored record without writing it back.
    pub fn restore(record: QueueRecord, persistence: Arc<dyn MessagePersistence>) -> Self {
        let queue = Self::new(record.name, record.declared_by, persistence);
        for subscriber in record.subscribers {
            queue.subscribers.insert(subscriber.id, subscriber.mode);
        }
        queue
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declared_by(&self) -> Uuid {
        self.declared_by
    }

    pub fn pending(&self) -> usize {
        self.buffer().len()
    }

    pub fn record(&self) -> QueueRecord {
        let mut subscribers: Vec<Subscriber> = self
            .subscribers
            .iter()
            .filter(|entry| entry.value().is_permanent())
            .map(|entry| Subscriber {
                id: *entry.key(),
                mode: *entry.value(),
            })
            .collect();
        subscribers.sort_by_key(|s| s.id);

        QueueRecord {
            name: self.name.clone(),
            declared_by: self.declared_by,
            subscribers,
        }
    }

    /// Add or update a subscription. `Remove` is treated as an unsubscribe.
    pub fn subscribe(&self, id: Uuid, mode: SubscribeMode) -> Result<(), PersistenceError> {
        if mode == SubscribeMode::Remove {
            return self.unsubscribe(id).map(|_| ());
        }

        let previous = self.subscribers.insert(id, mode);
        let was_permanent = previous.is_some_and(SubscribeMode::is_permanent);
        debug!(queue = %self.name, subscriber = %id, ?mode, "subscribed");

        if mode.is_permanent() || was_permanent {
            self.save_record()?;
        }
        Ok(())
    }

    /// Returns whether `id` was subscribed.
    pub fn unsubscribe(&self, id: Uuid) -> Result<bool, PersistenceError> {
        let Some((_, mode)) = self.subscribers.remove(&id) else {
            return Ok(false);
        };
        debug!(queue = %self.name, subscriber = %id, "unsubscribed");

        if mode.is_permanent() {
            self.save_record()?;
        }
        Ok(true)
    }

    pub fn has_subscribed(&self, id: Uuid) -> bool {
        self.subscribers.contains_key(&id)
    }

    pub fn is_permanent_subscriber(&self, id: Uuid) -> bool {
        self.subscribers
            .get(&id)
            .is_some_and(|mode| mode.is_permanent())
    }

    pub fn subscriber_ids(&self) -> Vec<Uuid> {
        self.subscribers.iter().map(|entry| *entry.key()).collect()
    }

    /// Wrap `message` for the current subscribers, persist it and queue it.
    pub fn enqueue(&self, message: Message) -> Result<Uuid, PersistenceError> {
        let wrapper = MessageWrapper::new(message, self.subscriber_ids());
        let id = wrapper.id;
        self.enqueue_wrapper(wrapper)?;
        Ok(id)
    }

    /// Persist first; the wrapper is only queued once it is durable.
    pub fn enqueue_wrapper(&self, wrapper: MessageWrapper) -> Result<(), PersistenceError> {
        self.persistence.save_message(&wrapper)?;
        self.buffer().push_back(wrapper);
        Ok(())
    }

    /// Put a wrapper back at the tail without touching storage.
    pub fn requeue(&self, wrapper: MessageWrapper) {
        self.buffer().push_back(wrapper);
    }

    pub fn dequeue(&self) -> Option<MessageWrapper> {
        self.buffer().pop_front()
    }

    /// Ids of pending wrappers in FIFO order.
    pub fn pending_ids(&self) -> Vec<Uuid> {
        self.buffer().iter().map(|w| w.id).collect()
    }

    /// Drop every pending message, deleting each from storage.
    pub fn purge(&self) -> Result<usize, PersistenceError> {
        let drained: Vec<MessageWrapper> = self.buffer().drain(..).collect();
        for wrapper in &drained {
            self.persistence.delete_message(wrapper)?;
        }
        Ok(drained.len())
    }

    /// Snapshot and write under one lock, so an older snapshot can never
    /// land on top of a newer one.
    fn save_record(&self) -> Result<(), PersistenceError> {
        let _guard = self
            .record_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.persistence.save_queue(&self.record())
    }

    fn buffer(&self) -> MutexGuard<'_, VecDeque<MessageWrapper>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
