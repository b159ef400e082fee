//! Delivery-tracking record around a queued message.
//!
//! `delivered` is always a subset of `targets`; a wrapper is complete once
//! every target has been reached and only then may it leave durable storage.

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::protocol::Message;

#[derive(Debug, Clone)]
pub struct MessageWrapper {
    pub id: Uuid,
    pub message: Message,
    pub targets: Vec<Uuid>,
    pub delivered: Vec<Uuid>,
    pub last_try: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl MessageWrapper {
    pub fn new(message: Message, targets: impl IntoIterator<Item = Uuid>) -> Self {
        Self::with_id(Uuid::new_v4(), message, targets)
    }

    pub fn with_id(id: Uuid, message: Message, targets: impl IntoIterator<Item = Uuid>) -> Self {
        let mut unique = Vec::new();
        for target in targets {
            if !unique.contains(&target) {
                unique.push(target);
            }
        }
        Self {
            id,
            message,
            targets: unique,
            delivered: Vec::new(),
            last_try: None,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn queue_name(&self) -> &str {
        self.message.queue_name()
    }

    /// Targets not yet reached.
    pub fn remaining(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.targets
            .iter()
            .copied()
            .filter(|t| !self.delivered.contains(t))
    }

    pub fn is_complete(&self) -> bool {
        !self.targets.is_empty() && self.remaining().next().is_none()
    }

    /// Records a successful send. Ids outside `targets` are ignored.
    pub fn mark_delivered(&mut self, id: Uuid) {
        if self.targets.contains(&id) && !self.delivered.contains(&id) {
            self.delivered.push(id);
        }
    }

    /// True while the last attempt is more recent than `cooldown`.
    /// A message never attempted is always eligible.
    pub fn is_cooling_down(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        match self.last_try {
            Some(last_try) => match chrono::Duration::from_std(cooldown) {
                Ok(cooldown) => now - last_try < cooldown,
                Err(_) => true,
            },
            None => false,
        }
    }
}
