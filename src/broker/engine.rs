use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::queue::Queue;
use crate::broker::routing;
use crate::client::ClientInfo;
use crate::config::BrokerSettings;
use crate::persistence::{FilesystemPersistence, MessagePersistence, PersistenceError};
use crate::protocol::{Announce, Content, Disconnect, Message, SubscribeMode, Subscription};
use crate::transport::Connection;

/// Delivery tuning for a [`Broker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerOptions {
    /// Minimum spacing between two delivery attempts of the same message.
    pub retry_cooldown: Duration,
    /// How long the delivery loop sleeps after a sweep that delivered nothing.
    pub idle_sleep: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            retry_cooldown: Duration::from_secs(5),
            idle_sleep: Duration::from_millis(1),
        }
    }
}

impl From<&BrokerSettings> for BrokerOptions {
    fn from(settings: &BrokerSettings) -> Self {
        Self {
            retry_cooldown: Duration::from_secs(settings.retry_cooldown_secs),
            idle_sleep: Duration::from_millis(settings.idle_sleep_ms),
        }
    }
}

/// Totals reported by [`Broker::restore`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RestoreStats {
    pub queues: usize,
    pub messages: usize,
    pub subscribers: usize,
}

/// Owns every queue and every live connection.
///
/// Connection tasks call [`Broker::handle_message`] for each decoded message;
/// one delivery loop pushes pending messages out to subscribers. Both
/// registries are concurrent maps, so unrelated queues never share a lock.
#[derive(Debug)]
pub struct Broker {
    pub(super) queues: DashMap<String, Arc<Queue>>,
    pub(super) clients: DashMap<Uuid, Arc<Connection>>,
    pub(super) persistence: Arc<dyn MessagePersistence>,
    pub(super) options: BrokerOptions,
}

impl Broker {
    pub fn new(persistence: Arc<dyn MessagePersistence>, options: BrokerOptions) -> Self {
        Self {
            queues: DashMap::new(),
            clients: DashMap::new(),
            persistence,
            options,
        }
    }

    /// Broker backed by the filesystem adapter rooted at `settings.data_dir`.
    pub fn from_settings(settings: &BrokerSettings) -> Self {
        let persistence = Arc::new(FilesystemPersistence::new(&settings.data_dir));
        Self::new(persistence, BrokerOptions::from(settings))
    }

    pub fn options(&self) -> BrokerOptions {
        self.options
    }

    /// Load every stored queue and its pending messages.
    ///
    /// Nothing is written back. A queue that fails to load is logged and
    /// skipped so one corrupt directory does not keep the broker down.
    pub fn restore(&self) -> Result<RestoreStats, PersistenceError> {
        let mut stats = RestoreStats::default();

        for name in self.persistence.queue_names()? {
            let queue = match self.load_queue(&name) {
                Ok(queue) => queue,
                Err(e) => {
                    error!(queue = %name, error = %e, "failed to restore queue");
                    continue;
                }
            };
            stats.queues += 1;
            stats.messages += queue.pending();
            stats.subscribers += queue.subscriber_ids().len();
            self.queues.insert(name, Arc::new(queue));
        }

        info!(
            queues = stats.queues,
            messages = stats.messages,
            subscribers = stats.subscribers,
            "restored persisted state"
        );
        Ok(stats)
    }

    fn load_queue(&self, name: &str) -> Result<Queue, PersistenceError> {
        let queue = match self.persistence.load_queue(name)? {
            Some(record) => Queue::restore(record, self.persistence.clone()),
            None => Queue::new(name, Uuid::nil(), self.persistence.clone()),
        };
        for wrapper in self.persistence.load_messages(name)? {
            queue.requeue(wrapper);
        }
        Ok(queue)
    }

    /// Dispatch one message received on `conn`.
    pub fn handle_message(
        &self,
        conn: &Arc<Connection>,
        message: Message,
    ) -> Result<(), PersistenceError> {
        match message {
            Message::Content(content) => self.on_content(content),
            Message::Subscription(subscription) => self.on_subscription(subscription),
            Message::Announce(announce) => {
                self.on_announce(conn, &announce);
                Ok(())
            }
            Message::Disconnect(disconnect) => self.on_disconnect(conn, &disconnect),
            Message::KeepAlive => Ok(()),
        }
    }

    fn on_content(&self, content: Content) -> Result<(), PersistenceError> {
        let name = content.header.queue_name.clone();

        if routing::is_pattern(&name) {
            let matched = self.queues_matching(&name);
            info!(pattern = %name, matched = matched.len(), "wildcard fan-out");
            for queue in matched {
                let mut clone = content.clone();
                clone.header.queue_name = queue.name().to_string();
                queue.enqueue(Message::Content(clone))?;
            }
        }

        // The literal queue is always written to, pattern or not.
        let queue = self.get_or_create_queue(&name, content.header.sender_id)?;
        let id = queue.enqueue(Message::Content(content))?;
        debug!(queue = %name, message = %id, "message enqueued");
        Ok(())
    }

    fn on_subscription(&self, subscription: Subscription) -> Result<(), PersistenceError> {
        let name = subscription.header.queue_name;
        let sender = subscription.header.sender_id;

        if subscription.mode == SubscribeMode::Remove {
            if let Some(queue) = self.queue(&name) {
                if queue.unsubscribe(sender)? {
                    info!(queue = %name, client = %sender, "unsubscribed");
                }
            }
            return Ok(());
        }

        let queue = self.get_or_create_queue(&name, sender)?;
        queue.subscribe(sender, subscription.mode)?;
        info!(queue = %name, client = %sender, mode = ?subscription.mode, "subscribed");
        Ok(())
    }

    fn on_announce(&self, conn: &Arc<Connection>, announce: &Announce) {
        let info = ClientInfo::from(announce);
        let client_id = info.client_id;
        info!(
            client = %client_id,
            peer = %conn.peer(),
            node = %info.node_name,
            service = %info.service_name,
            os = %info.operating_system,
            version = %info.client_version,
            "client announced"
        );
        conn.bind(info);
        self.clients.insert(client_id, conn.clone());
    }

    fn on_disconnect(
        &self,
        conn: &Arc<Connection>,
        disconnect: &Disconnect,
    ) -> Result<(), PersistenceError> {
        conn.close();

        let sender = disconnect.header.sender_id;
        let Some(client_id) = conn.client_id().or((!sender.is_nil()).then_some(sender)) else {
            debug!(peer = %conn.peer(), "anonymous connection closed");
            return Ok(());
        };

        let registered_here = self
            .clients
            .remove_if(&client_id, |_, registered| Arc::ptr_eq(registered, conn))
            .is_some();
        if !registered_here && self.clients.contains_key(&client_id) {
            debug!(client = %client_id, "stale connection closed, client is connected elsewhere");
            return Ok(());
        }

        for queue in self.queue_list() {
            if queue.has_subscribed(client_id) && !queue.is_permanent_subscriber(client_id) {
                queue.unsubscribe(client_id)?;
            }
        }
        info!(client = %client_id, peer = %conn.peer(), "client disconnected");
        Ok(())
    }

    /// Return the named queue, creating and persisting it on first use.
    pub fn get_or_create_queue(
        &self,
        name: &str,
        declared_by: Uuid,
    ) -> Result<Arc<Queue>, PersistenceError> {
        if let Some(queue) = self.queue(name) {
            return Ok(queue);
        }

        match self.queues.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let queue = Arc::new(Queue::new(name, declared_by, self.persistence.clone()));
                self.persistence.save_queue(&queue.record())?;
                entry.insert(queue.clone());
                info!(queue = %name, declared_by = %declared_by, "queue created");
                Ok(queue)
            }
        }
    }

    pub fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(name).map(|entry| entry.value().clone())
    }

    /// Existing queues whose name matches the wildcard `pattern`.
    pub fn queues_matching(&self, pattern: &str) -> Vec<Arc<Queue>> {
        self.queues
            .iter()
            .filter(|entry| routing::matches(pattern, entry.key()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Snapshot of the queue registry. Never hold map guards across an await.
    pub(super) fn queue_list(&self) -> Vec<Arc<Queue>> {
        self.queues.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn connection(&self, client_id: Uuid) -> Option<Arc<Connection>> {
        self.clients.get(&client_id).map(|entry| entry.value().clone())
    }

    pub fn connection_count(&self) -> usize {
        self.clients.len()
    }

    /// Forget `conn` as the live connection of `client_id` and close it.
    pub fn drop_connection(&self, client_id: Uuid, conn: &Arc<Connection>) {
        if self
            .clients
            .remove_if(&client_id, |_, registered| Arc::ptr_eq(registered, conn))
            .is_some()
        {
            warn!(client = %client_id, "dropping dead connection");
        }
        conn.close();
    }

    /// Close every live connection.
    pub fn close_all(&self) {
        for entry in self.clients.iter() {
            entry.value().close();
        }
        self.clients.clear();
    }
}
