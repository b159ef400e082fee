use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::watch;
use tokio::time::timeout;
use uuid::Uuid;

use super::delivery::Outcome;
use super::queue::{Queue, QueueRecord};
use super::wrapper::MessageWrapper;
use super::{Broker, BrokerOptions};
use crate::client::ClientInfo;
use crate::persistence::{FilesystemPersistence, MessagePersistence, PersistenceError};
use crate::protocol::{Content, Disconnect, FrameCodec, Message, SubscribeMode, Subscription};
use crate::transport::Connection;

/// Keeps everything in memory and records what the broker asked it to do.
#[derive(Debug, Default)]
struct RecordingPersistence {
    saved: Mutex<Vec<MessageWrapper>>,
    deleted: Mutex<Vec<MessageWrapper>>,
    queues: Mutex<Vec<QueueRecord>>,
    fail_deletes: AtomicBool,
}

impl RecordingPersistence {
    fn deleted_ids(&self) -> Vec<Uuid> {
        self.deleted.lock().unwrap().iter().map(|w| w.id).collect()
    }

    fn last_saved(&self, id: Uuid) -> MessageWrapper {
        self.saved
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|w| w.id == id)
            .cloned()
            .expect("wrapper was saved")
    }
}

impl MessagePersistence for RecordingPersistence {
    fn save_message(&self, wrapper: &MessageWrapper) -> Result<(), PersistenceError> {
        self.saved.lock().unwrap().push(wrapper.clone());
        Ok(())
    }

    fn delete_message(&self, wrapper: &MessageWrapper) -> Result<(), PersistenceError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Io {
                path: PathBuf::from(format!("{}.msg", wrapper.id)),
                source: io::Error::other("disk full"),
            });
        }
        self.deleted.lock().unwrap().push(wrapper.clone());
        Ok(())
    }

    fn save_queue(&self, queue: &QueueRecord) -> Result<(), PersistenceError> {
        self.queues.lock().unwrap().push(queue.clone());
        Ok(())
    }

    fn load_queue(&self, _name: &str) -> Result<Option<QueueRecord>, PersistenceError> {
        Ok(None)
    }

    fn load_messages(&self, _name: &str) -> Result<Vec<MessageWrapper>, PersistenceError> {
        Ok(Vec::new())
    }

    fn queue_names(&self) -> Result<Vec<String>, PersistenceError> {
        Ok(Vec::new())
    }
}

/// The far end of a broker-side connection.
struct Peer {
    id: Uuid,
    conn: Arc<Connection>,
    stream: DuplexStream,
    buf: BytesMut,
}

impl Peer {
    /// Next non-KeepAlive message, or `None` if nothing arrives in time.
    async fn next_message(&mut self, wait: Duration) -> Option<Message> {
        let codec = FrameCodec::default();
        loop {
            while let Some(message) = codec.decode(&mut self.buf).unwrap() {
                if message != Message::KeepAlive {
                    return Some(message);
                }
            }
            match timeout(wait, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(0)) | Err(_) => return None,
                Ok(read) => {
                    read.unwrap();
                }
            }
        }
    }

    async fn expect_content(&mut self) -> Content {
        match self.next_message(Duration::from_secs(1)).await {
            Some(Message::Content(content)) => content,
            other => panic!("expected content, got {other:?}"),
        }
    }

    async fn expect_nothing(&mut self) {
        let next = self.next_message(Duration::from_millis(100)).await;
        assert!(next.is_none(), "unexpected message {next:?}");
    }
}

fn immediate_retry() -> BrokerOptions {
    BrokerOptions {
        retry_cooldown: Duration::ZERO,
        idle_sleep: Duration::from_millis(1),
    }
}

fn recording_broker(options: BrokerOptions) -> (Arc<RecordingPersistence>, Broker) {
    let persistence = Arc::new(RecordingPersistence::default());
    let broker = Broker::new(persistence.clone(), options);
    (persistence, broker)
}

/// Connect a peer and announce it under a fresh client id.
fn connect(broker: &Broker) -> Peer {
    connect_as(broker, Uuid::new_v4())
}

fn connect_as(broker: &Broker, id: Uuid) -> Peer {
    let (server_side, client_side) = tokio::io::duplex(64 * 1024);
    let (_read, write) = tokio::io::split(server_side);
    let conn = Connection::new("test-peer", write);

    let info = ClientInfo {
        client_id: id,
        ..ClientInfo::default()
    };
    broker
        .handle_message(&conn, Message::Announce(info.to_announce()))
        .unwrap();

    Peer {
        id,
        conn,
        stream: client_side,
        buf: BytesMut::new(),
    }
}

fn publish(broker: &Broker, from: &Peer, queue: &str, payload: &'static str) -> Content {
    let content = Content::new(from.id, queue, Bytes::from_static(payload.as_bytes()));
    broker
        .handle_message(&from.conn, Message::Content(content.clone()))
        .unwrap();
    content
}

fn subscribe(broker: &Broker, peer: &Peer, queue: &str, mode: SubscribeMode) {
    let subscription = Subscription::new(peer.id, queue, mode);
    broker
        .handle_message(&peer.conn, Message::Subscription(subscription))
        .unwrap();
}

fn disconnect(broker: &Broker, peer: &Peer) {
    broker
        .handle_message(&peer.conn, Message::Disconnect(Disconnect::new(peer.id)))
        .unwrap();
}

#[test]
fn test_wrapper_tracks_delivery() {
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let message = Message::Content(Content::new(Uuid::nil(), "q", Bytes::new()));
    let mut wrapper = MessageWrapper::new(message, [a, b, a]);

    assert_eq!(wrapper.targets, vec![a, b]);
    wrapper.mark_delivered(Uuid::new_v4());
    wrapper.mark_delivered(a);
    assert!(wrapper.delivered.iter().all(|id| wrapper.targets.contains(id)));
    assert_eq!(wrapper.remaining().collect::<Vec<_>>(), vec![b]);
    assert!(!wrapper.is_complete());

    wrapper.mark_delivered(b);
    assert!(wrapper.is_complete());
}

#[test]
fn test_unaddressed_wrapper_is_never_complete() {
    let message = Message::Content(Content::new(Uuid::nil(), "q", Bytes::new()));
    let wrapper = MessageWrapper::new(message, Vec::<Uuid>::new());
    assert!(!wrapper.is_complete());
    assert!(!wrapper.is_cooling_down(Utc::now(), Duration::from_secs(5)));
}

#[test]
fn test_only_permanent_changes_touch_storage() {
    let persistence = Arc::new(RecordingPersistence::default());
    let queue = Queue::new("q", Uuid::nil(), persistence.clone());
    let temp = Uuid::new_v4();
    let perm = Uuid::new_v4();

    queue.subscribe(temp, SubscribeMode::TemporaryConsumer).unwrap();
    assert!(persistence.queues.lock().unwrap().is_empty());

    queue.subscribe(perm, SubscribeMode::PermanentConsumer).unwrap();
    let saved = persistence.queues.lock().unwrap().last().cloned().unwrap();
    assert_eq!(saved.subscribers.len(), 1);
    assert_eq!(saved.subscribers[0].id, perm);

    assert!(queue.unsubscribe(temp).unwrap());
    assert_eq!(persistence.queues.lock().unwrap().len(), 1);

    queue.subscribe(perm, SubscribeMode::Remove).unwrap();
    assert!(!queue.has_subscribed(perm));
    let saved = persistence.queues.lock().unwrap().last().cloned().unwrap();
    assert!(saved.subscribers.is_empty());
}

#[tokio::test]
async fn test_content_creates_and_persists_queue() {
    let (persistence, broker) = recording_broker(immediate_retry());
    let publisher = connect(&broker);

    publish(&broker, &publisher, "q1", "hello");

    let queue = broker.queue("q1").expect("queue created");
    assert_eq!(queue.pending(), 1);
    assert_eq!(queue.declared_by(), publisher.id);
    assert_eq!(persistence.saved.lock().unwrap().len(), 1);
    assert_eq!(persistence.queues.lock().unwrap()[0].name, "q1");
}

#[tokio::test]
async fn test_end_to_end_publish_then_subscribe() {
    let (persistence, broker) = recording_broker(BrokerOptions::default());
    let publisher = connect(&broker);
    let mut subscriber = connect(&broker);

    let content = publish(&broker, &publisher, "q1", "hello");

    let report = broker.sweep().await;
    assert_eq!(report.delivered, 0);
    assert_eq!(report.unaddressed, 1);
    assert_eq!(broker.queue("q1").unwrap().pending(), 1);
    assert!(persistence.deleted_ids().is_empty());

    subscribe(&broker, &subscriber, "q1", SubscribeMode::TemporaryConsumer);

    let report = broker.sweep().await;
    assert_eq!(report.delivered, 1);
    assert_eq!(broker.queue("q1").unwrap().pending(), 0);

    let received = subscriber.expect_content().await;
    assert_eq!(received, content);

    let deleted = persistence.deleted.lock().unwrap().clone();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].delivered, vec![subscriber.id]);
}

#[tokio::test]
async fn test_requeued_message_goes_behind_older_messages() {
    let (_persistence, broker) = recording_broker(immediate_retry());
    let mut live = connect(&broker);
    subscribe(&broker, &live, "q", SubscribeMode::TemporaryConsumer);
    // Subscribed but never connected.
    let queue = broker.queue("q").unwrap();
    queue
        .subscribe(Uuid::new_v4(), SubscribeMode::TemporaryConsumer)
        .unwrap();

    publish(&broker, &live, "q", "first");
    publish(&broker, &live, "q", "second");
    let ids = queue.pending_ids();

    let outcome = broker.process_next(&queue, Utc::now()).await;
    assert_eq!(outcome, Outcome::Requeued);
    assert_eq!(queue.pending_ids(), vec![ids[1], ids[0]]);
    assert_eq!(live.expect_content().await.payload, "first");
}

#[tokio::test]
async fn test_sweep_is_bounded_by_pending_count() {
    let (persistence, broker) = recording_broker(immediate_retry());
    let publisher = connect(&broker);
    let absent = Uuid::new_v4();
    broker
        .get_or_create_queue("q", publisher.id)
        .unwrap()
        .subscribe(absent, SubscribeMode::TemporaryConsumer)
        .unwrap();

    let content = publish(&broker, &publisher, "q", "x");
    let report = broker.sweep().await;

    assert_eq!(report.requeued, 1);
    let queue = broker.queue("q").unwrap();
    assert_eq!(queue.pending(), 1);
    let id = queue.pending_ids()[0];
    let saved = persistence.last_saved(id);
    assert_eq!(saved.attempts, 1);
    assert_eq!(saved.message, Message::Content(content));
}

#[tokio::test]
async fn test_deleted_only_once_every_target_is_reached() {
    let (persistence, broker) = recording_broker(immediate_retry());
    let mut first = connect(&broker);
    let late = Uuid::new_v4();
    subscribe(&broker, &first, "q", SubscribeMode::TemporaryConsumer);
    broker
        .queue("q")
        .unwrap()
        .subscribe(late, SubscribeMode::PermanentConsumer)
        .unwrap();

    publish(&broker, &first, "q", "payload");

    broker.sweep().await;
    assert!(persistence.deleted_ids().is_empty());
    first.expect_content().await;

    let mut second = connect_as(&broker, late);
    let report = broker.sweep().await;
    assert_eq!(report.delivered, 1);
    assert_eq!(persistence.deleted_ids().len(), 1);

    second.expect_content().await;
    // The first subscriber already had it and must not get it again.
    first.expect_nothing().await;
}

#[tokio::test]
async fn test_retry_waits_for_cooldown() {
    let (persistence, broker) = recording_broker(BrokerOptions::default());
    let publisher = connect(&broker);
    let queue = broker.get_or_create_queue("q", publisher.id).unwrap();
    queue
        .subscribe(Uuid::new_v4(), SubscribeMode::TemporaryConsumer)
        .unwrap();
    publish(&broker, &publisher, "q", "x");
    let id = queue.pending_ids()[0];

    let start = Utc::now();
    assert_eq!(broker.process_next(&queue, start).await, Outcome::Requeued);
    assert_eq!(persistence.last_saved(id).attempts, 1);

    let early = start + chrono::Duration::seconds(1);
    assert_eq!(broker.process_next(&queue, early).await, Outcome::CoolingDown);
    assert_eq!(persistence.last_saved(id).attempts, 1);

    let later = start + chrono::Duration::seconds(6);
    assert_eq!(broker.process_next(&queue, later).await, Outcome::Requeued);
    let saved = persistence.last_saved(id);
    assert_eq!(saved.attempts, 2);
    assert_eq!(saved.last_try, Some(later));
}

#[tokio::test]
async fn test_failed_delete_is_recorded_and_retried() {
    let (persistence, broker) = recording_broker(BrokerOptions::default());
    let mut subscriber = connect(&broker);
    subscribe(&broker, &subscriber, "q", SubscribeMode::TemporaryConsumer);
    publish(&broker, &subscriber, "q", "x");
    let queue = broker.queue("q").unwrap();

    persistence.fail_deletes.store(true, Ordering::SeqCst);
    let start = Utc::now();
    assert_eq!(broker.process_next(&queue, start).await, Outcome::Failed);
    subscriber.expect_content().await;

    let wrapper = queue.dequeue().unwrap();
    assert!(wrapper.last_error.as_deref().unwrap().contains("disk full"));
    assert_eq!(wrapper.last_try, Some(start));
    assert_eq!(wrapper.delivered, vec![subscriber.id]);
    queue.requeue(wrapper);

    persistence.fail_deletes.store(false, Ordering::SeqCst);
    let later = start + chrono::Duration::seconds(6);
    assert_eq!(broker.process_next(&queue, later).await, Outcome::Delivered);
    assert_eq!(persistence.deleted_ids().len(), 1);
    subscriber.expect_nothing().await;
}

#[tokio::test]
async fn test_wildcard_fans_out_to_matching_queues() {
    let (_persistence, broker) = recording_broker(immediate_retry());
    let publisher = connect(&broker);
    for name in ["orders.eu", "orders.us", "orders.eu1", "billing.eu"] {
        broker.get_or_create_queue(name, publisher.id).unwrap();
    }

    let mut content = Content::new(publisher.id, "orders.*", Bytes::from_static(b"fan"));
    content.topic = "t".to_string();
    broker
        .handle_message(&publisher.conn, Message::Content(content.clone()))
        .unwrap();

    for name in ["orders.eu", "orders.us"] {
        let queue = broker.queue(name).unwrap();
        let wrapper = queue.dequeue().expect("cloned message");
        let Message::Content(clone) = wrapper.message else {
            panic!("expected content");
        };
        assert_eq!(clone.header.queue_name, name);
        assert_eq!(clone.header.conversation_id, content.header.conversation_id);
        assert_eq!(clone.header.sender_id, content.header.sender_id);
        assert_eq!(clone.header.created, content.header.created);
        assert_eq!(clone.payload, content.payload);
        assert_eq!(clone.topic, "t");
    }
    assert_eq!(broker.queue("orders.eu1").unwrap().pending(), 0);
    assert_eq!(broker.queue("billing.eu").unwrap().pending(), 0);

    // The literal pattern-named queue also gets the raw message.
    let literal = broker.queue("orders.*").expect("literal queue created");
    assert_eq!(literal.pending(), 1);
    assert_eq!(literal.dequeue().unwrap().message.queue_name(), "orders.*");
}

#[tokio::test]
async fn test_disconnect_keeps_only_permanent_subscriptions() {
    let (_persistence, broker) = recording_broker(immediate_retry());
    let peer = connect(&broker);
    subscribe(&broker, &peer, "temp", SubscribeMode::TemporaryConsumer);
    subscribe(&broker, &peer, "perm", SubscribeMode::PermanentConsumer);

    disconnect(&broker, &peer);

    assert!(!broker.queue("temp").unwrap().has_subscribed(peer.id));
    assert!(broker.queue("perm").unwrap().is_permanent_subscriber(peer.id));
    assert!(broker.connection(peer.id).is_none());
    assert!(!peer.conn.is_connected());
}

#[tokio::test]
async fn test_stale_connection_disconnect_keeps_new_session() {
    let (_persistence, broker) = recording_broker(immediate_retry());
    let old = connect(&broker);
    let new = connect_as(&broker, old.id);
    subscribe(&broker, &new, "q", SubscribeMode::TemporaryConsumer);

    disconnect(&broker, &old);

    assert!(broker.queue("q").unwrap().has_subscribed(new.id));
    let live = broker.connection(new.id).expect("new connection registered");
    assert!(Arc::ptr_eq(&live, &new.conn));
    assert!(new.conn.is_connected());
}

#[tokio::test]
async fn test_remove_on_unknown_queue_does_not_create_it() {
    let (persistence, broker) = recording_broker(immediate_retry());
    let peer = connect(&broker);

    subscribe(&broker, &peer, "ghost", SubscribeMode::Remove);

    assert!(broker.queue("ghost").is_none());
    assert!(persistence.queues.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_dead_connection_is_dropped_and_message_kept() {
    let (persistence, broker) = recording_broker(immediate_retry());
    let publisher = connect(&broker);
    let gone = connect(&broker);
    subscribe(&broker, &gone, "q", SubscribeMode::PermanentConsumer);
    let gone_id = gone.id;
    drop(gone.stream);

    publish(&broker, &publisher, "q", "x");
    let report = broker.sweep().await;

    assert_eq!(report.requeued, 1);
    assert!(broker.connection(gone_id).is_none());
    assert!(persistence.deleted_ids().is_empty());
    assert_eq!(broker.queue("q").unwrap().pending(), 1);
}

#[tokio::test]
async fn test_permanent_subscription_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("queues");

    let first = Broker::new(
        Arc::new(FilesystemPersistence::new(&path)),
        immediate_retry(),
    );
    let durable = connect(&first);
    let transient = connect(&first);
    subscribe(&first, &durable, "q", SubscribeMode::PermanentConsumer);
    subscribe(&first, &transient, "q", SubscribeMode::TemporaryConsumer);
    let content = publish(&first, &transient, "q", "kept");
    drop(first);

    let restarted = Broker::new(
        Arc::new(FilesystemPersistence::new(&path)),
        immediate_retry(),
    );
    let stats = restarted.restore().unwrap();
    assert_eq!(stats.queues, 1);
    assert_eq!(stats.messages, 1);
    assert_eq!(stats.subscribers, 1);

    let queue = restarted.queue("q").unwrap();
    assert!(queue.is_permanent_subscriber(durable.id));
    assert!(!queue.has_subscribed(transient.id));

    let wrapper = queue.dequeue().unwrap();
    assert_eq!(wrapper.message, Message::Content(content));
    assert_eq!(wrapper.targets.len(), 2);
}

#[test]
fn test_concurrent_permanent_subscribes_are_all_stored() {
    let dir = tempdir().unwrap();
    let persistence = Arc::new(FilesystemPersistence::new(dir.path()));
    let queue = Queue::new("q", Uuid::nil(), persistence.clone());
    let ids: Vec<Uuid> = (0..16).map(|_| Uuid::new_v4()).collect();

    std::thread::scope(|scope| {
        for id in &ids {
            let queue = &queue;
            scope.spawn(move || {
                queue
                    .subscribe(*id, SubscribeMode::PermanentConsumer)
                    .unwrap()
            });
        }
    });

    let stored = persistence.load_queue("q").unwrap().unwrap();
    let mut stored_ids: Vec<Uuid> = stored.subscribers.iter().map(|s| s.id).collect();
    let mut expected = ids.clone();
    stored_ids.sort();
    expected.sort();
    assert_eq!(stored_ids, expected);

    let leftovers = std::fs::read_dir(dir.path().join("q"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().to_string_lossy().ends_with(".tmp"))
        .count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_delivery_loop_stops_on_shutdown() {
    let (_persistence, broker) = recording_broker(immediate_retry());
    let broker = Arc::new(broker);
    let mut subscriber = connect(&broker);
    subscribe(&broker, &subscriber, "q", SubscribeMode::TemporaryConsumer);

    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(broker.clone().run_delivery_loop(stop_rx));

    publish(&broker, &subscriber, "q", "looped");
    assert_eq!(subscriber.expect_content().await.payload, "looped");

    stop_tx.send_replace(true);
    timeout(Duration::from_secs(1), handle)
        .await
        .expect("delivery loop stopped")
        .unwrap();
}

#[tokio::test]
async fn test_purge_drops_and_deletes_pending() {
    let (persistence, broker) = recording_broker(immediate_retry());
    let publisher = connect(&broker);
    publish(&broker, &publisher, "q", "a");
    publish(&broker, &publisher, "q", "b");
    let queue = broker.queue("q").unwrap();
    let ids = queue.pending_ids();

    assert_eq!(queue.purge().unwrap(), 2);
    assert_eq!(queue.pending(), 0);
    assert_eq!(persistence.deleted_ids(), ids);
}
