use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::protocol::codec;
use crate::protocol::{
    Announce, Content, Disconnect, FrameCodec, Header, Message, SubscribeMode, Subscription,
};
use crate::transport::{Connection, ReadLoopOptions, TransportError, read_loop};

/// Identity a client announces when it connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// Unique identifier of the client; every message it sends carries it.
    pub client_id: Uuid,
    pub node_name: String,
    pub service_name: String,
    pub operating_system: String,
    pub client_version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            client_id: Uuid::new_v4(),
            node_name: "Anonymous Node".to_string(),
            service_name: "Anonymous Service".to_string(),
            operating_system: std::env::consts::OS.to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ClientInfo {
    pub fn new(service_name: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            node_name: node_name.into(),
            ..Self::default()
        }
    }

    pub fn to_announce(&self) -> Announce {
        Announce {
            header: Header::new(self.client_id, String::new()),
            service_name: self.service_name.clone(),
            node_name: self.node_name.clone(),
            operating_system: self.operating_system.clone(),
            client_version: self.client_version.clone(),
        }
    }
}

impl From<&Announce> for ClientInfo {
    fn from(announce: &Announce) -> Self {
        Self {
            client_id: announce.header.sender_id,
            node_name: announce.node_name.clone(),
            service_name: announce.service_name.clone(),
            operating_system: announce.operating_system.clone(),
            client_version: announce.client_version.clone(),
        }
    }
}

type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

/// A connection to a broker.
///
/// The client echoes KeepAlives on its own and hands every other received
/// message to the callbacks registered with [`Client::listen`]. A
/// Disconnect reaches the callbacks when the broker side goes away, never
/// for the client's own [`Client::close`].
pub struct Client {
    info: ClientInfo,
    conn: Arc<Connection>,
    handlers: Arc<RwLock<Vec<Handler>>>,
    closing: Arc<AtomicBool>,
    reader: JoinHandle<Result<(), TransportError>>,
}

impl Client {
    /// Connect to `addr` and announce `info`.
    pub async fn connect(addr: impl ToSocketAddrs, info: ClientInfo) -> Result<Self, TransportError> {
        Self::open(addr, info, Vec::new()).await
    }

    /// Like [`Client::connect`], with `handler` registered before the
    /// Announce goes out, so messages the broker pushes right away are not
    /// missed.
    pub async fn connect_with_listener<F>(
        addr: impl ToSocketAddrs,
        info: ClientInfo,
        handler: F,
    ) -> Result<Self, TransportError>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        Self::open(addr, info, vec![handler]).await
    }

    async fn open(
        addr: impl ToSocketAddrs,
        info: ClientInfo,
        handlers: Vec<Handler>,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?.to_string();
        let (read_half, write_half) = stream.into_split();

        let conn = Connection::new(peer, write_half);
        conn.bind(info.clone());

        let handlers = Arc::new(RwLock::new(handlers));
        let closing = Arc::new(AtomicBool::new(false));
        let dispatch = handlers.clone();
        let local_close = closing.clone();
        let reader = tokio::spawn(read_loop(
            conn.clone(),
            read_half,
            FrameCodec::default(),
            ReadLoopOptions {
                echo_keep_alive: true,
            },
            move |message| {
                if matches!(message, Message::Disconnect(_)) && local_close.load(Ordering::Acquire)
                {
                    return;
                }
                // Callbacks may register more callbacks.
                let snapshot = dispatch
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                for handler in &snapshot {
                    handler(&message);
                }
            },
        ));

        let client = Self {
            info,
            conn,
            handlers,
            closing,
            reader,
        };
        client
            .conn
            .send_message(&Message::Announce(client.info.to_announce()))
            .await?;
        debug!(client = %client.id(), peer = %client.conn.peer(), "connected");
        Ok(client)
    }

    pub fn id(&self) -> Uuid {
        self.info.client_id
    }

    pub fn info(&self) -> &ClientInfo {
        &self.info
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Publish and wait until the frame has been written to the socket.
    pub async fn publish(
        &self,
        queue: &str,
        payload: impl Into<Bytes>,
    ) -> Result<Content, TransportError> {
        let content = Content::new(self.id(), queue, payload);
        self.conn
            .send_message(&Message::Content(content.clone()))
            .await?;
        Ok(content)
    }

    /// Publish as part of an existing conversation.
    pub async fn publish_in_conversation(
        &self,
        queue: &str,
        payload: impl Into<Bytes>,
        conversation_id: Uuid,
    ) -> Result<Content, TransportError> {
        let mut content = Content::new(self.id(), queue, payload);
        content.header.conversation_id = conversation_id;
        self.conn
            .send_message(&Message::Content(content.clone()))
            .await?;
        Ok(content)
    }

    /// Queue a publish without waiting for the write.
    pub fn publish_nowait(
        &self,
        queue: &str,
        payload: impl Into<Bytes>,
    ) -> Result<Content, TransportError> {
        let content = Content::new(self.id(), queue, payload);
        self.conn.post_message(&Message::Content(content.clone()))?;
        Ok(content)
    }

    pub async fn subscribe(&self, queue: &str, mode: SubscribeMode) -> Result<(), TransportError> {
        let subscription = Subscription::new(self.id(), queue, mode);
        self.conn
            .send_message(&Message::Subscription(subscription))
            .await
    }

    pub async fn unsubscribe(&self, queue: &str) -> Result<(), TransportError> {
        self.subscribe(queue, SubscribeMode::Remove).await
    }

    /// Register a callback for received messages. Callbacks accumulate.
    pub fn listen<F>(&self, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    pub async fn keep_alive(&self) -> Result<(), TransportError> {
        self.conn.send(codec::keep_alive_frame()).await
    }

    /// Send Disconnect, then release the socket.
    pub async fn close(mut self) -> Result<(), TransportError> {
        let sent = self
            .conn
            .send_message(&Message::Disconnect(Disconnect::new(self.id())))
            .await;
        self.closing.store(true, Ordering::Release);
        self.conn.close();
        match (&mut self.reader).await {
            Ok(Err(e)) => debug!(client = %self.id(), error = %e, "read loop ended with error"),
            Ok(Ok(())) => {}
            Err(e) => debug!(client = %self.id(), error = %e, "read loop task failed"),
        }
        sent
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::Release);
        self.conn.close();
    }
}
