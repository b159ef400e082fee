//! A framed, bidirectional byte stream shared by the server and the client.
//!
//! Writes go through a dedicated writer task fed by an unbounded channel, so
//! the read loop and the delivery loop can both push frames without holding
//! the socket. [`read_loop`] is the single reader used on both ends.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;
use uuid::Uuid;

use super::TransportError;
use crate::client::ClientInfo;
use crate::protocol::codec::{self, FrameCodec};
use crate::protocol::{Disconnect, Message};

const READ_CHUNK: usize = 8 * 1024;

struct Outbound {
    frame: Bytes,
    done: Option<oneshot::Sender<io::Result<()>>>,
}

#[derive(Debug)]
pub struct Connection {
    id: Uuid,
    peer: String,
    info: RwLock<Option<ClientInfo>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    connected: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl Connection {
    /// Wrap the write half of a stream and spawn its writer task.
    pub fn new<W>(peer: impl Into<String>, writer: W) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(true));
        let peer = peer.into();

        tokio::spawn(write_loop(
            writer,
            rx,
            shutdown_rx,
            connected.clone(),
            peer.clone(),
        ));

        Arc::new(Self {
            id: Uuid::new_v4(),
            peer,
            info: RwLock::new(None),
            outbound,
            connected,
            shutdown,
        })
    }

    /// Connection-local id, distinct from the announced client id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Write a frame and wait for the socket write to finish.
    pub async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        let (done, rx) = oneshot::channel();
        self.outbound
            .send(Outbound {
                frame,
                done: Some(done),
            })
            .map_err(|_| TransportError::Closed)?;

        match rx.await {
            Ok(result) => result.map_err(TransportError::from),
            Err(_) => Err(TransportError::Closed),
        }
    }

    /// Queue a frame for writing without waiting.
    pub fn post(&self, frame: Bytes) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(Outbound { frame, done: None })
            .map_err(|_| TransportError::Closed)
    }

    pub async fn send_message(&self, message: &Message) -> Result<(), TransportError> {
        self.send(codec::encode(message)).await
    }

    pub fn post_message(&self, message: &Message) -> Result<(), TransportError> {
        self.post(codec::encode(message))
    }

    /// Liveness probe: a KeepAlive must reach the socket and the connection
    /// must still be marked connected afterwards.
    pub async fn probe(&self) -> bool {
        self.send(codec::keep_alive_frame()).await.is_ok() && self.is_connected()
    }

    /// Stop the writer task and release the write half. Idempotent.
    pub fn close(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            debug!(peer = %self.peer, connection = %self.id, "closing connection");
        }
        self.shutdown.send_replace(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn bind(&self, info: ClientInfo) {
        *self.info.write().unwrap_or_else(PoisonError::into_inner) = Some(info);
    }

    pub fn info(&self) -> Option<ClientInfo> {
        self.info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Client id from the peer's Announce, if it has sent one.
    pub fn client_id(&self) -> Option<Uuid> {
        self.info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|info| info.client_id)
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut shutdown: watch::Receiver<bool>,
    connected: Arc<AtomicBool>,
    peer: String,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            next = rx.recv() => {
                let Some(Outbound { frame, done }) = next else {
                    break;
                };
                let result = match writer.write_all(&frame).await {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                };
                let failed = result.is_err();
                if let Err(e) = &result {
                    debug!(peer = %peer, error = %e, "write failed");
                    connected.store(false, Ordering::Release);
                }
                if let Some(done) = done {
                    let _ = done.send(result);
                }
                if failed {
                    break;
                }
            }
        }
    }

    connected.store(false, Ordering::Release);
    let _ = writer.shutdown().await;
    debug!(peer = %peer, "send loop closed");
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadLoopOptions {
    /// Answer each received KeepAlive with a KeepAlive.
    pub echo_keep_alive: bool,
}

/// Read frames from `reader` until the peer goes away, the connection is
/// closed, or a fatal decode error occurs.
///
/// Every decoded message except KeepAlive is passed to `handler`. If the
/// stream ends without the peer having sent a Disconnect, a synthetic one is
/// handed to `handler` so the owner can clean up. The connection is closed
/// on return.
pub async fn read_loop<R, F>(
    conn: Arc<Connection>,
    mut reader: R,
    codec: FrameCodec,
    options: ReadLoopOptions,
    mut handler: F,
) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
    F: FnMut(Message),
{
    let mut shutdown = conn.shutdown_signal();
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut peer_disconnected = false;

    let result = 'read: loop {
        if *shutdown.borrow() {
            break 'read Ok(());
        }

        buf.reserve(READ_CHUNK);
        let read = tokio::select! {
            _ = shutdown.changed() => None,
            read = reader.read_buf(&mut buf) => Some(read),
        };
        match read {
            None | Some(Ok(0)) => break 'read Ok(()),
            Some(Ok(_)) => {}
            Some(Err(e)) => break 'read Err(TransportError::from(e)),
        }

        loop {
            match codec.decode(&mut buf) {
                Ok(Some(Message::KeepAlive)) => {
                    if options.echo_keep_alive {
                        let _ = conn.post(codec::keep_alive_frame());
                    }
                }
                Ok(Some(message)) => {
                    let is_disconnect = matches!(message, Message::Disconnect(_));
                    handler(message);
                    if is_disconnect {
                        peer_disconnected = true;
                        break 'read Ok(());
                    }
                }
                Ok(None) => break,
                Err(e) => break 'read Err(TransportError::from(e)),
            }
        }
    };

    if !peer_disconnected {
        let sender = conn.client_id().unwrap_or_default();
        debug!(peer = %conn.peer(), "stream ended without disconnect");
        handler(Message::Disconnect(Disconnect::new(sender)));
    }
    conn.close();
    result
}
