use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::TransportError;
use super::connection::{Connection, ReadLoopOptions, read_loop};
use crate::broker::Broker;
use crate::config::Settings;
use crate::protocol::FrameCodec;

const DEFAULT_MAX_CONNECTIONS: usize = 1000;

/// TCP front end of a [`Broker`].
///
/// Each accepted socket gets its own task running the read loop; the
/// broker's delivery loop runs alongside for as long as the server does.
pub struct Server {
    listener: TcpListener,
    broker: Arc<Broker>,
    codec: FrameCodec,
    max_connections: usize,
}

impl Server {
    pub fn new(listener: TcpListener, broker: Arc<Broker>) -> Self {
        Self {
            listener,
            broker,
            codec: FrameCodec::default(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    /// Bind to `server.host:server.port` and apply the frame and connection limits.
    pub async fn bind(settings: &Settings, broker: Arc<Broker>) -> io::Result<Self> {
        let addr = format!("{}:{}", settings.server.host, settings.server.port);
        let listener = TcpListener::bind(&addr).await?;
        Ok(Self::new(listener, broker)
            .with_codec(FrameCodec::new(settings.broker.max_frame_bytes))
            .with_max_connections(settings.server.max_connections))
    }

    pub fn with_codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Accept connections and run the delivery loop until `shutdown`
    /// resolves, then stop both and close every open socket.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), TransportError>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            broker,
            codec,
            max_connections,
        } = self;

        let (stop_tx, stop_rx) = watch::channel(false);
        let delivery = tokio::spawn(broker.clone().run_delivery_loop(stop_rx));
        let open: Arc<DashMap<Uuid, Arc<Connection>>> = Arc::new(DashMap::new());
        let active = Arc::new(AtomicUsize::new(0));

        info!(addr = %listener.local_addr()?, "server listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if active.load(Ordering::Acquire) >= max_connections {
                            warn!(peer = %peer, limit = max_connections, "connection limit reached, rejecting");
                            drop(stream);
                            continue;
                        }
                        active.fetch_add(1, Ordering::AcqRel);
                        tokio::spawn(serve_connection(
                            stream,
                            peer,
                            broker.clone(),
                            codec,
                            open.clone(),
                            active.clone(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "failed to accept connection"),
                },
            }
        }

        info!("server shutting down");
        stop_tx.send_replace(true);
        for entry in open.iter() {
            entry.value().close();
        }
        broker.close_all();
        if let Err(e) = delivery.await {
            error!(error = %e, "delivery loop panicked");
        }
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<(), TransportError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    broker: Arc<Broker>,
    codec: FrameCodec,
    open: Arc<DashMap<Uuid, Arc<Connection>>>,
    active: Arc<AtomicUsize>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
    }
    let (reader, writer) = stream.into_split();
    let conn = Connection::new(peer.to_string(), writer);
    open.insert(conn.id(), conn.clone());
    info!(peer = %peer, "client connected");

    let result = read_loop(
        conn.clone(),
        reader,
        codec,
        ReadLoopOptions::default(),
        |message| {
            if let Err(e) = broker.handle_message(&conn, message) {
                error!(peer = %peer, error = %e, "failed to handle message");
            }
        },
    )
    .await;

    if let Err(e) = result {
        warn!(peer = %peer, error = %e, "connection closed with error");
    }
    open.remove(&conn.id());
    active.fetch_sub(1, Ordering::AcqRel);
}
