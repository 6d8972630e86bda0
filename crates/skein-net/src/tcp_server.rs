//! TCP accept loop feeding connections into the admission layer.
//!
//! [`TransportServer`] owns the listener, the buffer pool, and the
//! connection registry. Every accepted socket becomes a [`Connection`]
//! adopted by the handshake manager; the server itself never looks at
//! frames. Shutdown is a watch signal: the accept loop drains out and all
//! tracked connections are force-closed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::connection::{Connection, ConnectionId, IdGenerator};
use crate::handshake::HandshakeHandle;
use crate::platform::{SocketConfig, configure_stream, create_listener};
use crate::pool::BufferPool;

/// Configuration for [`TransportServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind. Default: `0.0.0.0:7777`.
    pub bind_addr: SocketAddr,
    /// Maximum concurrently tracked connections. Default: 1024.
    pub max_connections: usize,
    /// Socket options for the listener and accepted streams.
    pub socket: SocketConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7777".parse().unwrap(),
            max_connections: 1024,
            socket: SocketConfig::default(),
        }
    }
}

/// Error returned when the registry is at capacity.
#[derive(Debug, thiserror::Error)]
#[error("connection limit reached")]
pub struct ConnectionLimitReached;

/// Tracks every live connection for capacity limiting and shutdown.
pub struct ConnectionRegistry {
    inner: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    fn new(max_connections: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            max_connections,
        }
    }

    /// Track a connection, evicting entries whose sockets have closed.
    fn insert(&self, connection: Arc<Connection>) -> Result<(), ConnectionLimitReached> {
        let mut map = self.inner.lock().unwrap();
        map.retain(|_, conn| !conn.is_closed());
        if map.len() >= self.max_connections {
            return Err(ConnectionLimitReached);
        }
        map.insert(connection.id(), connection);
        Ok(())
    }

    /// Number of tracked live connections.
    pub fn len(&self) -> usize {
        let mut map = self.inner.lock().unwrap();
        map.retain(|_, conn| !conn.is_closed());
        map.len()
    }

    /// Whether no live connection is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn close_all(&self) {
        for conn in self.inner.lock().unwrap().values() {
            conn.force_close();
        }
    }
}

/// The transport front door: accepts sockets and hands them to admission.
pub struct TransportServer {
    config: ServerConfig,
    pool: Arc<BufferPool>,
    handshake: HandshakeHandle,
    /// Live connection registry (public for inspection).
    pub connections: Arc<ConnectionRegistry>,
    id_gen: Arc<IdGenerator>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TransportServer {
    /// Create a server whose connections are admitted by `handshake`.
    pub fn new(config: ServerConfig, pool: Arc<BufferPool>, handshake: HandshakeHandle) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            connections: Arc::new(ConnectionRegistry::new(config.max_connections)),
            id_gen: Arc::new(IdGenerator::new()),
            config,
            pool,
            handshake,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Bind the configured address and run the accept loop.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = create_listener(self.config.bind_addr, &self.config.socket).await?;
        tracing::info!("listening on {}", self.config.bind_addr);
        self.run_with_listener(listener).await
    }

    /// Run the accept loop on a pre-bound listener (tests bind port 0).
    pub async fn run_with_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = result?;
                    if let Err(err) = configure_stream(&stream, &self.config.socket) {
                        tracing::warn!(%peer_addr, %err, "failed to configure socket, dropping");
                        continue;
                    }

                    let id = self.id_gen.next_id();
                    let connection = Connection::attach(id, stream, Arc::clone(&self.pool));

                    if self.connections.insert(Arc::clone(&connection)).is_err() {
                        tracing::warn!(%peer_addr, "connection limit reached, rejecting");
                        connection.force_close();
                        continue;
                    }

                    tracing::debug!(%id, %peer_addr, "accepted connection");
                    self.handshake.adopt(&connection);
                    connection.start();
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("server shutting down");
                        break;
                    }
                }
            }
        }

        self.connections.close_all();
        Ok(())
    }

    /// Signal the accept loop to stop and close every connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
