//! Active session channels built on one or more connections.
//!
//! After the admission handshake, the bound connections are handed to a
//! [`NetChannel`]: [`SimpleChannel`] drives a single connection, while
//! [`MultiplexedChannel`] spreads frames over up to [`MULTIPLEX_SLOTS`]
//! parallel connections to dodge head-of-line blocking. Multiplexing uses
//! an app-level ack: a connection that has a frame in flight is busy until
//! the peer confirms it processed the frame with an [`APP_LEVEL_ACK`]
//! header, and outbound frames only go to non-busy connections.
//!
//! Channels take over the packet and closed handlers of their connections;
//! the admission layer must detach its own handlers before the handover.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::buffer::{SendBuffer, SendBufferMut};
use crate::channel_info::ActiveChannelInfo;
use crate::codec;
use crate::connection::{Connection, ConnectionId};
use crate::messages::APP_LEVEL_ACK;
use crate::pool::{BufferPool, PoolError};

/// Maximum parallel connections a multiplexed channel will drive.
pub const MULTIPLEX_SLOTS: usize = 8;

/// Handler invoked for every gameplay frame received on the channel.
pub type ChannelPacketHandler = Arc<dyn Fn(u16, &[u8]) + Send + Sync>;

/// Handler invoked once when the channel closes.
pub type ChannelClosedHandler = Arc<dyn Fn(i64) + Send + Sync>;

/// An activated session channel.
pub trait NetChannel: Send + Sync {
    /// Channel identifier (the session id on the wire).
    fn channel_id(&self) -> i64;

    /// Token a client must present to re-attach a replacement socket.
    fn reconnect_token(&self) -> &[u8];

    /// Number of live connections.
    fn connection_count(&self) -> usize;

    /// Send one frame. Returns false if no connection could take it; the
    /// frame is dropped in that case.
    fn send(&self, buf: SendBuffer) -> bool;

    /// Send several frames on one connection as a single batch.
    fn send_batch(&self, bufs: Vec<SendBuffer>) -> bool;

    /// Attach a replacement socket, validating the reconnect token by
    /// content. Returns false if the token is wrong or no slot is free.
    fn handle_reconnection(&self, connection: &Arc<Connection>, token: &[u8]) -> bool;

    /// Register the gameplay frame handler.
    fn set_packet_handler(&self, handler: ChannelPacketHandler);

    /// Register the closed handler.
    fn set_closed_handler(&self, handler: ChannelClosedHandler);

    /// Close every connection and fire the closed handler.
    fn close(&self);
}

/// Construct the channel type matching the activated connection count:
/// one connection gets a [`SimpleChannel`], more get a
/// [`MultiplexedChannel`]. Returns `None` for an empty activation.
pub fn channel_from_active(
    info: ActiveChannelInfo,
    pool: Arc<BufferPool>,
) -> Option<Arc<dyn NetChannel>> {
    if info.connections.is_empty() {
        return None;
    }
    let channel: Arc<dyn NetChannel> = if info.connections.len() == 1 {
        SimpleChannel::from_active(info, pool)?
    } else {
        MultiplexedChannel::from_active(info, pool)
    };
    Some(channel)
}

/// Header-only frame confirming the last frame on a connection was
/// processed.
fn ack_frame(pool: &Arc<BufferPool>) -> Result<SendBuffer, PoolError> {
    let mut buf = SendBufferMut::rent(pool, codec::HEADER_SIZE)?;
    codec::write_header(buf.as_mut_slice(), codec::HEADER_SIZE as u16, APP_LEVEL_ACK);
    Ok(buf.freeze())
}

#[derive(Default)]
struct ChannelHandlers {
    packet: Option<ChannelPacketHandler>,
    closed: Option<ChannelClosedHandler>,
}

/// Session channel over a single connection.
pub struct SimpleChannel {
    channel_id: i64,
    reconnect_token: Vec<u8>,
    connection: RwLock<Arc<Connection>>,
    handlers: Mutex<ChannelHandlers>,
    closed_signaled: AtomicBool,
    me: Weak<SimpleChannel>,
}

impl SimpleChannel {
    /// Build from an activation record with exactly one connection.
    pub fn from_active(info: ActiveChannelInfo, _pool: Arc<BufferPool>) -> Option<Arc<Self>> {
        let connection = info.connections.into_iter().next()?;
        let channel = Arc::new_cyclic(|me| Self {
            channel_id: info.channel_id,
            reconnect_token: info.reconnect_token,
            connection: RwLock::new(Arc::clone(&connection)),
            handlers: Mutex::new(ChannelHandlers::default()),
            closed_signaled: AtomicBool::new(false),
            me: me.clone(),
        });
        channel.wire(&connection);
        Some(channel)
    }

    fn wire(&self, connection: &Arc<Connection>) {
        let _ = connection.register_to_channel(self.channel_id);

        let weak = self.me.clone();
        connection.set_packet_handler(Arc::new(move |_conn, opcode, payload| {
            if let Some(channel) = weak.upgrade() {
                channel.on_packet(opcode, payload);
            }
        }));
        // A closed connection is not a closed channel: the client gets a
        // reconnection window.
        connection.set_closed_handler(Arc::new(|_id| {}));
    }

    fn on_packet(&self, opcode: u16, payload: &[u8]) {
        if opcode == APP_LEVEL_ACK {
            // Flow control only, never forwarded upstream.
            self.connection.read().unwrap().clear_busy();
            return;
        }

        let handler = self.handlers.lock().unwrap().packet.clone();
        if let Some(handler) = handler {
            handler(opcode, payload);
        }
    }

    fn signal_closed(&self) {
        if self.closed_signaled.swap(true, Ordering::AcqRel) {
            return;
        }
        let handler = self.handlers.lock().unwrap().closed.clone();
        if let Some(handler) = handler {
            handler(self.channel_id);
        }
    }
}

impl NetChannel for SimpleChannel {
    fn channel_id(&self) -> i64 {
        self.channel_id
    }

    fn reconnect_token(&self) -> &[u8] {
        &self.reconnect_token
    }

    fn connection_count(&self) -> usize {
        let connection = self.connection.read().unwrap();
        if connection.is_closed() { 0 } else { 1 }
    }

    fn send(&self, buf: SendBuffer) -> bool {
        let connection = Arc::clone(&self.connection.read().unwrap());
        !connection.is_closed() && connection.send(buf)
    }

    fn send_batch(&self, bufs: Vec<SendBuffer>) -> bool {
        let connection = Arc::clone(&self.connection.read().unwrap());
        !connection.is_closed() && connection.send_batch(bufs)
    }

    fn handle_reconnection(&self, connection: &Arc<Connection>, token: &[u8]) -> bool {
        if token.is_empty() || token != self.reconnect_token {
            tracing::warn!(channel = self.channel_id, "reconnect token mismatch");
            return false;
        }

        let mut current = self.connection.write().unwrap();
        if !current.is_closed() {
            tracing::warn!(
                channel = self.channel_id,
                "reconnect refused, current connection still live"
            );
            return false;
        }

        self.wire(connection);
        *current = Arc::clone(connection);
        tracing::info!(channel = self.channel_id, id = %connection.id(), "connection replaced");
        true
    }

    fn set_packet_handler(&self, handler: ChannelPacketHandler) {
        self.handlers.lock().unwrap().packet = Some(handler);
    }

    fn set_closed_handler(&self, handler: ChannelClosedHandler) {
        self.handlers.lock().unwrap().closed = Some(handler);
    }

    fn close(&self) {
        self.connection.read().unwrap().force_close();
        self.signal_closed();
    }
}

/// Session channel spreading frames over parallel connections.
pub struct MultiplexedChannel {
    channel_id: i64,
    reconnect_token: Vec<u8>,
    pool: Arc<BufferPool>,
    slots: RwLock<Vec<Option<Arc<Connection>>>>,
    handlers: Mutex<ChannelHandlers>,
    closed_signaled: AtomicBool,
    me: Weak<MultiplexedChannel>,
}

impl MultiplexedChannel {
    /// Build from an activation record. Connections beyond
    /// [`MULTIPLEX_SLOTS`] are closed.
    pub fn from_active(info: ActiveChannelInfo, pool: Arc<BufferPool>) -> Arc<Self> {
        let mut connections = info.connections;
        if connections.len() > MULTIPLEX_SLOTS {
            tracing::warn!(
                channel = info.channel_id,
                count = connections.len(),
                "activation exceeds slot count, closing extras"
            );
            for extra in connections.drain(MULTIPLEX_SLOTS..) {
                extra.force_close();
            }
        }

        let mut slots: Vec<Option<Arc<Connection>>> =
            connections.into_iter().map(Some).collect();
        slots.resize_with(MULTIPLEX_SLOTS, || None);

        let channel = Arc::new_cyclic(|me| Self {
            channel_id: info.channel_id,
            reconnect_token: info.reconnect_token,
            pool,
            slots: RwLock::new(slots),
            handlers: Mutex::new(ChannelHandlers::default()),
            closed_signaled: AtomicBool::new(false),
            me: me.clone(),
        });

        for slot in channel.slots.read().unwrap().iter().flatten() {
            channel.wire(slot);
        }
        channel
    }

    fn wire(&self, connection: &Arc<Connection>) {
        let _ = connection.register_to_channel(self.channel_id);

        let weak = self.me.clone();
        connection.set_packet_handler(Arc::new(move |conn, opcode, payload| {
            if let Some(channel) = weak.upgrade() {
                channel.on_packet(conn, opcode, payload);
            }
        }));

        let weak = self.me.clone();
        connection.set_closed_handler(Arc::new(move |id| {
            if let Some(channel) = weak.upgrade() {
                channel.on_connection_closed(id);
            }
        }));
    }

    fn on_packet(&self, conn: &Arc<Connection>, opcode: u16, payload: &[u8]) {
        if opcode == APP_LEVEL_ACK {
            // Flow control only, never forwarded upstream.
            conn.clear_busy();
            return;
        }

        let handler = self.handlers.lock().unwrap().packet.clone();
        if let Some(handler) = handler {
            handler(opcode, payload);
        }

        // Confirm receipt so the peer can reuse this connection.
        match ack_frame(&self.pool) {
            Ok(ack) => {
                conn.send(ack);
            }
            Err(err) => {
                tracing::warn!(channel = self.channel_id, %err, "failed to build ack frame")
            }
        }
    }

    fn on_connection_closed(&self, id: ConnectionId) {
        tracing::debug!(channel = self.channel_id, %id, "channel connection closed");
        let all_closed = self
            .slots
            .read()
            .unwrap()
            .iter()
            .flatten()
            .all(|conn| conn.is_closed());
        if all_closed {
            self.signal_closed();
        }
    }

    fn signal_closed(&self) {
        if self.closed_signaled.swap(true, Ordering::AcqRel) {
            return;
        }
        let handler = self.handlers.lock().unwrap().closed.clone();
        if let Some(handler) = handler {
            handler(self.channel_id);
        }
    }

    /// Claim the first live, non-busy connection.
    fn claim_free_connection(&self) -> Option<Arc<Connection>> {
        self.slots
            .read()
            .unwrap()
            .iter()
            .flatten()
            .find(|conn| !conn.is_closed() && conn.try_set_busy())
            .cloned()
    }
}

impl NetChannel for MultiplexedChannel {
    fn channel_id(&self) -> i64 {
        self.channel_id
    }

    fn reconnect_token(&self) -> &[u8] {
        &self.reconnect_token
    }

    fn connection_count(&self) -> usize {
        self.slots
            .read()
            .unwrap()
            .iter()
            .flatten()
            .filter(|conn| !conn.is_closed())
            .count()
    }

    fn send(&self, buf: SendBuffer) -> bool {
        let Some(connection) = self.claim_free_connection() else {
            // TODO: queue instead of dropping once the session layer can
            // tolerate the extra latency.
            tracing::warn!(channel = self.channel_id, "no free connection, dropping frame");
            return false;
        };
        if connection.send(buf) {
            true
        } else {
            connection.clear_busy();
            false
        }
    }

    fn send_batch(&self, bufs: Vec<SendBuffer>) -> bool {
        let Some(connection) = self.claim_free_connection() else {
            tracing::warn!(channel = self.channel_id, "no free connection, dropping batch");
            return false;
        };
        if connection.send_batch(bufs) {
            true
        } else {
            connection.clear_busy();
            false
        }
    }

    fn handle_reconnection(&self, connection: &Arc<Connection>, token: &[u8]) -> bool {
        if token.is_empty() || token != self.reconnect_token {
            tracing::warn!(channel = self.channel_id, "reconnect token mismatch");
            return false;
        }

        let mut slots = self.slots.write().unwrap();
        let Some(slot) = slots
            .iter_mut()
            .find(|slot| slot.as_ref().is_none_or(|conn| conn.is_closed()))
        else {
            tracing::warn!(channel = self.channel_id, "reconnect refused, no free slot");
            return false;
        };

        self.wire(connection);
        *slot = Some(Arc::clone(connection));
        tracing::info!(channel = self.channel_id, id = %connection.id(), "connection attached");
        true
    }

    fn set_packet_handler(&self, handler: ChannelPacketHandler) {
        self.handlers.lock().unwrap().packet = Some(handler);
    }

    fn set_closed_handler(&self, handler: ChannelClosedHandler) {
        self.handlers.lock().unwrap().closed = Some(handler);
    }

    fn close(&self) {
        for slot in self.slots.read().unwrap().iter().flatten() {
            slot.force_close();
        }
        self.signal_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use crate::pool::PoolConfig;

    fn pool() -> Arc<BufferPool> {
        Arc::new(BufferPool::new(PoolConfig::default()))
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn frame(opcode: u16, payload: &[u8]) -> Vec<u8> {
        let total = codec::HEADER_SIZE + payload.len();
        let mut bytes = vec![0u8; total];
        codec::write_header(&mut bytes, total as u16, opcode);
        bytes[codec::HEADER_SIZE..].copy_from_slice(payload);
        bytes
    }

    fn send_buffer(pool: &Arc<BufferPool>, opcode: u16, payload: &[u8]) -> SendBuffer {
        let bytes = frame(opcode, payload);
        let mut buf = SendBufferMut::rent(pool, bytes.len()).unwrap();
        buf.as_mut_slice().copy_from_slice(&bytes);
        buf.freeze()
    }

    /// n started server-side connections plus their client sockets.
    async fn active_info(
        channel_id: i64,
        n: usize,
        pool: &Arc<BufferPool>,
    ) -> (ActiveChannelInfo, Vec<TcpStream>) {
        let mut connections = Vec::new();
        let mut clients = Vec::new();
        for i in 0..n {
            let (client, server) = socket_pair().await;
            let conn =
                Connection::attach(ConnectionId(i as u64 + 1), server, Arc::clone(pool));
            conn.start();
            connections.push(conn);
            clients.push(client);
        }
        let info = ActiveChannelInfo {
            channel_id,
            connections,
            reconnect_token: b"reconnect-token".to_vec(),
            activated_at: Instant::now(),
        };
        (info, clients)
    }

    #[tokio::test]
    async fn test_simple_channel_send_reaches_socket() {
        let pool = pool();
        let (info, mut clients) = active_info(10, 1, &pool).await;
        let channel = SimpleChannel::from_active(info, Arc::clone(&pool)).unwrap();

        assert!(channel.send(send_buffer(&pool, 5, b"state")));

        let expected = frame(5, b"state");
        let mut received = vec![0u8; expected.len()];
        timeout(Duration::from_secs(1), clients[0].read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_simple_channel_forwards_inbound_frames() {
        let pool = pool();
        let (info, mut clients) = active_info(11, 1, &pool).await;
        let channel = SimpleChannel::from_active(info, pool).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.set_packet_handler(Arc::new(move |opcode, payload| {
            let _ = tx.send((opcode, payload.to_vec()));
        }));

        clients[0].write_all(&frame(9, b"input")).await.unwrap();
        let got = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, (9, b"input".to_vec()));
    }

    #[tokio::test]
    async fn test_simple_channel_swallows_app_level_ack() {
        let pool = pool();
        let (info, mut clients) = active_info(21, 1, &pool).await;
        let channel = SimpleChannel::from_active(info, pool).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.set_packet_handler(Arc::new(move |opcode, payload| {
            let _ = tx.send((opcode, payload.to_vec()));
        }));

        clients[0].write_all(&frame(APP_LEVEL_ACK, b"")).await.unwrap();
        clients[0].write_all(&frame(33, b"after")).await.unwrap();

        // The first frame to reach the session layer is the one behind
        // the ack.
        let got = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, (33, b"after".to_vec()));
    }

    #[tokio::test]
    async fn test_simple_channel_reconnect_rules() {
        let pool = pool();
        let (info, clients) = active_info(12, 1, &pool).await;
        let channel = SimpleChannel::from_active(info, Arc::clone(&pool)).unwrap();

        let (replacement_client, replacement_server) = socket_pair().await;
        let replacement =
            Connection::attach(ConnectionId(99), replacement_server, Arc::clone(&pool));
        replacement.start();

        // Live current connection: refused even with the right token.
        assert!(!channel.handle_reconnection(&replacement, b"reconnect-token"));

        drop(clients);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(channel.connection_count(), 0);

        assert!(!channel.handle_reconnection(&replacement, b"wrong"));
        assert!(!channel.handle_reconnection(&replacement, b""));
        assert!(channel.handle_reconnection(&replacement, b"reconnect-token"));
        assert_eq!(channel.connection_count(), 1);

        let mut replacement_client = replacement_client;
        assert!(channel.send(send_buffer(&pool, 1, b"hi")));
        let mut received = vec![0u8; frame(1, b"hi").len()];
        timeout(
            Duration::from_secs(1),
            replacement_client.read_exact(&mut received),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_multiplexed_send_rotates_and_exhausts() {
        let pool = pool();
        let (info, _clients) = active_info(13, 2, &pool).await;
        let channel = MultiplexedChannel::from_active(info, Arc::clone(&pool));

        assert!(channel.send(send_buffer(&pool, 1, b"a")));
        assert!(channel.send(send_buffer(&pool, 1, b"b")));
        // Both connections busy awaiting acks: the frame is dropped.
        assert!(!channel.send(send_buffer(&pool, 1, b"c")));
    }

    #[tokio::test]
    async fn test_app_level_ack_frees_connection() {
        let pool = pool();
        let (info, mut clients) = active_info(14, 2, &pool).await;
        // Single-slot behavior: close the second connection's client side.
        let second = clients.pop().unwrap();
        drop(second);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let channel = MultiplexedChannel::from_active(info, Arc::clone(&pool));
        assert!(channel.send(send_buffer(&pool, 1, b"a")));
        assert!(!channel.send(send_buffer(&pool, 1, b"b")));

        clients[0].write_all(&frame(APP_LEVEL_ACK, b"")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(channel.send(send_buffer(&pool, 1, b"c")));
    }

    #[tokio::test]
    async fn test_inbound_frame_is_forwarded_and_acked() {
        let pool = pool();
        let (info, mut clients) = active_info(15, 2, &pool).await;
        let channel = MultiplexedChannel::from_active(info, Arc::clone(&pool));

        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.set_packet_handler(Arc::new(move |opcode, payload| {
            let _ = tx.send((opcode, payload.to_vec()));
        }));

        clients[0].write_all(&frame(20, b"move")).await.unwrap();
        let got = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, (20, b"move".to_vec()));

        // The channel confirms processing with a header-only ack.
        let mut ack = [0u8; codec::HEADER_SIZE];
        timeout(Duration::from_secs(1), clients[0].read_exact(&mut ack))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(codec::parse_size(&ack) as usize, codec::HEADER_SIZE);
        assert_eq!(codec::parse_opcode(&ack), APP_LEVEL_ACK);
    }

    #[tokio::test]
    async fn test_multiplexed_reconnect_fills_closed_slot() {
        let pool = pool();
        let (info, mut clients) = active_info(16, 2, &pool).await;
        let channel = MultiplexedChannel::from_active(info, Arc::clone(&pool));
        assert_eq!(channel.connection_count(), 2);

        drop(clients.pop());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(channel.connection_count(), 1);

        let (_replacement_client, replacement_server) = socket_pair().await;
        let replacement =
            Connection::attach(ConnectionId(99), replacement_server, Arc::clone(&pool));
        replacement.start();

        assert!(!channel.handle_reconnection(&replacement, b"bogus"));
        assert!(channel.handle_reconnection(&replacement, b"reconnect-token"));
        assert_eq!(channel.connection_count(), 2);
        assert_eq!(replacement.bound_channel(), Some(16));
    }

    #[tokio::test]
    async fn test_closed_handler_fires_once_when_all_connections_drop() {
        let pool = pool();
        let (info, clients) = active_info(17, 2, &pool).await;
        let channel = MultiplexedChannel::from_active(info, pool);

        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.set_closed_handler(Arc::new(move |channel_id| {
            let _ = tx.send(channel_id);
        }));

        drop(clients);
        let channel_id = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(channel_id, 17);

        channel.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err(), "closed handler must fire once");
    }

    #[tokio::test]
    async fn test_channel_from_active_picks_by_connection_count() {
        let pool = pool();
        let (single, _c1) = active_info(18, 1, &pool).await;
        let (multi, _c2) = active_info(19, 3, &pool).await;

        let simple = channel_from_active(single, Arc::clone(&pool)).unwrap();
        let mux = channel_from_active(multi, Arc::clone(&pool)).unwrap();
        assert_eq!(simple.connection_count(), 1);
        assert_eq!(mux.connection_count(), 3);

        let empty = ActiveChannelInfo {
            channel_id: 20,
            connections: Vec::new(),
            reconnect_token: Vec::new(),
            activated_at: Instant::now(),
        };
        assert!(channel_from_active(empty, pool).is_none());
    }
}
