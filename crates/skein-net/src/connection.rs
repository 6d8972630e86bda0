//! A single framed TCP connection.
//!
//! Each accepted socket is wrapped in a [`Connection`] backed by two tasks:
//! a reader that reassembles length-prefixed frames out of a pooled
//! [`ReceiveBuffer`], and a writer that drains queued [`SendBuffer`]s into
//! one vectored write at a time. Callers interact only through the handle:
//! [`Connection::send`] enqueues, [`Connection::force_close`] tears both
//! tasks down, and the registered packet handler receives every parsed
//! frame on the reader task.
//!
//! A malformed header (declared size smaller than the header itself) or a
//! frame larger than the receive buffer is unrecoverable: the stream offset
//! can never resynchronize, so the connection is closed on the spot.

use std::io::IoSlice;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Notify, mpsc};

use crate::buffer::{ReceiveBuffer, SendBuffer};
use crate::codec;
use crate::pool::BufferPool;

/// Receive buffer capacity per connection. Also the hard ceiling on a
/// single inbound frame.
pub const RECEIVE_BUFFER_SIZE: usize = 32768;

/// Unique identifier for a TCP connection within a server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`ConnectionId`].
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler invoked on the reader task for every parsed frame.
pub type PacketHandler = Arc<dyn Fn(&Arc<Connection>, u16, &[u8]) + Send + Sync>;

/// Handler invoked exactly once when the connection closes for any reason.
pub type ClosedHandler = Arc<dyn Fn(ConnectionId) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    packet: Option<PacketHandler>,
    closed: Option<ClosedHandler>,
}

enum WriteCommand {
    Packet(SendBuffer),
    Shutdown,
}

/// Handle to one framed TCP connection.
pub struct Connection {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    pool: Arc<BufferPool>,
    writer_tx: mpsc::UnboundedSender<WriteCommand>,
    reader: Mutex<Option<OwnedReadHalf>>,
    handlers: Mutex<Handlers>,
    /// Multiplexed-channel flow control: set while a frame sent on this
    /// connection awaits the peer's app-level ack.
    busy: AtomicBool,
    closed: AtomicBool,
    closed_signaled: AtomicBool,
    /// Wakes the reader task when the connection is force-closed so it
    /// does not linger until the peer hangs up.
    closed_notify: Notify,
    /// Channel this connection is bound to, 0 while unbound. A connection
    /// binds at most once per channel membership.
    bound_channel: AtomicI64,
}

impl Connection {
    /// Wrap an accepted stream. The writer task starts immediately; the
    /// reader stays parked until [`Connection::start`] so handlers can be
    /// registered without racing the first inbound frame.
    pub fn attach(id: ConnectionId, stream: TcpStream, pool: Arc<BufferPool>) -> Arc<Self> {
        let peer_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        let conn = Arc::new(Self {
            id,
            peer_addr,
            pool,
            writer_tx,
            reader: Mutex::new(Some(reader)),
            handlers: Mutex::new(Handlers::default()),
            busy: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            closed_signaled: AtomicBool::new(false),
            closed_notify: Notify::new(),
            bound_channel: AtomicI64::new(0),
        });
        tokio::spawn(run_writer(Arc::downgrade(&conn), writer, writer_rx));
        conn
    }

    /// Spawn the reader task. Idempotent; the second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        let Some(reader) = self.reader.lock().unwrap().take() else {
            return;
        };
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            conn.run_reader(reader).await;
        });
    }

    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote endpoint, if it was still known at accept time.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Register the frame handler, replacing any previous one.
    pub fn set_packet_handler(&self, handler: PacketHandler) {
        self.handlers.lock().unwrap().packet = Some(handler);
    }

    /// Register the closed handler, replacing any previous one.
    pub fn set_closed_handler(&self, handler: ClosedHandler) {
        self.handlers.lock().unwrap().closed = Some(handler);
    }

    /// Drop both handlers, e.g. before ownership moves to another layer.
    pub fn detach_handlers(&self) {
        let mut handlers = self.handlers.lock().unwrap();
        handlers.packet = None;
        handlers.closed = None;
    }

    /// Queue one frame for sending. Returns false if the connection is
    /// closed.
    pub fn send(&self, buf: SendBuffer) -> bool {
        if self.is_closed() {
            return false;
        }
        self.writer_tx.send(WriteCommand::Packet(buf)).is_ok()
    }

    /// Queue several frames for sending; the writer coalesces them into a
    /// single vectored write when the socket allows.
    pub fn send_batch(&self, bufs: Vec<SendBuffer>) -> bool {
        if self.is_closed() {
            return false;
        }
        for buf in bufs {
            if self.writer_tx.send(WriteCommand::Packet(buf)).is_err() {
                return false;
            }
        }
        true
    }

    /// Mark the connection busy. Returns true only for the caller that
    /// flipped the flag.
    pub fn try_set_busy(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clear the busy flag (on app-level ack or after a dropped send).
    pub fn clear_busy(&self) {
        self.busy.store(false, Ordering::Release);
    }

    /// Whether the busy flag is currently set.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Bind this connection to a channel. Only the first caller wins;
    /// later calls return false and leave the binding untouched.
    pub fn register_to_channel(&self, channel_id: i64) -> bool {
        self.bound_channel
            .compare_exchange(0, channel_id, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Channel this connection is bound to, if any.
    pub fn bound_channel(&self) -> Option<i64> {
        match self.bound_channel.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Close the connection: stop both tasks, shut the socket down, and
    /// fire the closed handler exactly once. The writer still drains its
    /// queued frames first; the reader stops at once.
    pub fn force_close(self: &Arc<Self>) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.writer_tx.send(WriteCommand::Shutdown);
            self.closed_notify.notify_one();
            tracing::debug!(id = %self.id, "connection closing");
        }
        self.signal_closed();
    }

    fn signal_closed(self: &Arc<Self>) {
        if self.closed_signaled.swap(true, Ordering::AcqRel) {
            return;
        }
        let handler = self.handlers.lock().unwrap().closed.clone();
        if let Some(handler) = handler {
            handler(self.id);
        }
    }

    async fn run_reader(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let mut buf = match ReceiveBuffer::new(&self.pool, RECEIVE_BUFFER_SIZE) {
            Ok(buf) => buf,
            Err(err) => {
                tracing::warn!(id = %self.id, %err, "failed to rent receive buffer");
                self.force_close();
                return;
            }
        };

        loop {
            if self.is_closed() {
                break;
            }
            buf.reset();
            let n = tokio::select! {
                result = reader.read(buf.write_slice()) => match result {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(err) => {
                        tracing::debug!(id = %self.id, %err, "socket read failed");
                        break;
                    }
                },
                _ = self.closed_notify.notified() => break,
            };
            buf.commit_write(n);

            if !self.process_frames(&mut buf) {
                break;
            }
        }

        self.force_close();
    }

    /// Parse every complete frame buffered so far. Returns false on a
    /// protocol violation that requires closing the connection.
    fn process_frames(self: &Arc<Self>, buf: &mut ReceiveBuffer) -> bool {
        loop {
            if self.is_closed() {
                return false;
            }
            let frame_len = {
                let data = buf.read_slice();
                if data.len() < codec::HEADER_SIZE {
                    return true;
                }

                let size = codec::parse_size(data) as usize;
                if size < codec::HEADER_SIZE {
                    tracing::warn!(
                        id = %self.id,
                        size,
                        "frame declares size smaller than its header, closing"
                    );
                    return false;
                }
                if size > data.len() {
                    if size > buf.capacity() {
                        tracing::warn!(
                            id = %self.id,
                            size,
                            capacity = buf.capacity(),
                            "frame exceeds receive buffer, closing"
                        );
                        return false;
                    }
                    // Partial frame; wait for the next socket read.
                    return true;
                }

                let opcode = codec::parse_opcode(data);
                let handler = self.handlers.lock().unwrap().packet.clone();
                match handler {
                    Some(handler) => handler(self, opcode, &data[codec::HEADER_SIZE..size]),
                    None => {
                        tracing::trace!(id = %self.id, opcode, "frame dropped, no handler")
                    }
                }
                size
            };
            buf.commit_read(frame_len);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn run_writer(
    conn: Weak<Connection>,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<WriteCommand>,
) {
    let mut batch: Vec<SendBuffer> = Vec::new();
    let mut shutdown = false;

    while !shutdown {
        let Some(first) = rx.recv().await else {
            break;
        };
        match first {
            WriteCommand::Shutdown => break,
            WriteCommand::Packet(buf) => batch.push(buf),
        }
        // Drain everything already queued into one vectored write.
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                WriteCommand::Shutdown => {
                    shutdown = true;
                    break;
                }
                WriteCommand::Packet(buf) => batch.push(buf),
            }
        }

        if let Err(err) = write_all_vectored(&mut writer, &batch).await {
            // A write failure is fatal; close immediately instead of
            // waiting for the reader to notice.
            if let Some(conn) = conn.upgrade() {
                tracing::debug!(id = %conn.id(), %err, "socket write failed, closing");
                conn.force_close();
            }
            break;
        }
        batch.clear();
    }

    let _ = writer.shutdown().await;
}

/// Write every buffer in `batch`, re-issuing vectored writes until the
/// socket has accepted all bytes.
async fn write_all_vectored(
    writer: &mut OwnedWriteHalf,
    batch: &[SendBuffer],
) -> std::io::Result<()> {
    let mut idx = 0;
    let mut offset = 0;

    while idx < batch.len() {
        let mut slices = Vec::with_capacity(batch.len() - idx);
        slices.push(IoSlice::new(&batch[idx].as_slice()[offset..]));
        for buf in &batch[idx + 1..] {
            slices.push(IoSlice::new(buf.as_slice()));
        }

        let mut n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }

        while idx < batch.len() {
            let remaining = batch[idx].len() - offset;
            if n >= remaining {
                n -= remaining;
                idx += 1;
                offset = 0;
            } else {
                offset += n;
                break;
            }
        }
    }

    Ok(())
}
