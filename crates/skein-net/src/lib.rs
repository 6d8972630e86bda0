//! Transport and connection admission: framed TCP, pooled buffers, the
//! multi-connection handshake, and session channels.

pub mod buffer;
pub mod channel;
pub mod channel_info;
pub mod clock;
pub mod codec;
pub mod connection;
pub mod handshake;
pub mod messages;
pub mod platform;
pub mod pool;
pub mod tcp_server;

pub use buffer::{ReceiveBuffer, SendBuffer, SendBufferMut};
pub use channel::{
    MULTIPLEX_SLOTS, MultiplexedChannel, NetChannel, SimpleChannel, channel_from_active,
};
pub use channel_info::ActiveChannelInfo;
pub use clock::{Clock, ManualClock, SystemClock};
pub use connection::{Connection, ConnectionId, IdGenerator};
pub use handshake::{
    HandshakeConfig, HandshakeError, HandshakeHandle, HandshakeJob, HandshakeManager,
};
pub use messages::{APP_LEVEL_ACK, MAX_HANDSHAKE_PACKET, OpCode};
pub use platform::{SocketConfig, TCP_MAX_SEGMENT_SIZE};
pub use pool::{BufferPool, PoolConfig, PoolError};
pub use tcp_server::{ConnectionLimitReached, ConnectionRegistry, ServerConfig, TransportServer};
