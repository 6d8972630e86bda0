//! Handshake opcodes and message layouts.
//!
//! Handshake messages use fixed little-endian fields; when a message
//! carries a token, it is the trailing field and its length is whatever
//! remains of the payload (no length prefix). Gameplay payloads are opaque
//! to this layer, so the opcode set here is a small closed enum.

use std::sync::Arc;

use crate::buffer::{SendBuffer, SendBufferMut};
use crate::codec;
use crate::pool::{BufferPool, PoolError};

/// Reserved opcode: the peer fully processed the last frame on this
/// socket. Multiplexed flow-control signal, never delivered upstream.
pub const APP_LEVEL_ACK: u16 = 65534;

/// Handshake packets never exceed this total size.
pub const MAX_HANDSHAKE_PACKET: usize = 4096;

/// Closed set of handshake opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Client opens a new pending channel.
    InitRequest,
    /// Server reply to a successful Init.
    InitResponse,
    /// Server reply to an Init with a duplicate access token.
    InitRejected,
    /// Client binds an additional connection to a pending channel.
    JoinRequest,
    /// Server reply to a Join.
    JoinResponse,
    /// Server broadcast: the channel reached quorum (or its deadline).
    ChannelReady,
    /// Client acknowledgment of ChannelReady.
    ChannelReadyAck,
    /// Server notification that the channel went live.
    ChannelActivated,
    /// Client re-attaches a fresh socket to an active channel.
    ReconnectRequest,
    /// Server reply to a Reconnect.
    ReconnectResponse,
    /// Per-socket flow-control ack ([`APP_LEVEL_ACK`]).
    AppLevelAck,
}

impl OpCode {
    /// Wire value.
    pub const fn as_u16(self) -> u16 {
        match self {
            OpCode::InitRequest => 1,
            OpCode::InitResponse => 2,
            OpCode::InitRejected => 3,
            OpCode::JoinRequest => 4,
            OpCode::JoinResponse => 5,
            OpCode::ChannelReady => 6,
            OpCode::ChannelReadyAck => 7,
            OpCode::ChannelActivated => 8,
            OpCode::ReconnectRequest => 9,
            OpCode::ReconnectResponse => 10,
            OpCode::AppLevelAck => APP_LEVEL_ACK,
        }
    }

    /// Decode a wire value; unknown values are not handshake opcodes.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(OpCode::InitRequest),
            2 => Some(OpCode::InitResponse),
            3 => Some(OpCode::InitRejected),
            4 => Some(OpCode::JoinRequest),
            5 => Some(OpCode::JoinResponse),
            6 => Some(OpCode::ChannelReady),
            7 => Some(OpCode::ChannelReadyAck),
            8 => Some(OpCode::ChannelActivated),
            9 => Some(OpCode::ReconnectRequest),
            10 => Some(OpCode::ReconnectResponse),
            APP_LEVEL_ACK => Some(OpCode::AppLevelAck),
            _ => None,
        }
    }
}

/// A message that can be laid out into (and parsed from) a frame payload.
pub trait HandshakeMessage: Sized {
    /// Exact encoded payload length.
    fn encoded_len(&self) -> usize;
    /// Write the payload into `buf` (which must be `encoded_len()` bytes)
    /// and return the bytes written.
    fn encode(&self, buf: &mut [u8]) -> usize;
    /// Parse a payload; `None` means the payload is malformed.
    fn parse(bytes: &[u8]) -> Option<Self>;
}

#[inline]
fn put_i64(buf: &mut [u8], offset: usize, value: i64) -> usize {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    offset + 8
}

#[inline]
fn put_i32(buf: &mut [u8], offset: usize, value: i32) -> usize {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    offset + 4
}

#[inline]
fn get_i64(bytes: &[u8], offset: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    i64::from_le_bytes(raw)
}

#[inline]
fn get_i32(bytes: &[u8], offset: usize) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    i32::from_le_bytes(raw)
}

/// Client request to open a pending channel. The entire payload is the
/// client-chosen access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitRequest {
    /// Opaque client-chosen bearer value.
    pub access_token: Vec<u8>,
}

impl HandshakeMessage for InitRequest {
    fn encoded_len(&self) -> usize {
        self.access_token.len()
    }

    fn encode(&self, buf: &mut [u8]) -> usize {
        buf[..self.access_token.len()].copy_from_slice(&self.access_token);
        self.access_token.len()
    }

    fn parse(bytes: &[u8]) -> Option<Self> {
        Some(Self {
            access_token: bytes.to_vec(),
        })
    }
}

/// Server reply to a successful Init.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitResponse {
    /// Newly allocated channel id.
    pub channel_id: i64,
    /// Number of connections required for quorum.
    pub required_connections: i32,
    /// Suggested connection count (currently equal to required).
    pub optimal_connections: i32,
    /// Join deadline, unix-epoch milliseconds.
    pub init_deadline: i64,
    /// Server-issued token required on every Join.
    pub channel_token: Vec<u8>,
}

impl HandshakeMessage for InitResponse {
    fn encoded_len(&self) -> usize {
        8 + 4 + 4 + 8 + self.channel_token.len()
    }

    fn encode(&self, buf: &mut [u8]) -> usize {
        let mut offset = put_i64(buf, 0, self.channel_id);
        offset = put_i32(buf, offset, self.required_connections);
        offset = put_i32(buf, offset, self.optimal_connections);
        offset = put_i64(buf, offset, self.init_deadline);
        buf[offset..offset + self.channel_token.len()].copy_from_slice(&self.channel_token);
        offset + self.channel_token.len()
    }

    fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 24 {
            return None;
        }
        Some(Self {
            channel_id: get_i64(bytes, 0),
            required_connections: get_i32(bytes, 8),
            optimal_connections: get_i32(bytes, 12),
            init_deadline: get_i64(bytes, 16),
            channel_token: bytes[24..].to_vec(),
        })
    }
}

/// Server reply to an Init whose access token is already in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitRejectedResponse {
    /// Human-readable rejection reason.
    pub reason: String,
}

impl HandshakeMessage for InitRejectedResponse {
    fn encoded_len(&self) -> usize {
        self.reason.len()
    }

    fn encode(&self, buf: &mut [u8]) -> usize {
        buf[..self.reason.len()].copy_from_slice(self.reason.as_bytes());
        self.reason.len()
    }

    fn parse(bytes: &[u8]) -> Option<Self> {
        Some(Self {
            reason: String::from_utf8(bytes.to_vec()).ok()?,
        })
    }
}

/// Client request to bind another connection to a pending channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    /// Target pending channel.
    pub channel_id: i64,
    /// Client-chosen index echoed back in the response.
    pub connection_index: i32,
    /// Token from the matching [`InitResponse`].
    pub channel_token: Vec<u8>,
}

impl HandshakeMessage for JoinRequest {
    fn encoded_len(&self) -> usize {
        8 + 4 + self.channel_token.len()
    }

    fn encode(&self, buf: &mut [u8]) -> usize {
        let mut offset = put_i64(buf, 0, self.channel_id);
        offset = put_i32(buf, offset, self.connection_index);
        buf[offset..offset + self.channel_token.len()].copy_from_slice(&self.channel_token);
        offset + self.channel_token.len()
    }

    fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 12 {
            return None;
        }
        Some(Self {
            channel_id: get_i64(bytes, 0),
            connection_index: get_i32(bytes, 8),
            channel_token: bytes[12..].to_vec(),
        })
    }
}

/// Server reply to a Join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinResponse {
    /// Whether the Join was accepted.
    pub success: bool,
    /// Echo of the request's connection index.
    pub connection_index: i32,
    /// Connections bound to the channel after this Join.
    pub active_connection_count: i32,
}

impl HandshakeMessage for JoinResponse {
    fn encoded_len(&self) -> usize {
        1 + 4 + 4
    }

    fn encode(&self, buf: &mut [u8]) -> usize {
        buf[0] = self.success as u8;
        let offset = put_i32(buf, 1, self.connection_index);
        put_i32(buf, offset, self.active_connection_count)
    }

    fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 9 {
            return None;
        }
        Some(Self {
            success: bytes[0] == 1,
            connection_index: get_i32(bytes, 1),
            active_connection_count: get_i32(bytes, 5),
        })
    }
}

/// Broadcast to every bound connection when a channel reaches quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelReadyPacket {
    /// Channel about to activate.
    pub channel_id: i64,
    /// Connections bound at the moment of broadcast.
    pub final_connection_count: i32,
    /// Server wall clock, unix-epoch milliseconds.
    pub server_time: i64,
}

impl HandshakeMessage for ChannelReadyPacket {
    fn encoded_len(&self) -> usize {
        8 + 4 + 8
    }

    fn encode(&self, buf: &mut [u8]) -> usize {
        let mut offset = put_i64(buf, 0, self.channel_id);
        offset = put_i32(buf, offset, self.final_connection_count);
        put_i64(buf, offset, self.server_time)
    }

    fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 20 {
            return None;
        }
        Some(Self {
            channel_id: get_i64(bytes, 0),
            final_connection_count: get_i32(bytes, 8),
            server_time: get_i64(bytes, 12),
        })
    }
}

/// Client acknowledgment of [`ChannelReadyPacket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRequest {
    /// Session the client believes it belongs to.
    pub session_id: i64,
    /// Client wall clock, unix-epoch milliseconds.
    pub client_time: i64,
}

impl HandshakeMessage for AckRequest {
    fn encoded_len(&self) -> usize {
        8 + 8
    }

    fn encode(&self, buf: &mut [u8]) -> usize {
        let offset = put_i64(buf, 0, self.session_id);
        put_i64(buf, offset, self.client_time)
    }

    fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 16 {
            return None;
        }
        Some(Self {
            session_id: get_i64(bytes, 0),
            client_time: get_i64(bytes, 8),
        })
    }
}

/// Client request to re-attach a fresh socket to an active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectRequest {
    /// Target active session.
    pub session_id: i64,
    /// Token issued at activation.
    pub reconnect_token: Vec<u8>,
}

impl HandshakeMessage for ReconnectRequest {
    fn encoded_len(&self) -> usize {
        8 + self.reconnect_token.len()
    }

    fn encode(&self, buf: &mut [u8]) -> usize {
        let offset = put_i64(buf, 0, self.session_id);
        buf[offset..offset + self.reconnect_token.len()].copy_from_slice(&self.reconnect_token);
        offset + self.reconnect_token.len()
    }

    fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 8 {
            return None;
        }
        Some(Self {
            session_id: get_i64(bytes, 0),
            reconnect_token: bytes[8..].to_vec(),
        })
    }
}

/// Server reply to a Reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectResponse {
    /// Whether the new connection was attached.
    pub success: bool,
    /// Live connections on the channel after the attempt.
    pub active_connection_count: i32,
}

impl HandshakeMessage for ReconnectResponse {
    fn encoded_len(&self) -> usize {
        1 + 4
    }

    fn encode(&self, buf: &mut [u8]) -> usize {
        buf[0] = self.success as u8;
        put_i32(buf, 1, self.active_connection_count)
    }

    fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 5 {
            return None;
        }
        Some(Self {
            success: bytes[0] == 1,
            active_connection_count: get_i32(bytes, 1),
        })
    }
}

/// Sent on one connection once the channel is handed to the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelActivated {
    /// The activated channel.
    pub channel_id: i64,
}

impl HandshakeMessage for ChannelActivated {
    fn encoded_len(&self) -> usize {
        8
    }

    fn encode(&self, buf: &mut [u8]) -> usize {
        put_i64(buf, 0, self.channel_id)
    }

    fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 8 {
            return None;
        }
        Some(Self {
            channel_id: get_i64(bytes, 0),
        })
    }
}

/// Errors from [`build_handshake_packet`].
#[derive(Debug, thiserror::Error)]
pub enum PacketBuildError {
    /// The encoded packet would exceed [`MAX_HANDSHAKE_PACKET`].
    #[error("handshake packet of {size} bytes exceeds limit {MAX_HANDSHAKE_PACKET}")]
    TooLarge {
        /// Total packet size including the header.
        size: usize,
    },
    /// The pool refused the rent.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Lay a full frame (header + message payload) into a pooled [`SendBuffer`].
pub fn build_handshake_packet<M: HandshakeMessage>(
    pool: &Arc<BufferPool>,
    opcode: OpCode,
    message: &M,
) -> Result<SendBuffer, PacketBuildError> {
    let total_size = codec::HEADER_SIZE + message.encoded_len();
    if total_size > MAX_HANDSHAKE_PACKET {
        return Err(PacketBuildError::TooLarge { size: total_size });
    }

    let mut buf = SendBufferMut::rent(pool, total_size)?;
    let slice = buf.as_mut_slice();
    codec::write_header(slice, total_size as u16, opcode.as_u16());
    message.encode(&mut slice[codec::HEADER_SIZE..]);
    Ok(buf.freeze())
}
