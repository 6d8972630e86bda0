//! Connection admission: the handshake manager.
//!
//! Every accepted connection starts Unbound. The first client opens a
//! channel with `INIT_REQUEST` and receives a channel id plus a connection
//! token; its peers bind additional sockets with `JOIN_REQUEST`. Once the
//! channel reaches quorum (or its deadline passes with at least one
//! connection), `CHANNEL_READY` is broadcast; after every bound connection
//! acknowledges, the channel activates and is handed to the session layer
//! through the activation callback. Clients of an already-active channel
//! re-attach replacement sockets with `RECONNECT_REQUEST`.
//!
//! All admission state is owned by a single manager task. Connection
//! events and packets arrive as [`HandshakeJob`]s over an unbounded queue
//! and are drained in bounded batches, so every state mutation is strictly
//! sequential without any caller ever blocking. A periodic tick sweeps
//! expired unbound connections and channels.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::channel::NetChannel;
use crate::channel_info::{
    ActiveChannelInfo, BoundConnectionInfo, InactiveChannelInfo, UnboundConnectionInfo,
};
use crate::clock::{Clock, unix_millis_now};
use crate::connection::{Connection, ConnectionId};
use crate::messages::{
    AckRequest, ChannelActivated, ChannelReadyPacket, HandshakeMessage, InitRejectedResponse,
    InitRequest, InitResponse, JoinRequest, JoinResponse, OpCode, PacketBuildError,
    ReconnectRequest, ReconnectResponse, build_handshake_packet,
};
use crate::pool::BufferPool;

/// Admission failures. Most disconnect the offending connection; a
/// duplicate access token instead gets an `INIT_REJECTED` reply so the
/// client can retry with a fresh token.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The opcode is not part of the handshake protocol.
    #[error("unknown handshake opcode {opcode}")]
    UnknownOpcode {
        /// The offending wire value.
        opcode: u16,
    },
    /// The payload did not parse as the message the opcode names.
    #[error("malformed payload for {opcode:?}")]
    MalformedPayload {
        /// The message that failed to parse.
        opcode: OpCode,
    },
    /// The connection is not tracked by the manager.
    #[error("connection is not tracked")]
    UnknownConnection,
    /// The opcode is not valid for the connection's current state.
    #[error("{opcode:?} not valid for connection in {state}")]
    InvalidState {
        /// The received opcode.
        opcode: OpCode,
        /// Human-readable state name.
        state: &'static str,
    },
    /// An Init presented an empty access token.
    #[error("empty access token")]
    EmptyAccessToken,
    /// An Init presented an access token that already owns a channel.
    #[error("duplicate access token")]
    DuplicateAccessToken,
    /// A Join named a channel that does not exist.
    #[error("channel {channel_id} not found")]
    ChannelNotFound {
        /// The requested channel.
        channel_id: i64,
    },
    /// A Join presented the wrong connection token.
    #[error("connection token mismatch for channel {channel_id}")]
    TokenMismatch {
        /// The requested channel.
        channel_id: i64,
    },
    /// A Join arrived after the channel's deadline.
    #[error("channel {channel_id} expired")]
    ChannelExpired {
        /// The requested channel.
        channel_id: i64,
    },
    /// A Join arrived after the channel already reached its required
    /// connection count.
    #[error("channel {channel_id} is full")]
    ChannelFull {
        /// The requested channel.
        channel_id: i64,
    },
    /// A connection acknowledged the ready broadcast twice.
    #[error("duplicate ready acknowledgment")]
    DuplicateAck,
    /// A Reconnect named a session with no active channel.
    #[error("session {session_id} not found")]
    SessionNotFound {
        /// The requested session.
        session_id: i64,
    },
    /// The active channel refused the replacement connection.
    #[error("reconnection refused by channel")]
    ReconnectRefused,
    /// A response packet could not be built.
    #[error(transparent)]
    PacketBuild(#[from] PacketBuildError),
}

impl HandshakeError {
    /// Whether this failure force-closes the connection.
    fn should_disconnect(&self) -> bool {
        !matches!(self, HandshakeError::DuplicateAccessToken)
    }
}

/// Tuning knobs for the handshake manager.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Connections required before a channel becomes ready. Default: 3.
    pub required_connections: usize,
    /// How long an accepted connection may stay Unbound. Default: 1s.
    pub unbound_timeout: Duration,
    /// How long a channel may wait for its joins and acks. Default: 3min.
    pub channel_timeout: Duration,
    /// Period of the expiry sweep. Default: 1s.
    pub cleanup_interval: Duration,
    /// Maximum jobs drained per batch; more than this in the queue is a
    /// backlog worth logging. Default: 1000.
    pub max_jobs_per_batch: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            required_connections: 3,
            unbound_timeout: Duration::from_millis(1000),
            channel_timeout: Duration::from_secs(3 * 60),
            cleanup_interval: Duration::from_secs(1),
            max_jobs_per_batch: 1000,
        }
    }
}

/// One unit of work for the manager task.
pub enum HandshakeJob {
    /// A socket was accepted and adopted.
    ConnectionEstablished(Arc<Connection>),
    /// A connection closed for any reason.
    ConnectionClosed(ConnectionId),
    /// A frame arrived on a connection the manager still owns.
    HandshakePacket {
        /// The connection that received the frame.
        connection: Arc<Connection>,
        /// Raw opcode from the frame header.
        opcode: u16,
        /// Frame payload, copied off the receive buffer.
        payload: Vec<u8>,
    },
    /// Sweep expired unbound connections and channels now.
    CleanupExpired,
}

/// Invoked on the manager task when a channel activates.
pub type ChannelActivatedCallback = Arc<dyn Fn(ActiveChannelInfo) + Send + Sync>;

/// Looks up the active channel for a session id, for reconnection.
pub type FindActiveChannel = Arc<dyn Fn(i64) -> Option<Arc<dyn NetChannel>> + Send + Sync>;

/// Cloneable front door to the manager task.
#[derive(Clone)]
pub struct HandshakeHandle {
    tx: mpsc::UnboundedSender<HandshakeJob>,
}

impl HandshakeHandle {
    /// Take ownership of a freshly accepted connection: wire its packet
    /// and closed handlers into the job queue and register it Unbound.
    /// The caller still has to start the connection.
    pub fn adopt(&self, connection: &Arc<Connection>) {
        let tx = self.tx.clone();
        connection.set_packet_handler(Arc::new(move |conn, opcode, payload| {
            let _ = tx.send(HandshakeJob::HandshakePacket {
                connection: Arc::clone(conn),
                opcode,
                payload: payload.to_vec(),
            });
        }));

        let tx = self.tx.clone();
        connection.set_closed_handler(Arc::new(move |id| {
            let _ = tx.send(HandshakeJob::ConnectionClosed(id));
        }));

        let _ = self
            .tx
            .send(HandshakeJob::ConnectionEstablished(Arc::clone(connection)));
    }

    /// Run the expiry sweep out of band (tests drive deadlines this way).
    pub fn trigger_cleanup(&self) {
        let _ = self.tx.send(HandshakeJob::CleanupExpired);
    }
}

/// Owns all admission state. Runs as a single task; see the module docs.
pub struct HandshakeManager {
    config: HandshakeConfig,
    pool: Arc<BufferPool>,
    clock: Arc<dyn Clock>,
    on_channel_activated: ChannelActivatedCallback,
    find_active_channel: FindActiveChannel,

    unbound: HashMap<ConnectionId, UnboundConnectionInfo>,
    inactive_channels: HashMap<i64, InactiveChannelInfo>,
    /// Access token → channel, to deduplicate Init requests.
    token_to_channel: HashMap<Vec<u8>, i64>,
    next_channel_id: i64,

    rx: mpsc::UnboundedReceiver<HandshakeJob>,
}

impl HandshakeManager {
    /// Spawn the manager task and return its handle.
    pub fn spawn(
        config: HandshakeConfig,
        pool: Arc<BufferPool>,
        clock: Arc<dyn Clock>,
        on_channel_activated: ChannelActivatedCallback,
        find_active_channel: FindActiveChannel,
    ) -> HandshakeHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Self {
            config,
            pool,
            clock,
            on_channel_activated,
            find_active_channel,
            unbound: HashMap::new(),
            inactive_channels: HashMap::new(),
            token_to_channel: HashMap::new(),
            next_channel_id: 1,
            rx,
        };
        tokio::spawn(manager.run());
        HandshakeHandle { tx }
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut batch = Vec::with_capacity(128);

        loop {
            tokio::select! {
                n = self.rx.recv_many(&mut batch, self.config.max_jobs_per_batch) => {
                    if n == 0 {
                        // Every handle dropped; nothing can reach us anymore.
                        break;
                    }
                    if !self.rx.is_empty() {
                        tracing::warn!(
                            backlog = self.rx.len(),
                            "handshake job backlog exceeds batch size"
                        );
                    }
                    for job in batch.drain(..) {
                        self.process_job(job);
                    }
                }
                _ = ticker.tick() => {
                    self.cleanup_expired();
                }
            }
        }
        tracing::debug!("handshake manager stopped");
    }

    fn process_job(&mut self, job: HandshakeJob) {
        match job {
            HandshakeJob::ConnectionEstablished(connection) => {
                self.handle_connection_established(connection);
            }
            HandshakeJob::ConnectionClosed(id) => {
                self.cleanup_connection(id);
                tracing::debug!(%id, "connection closed and cleaned up");
            }
            HandshakeJob::HandshakePacket {
                connection,
                opcode,
                payload,
            } => {
                self.handle_handshake_packet(connection, opcode, &payload);
            }
            HandshakeJob::CleanupExpired => {
                self.cleanup_expired();
            }
        }
    }

    fn handle_connection_established(&mut self, connection: Arc<Connection>) {
        let now = self.clock.now();
        let id = connection.id();
        self.unbound.insert(
            id,
            UnboundConnectionInfo {
                connection,
                established_at: now,
                expires_at: now + self.config.unbound_timeout,
            },
        );
        tracing::debug!(%id, "connection added to unbound");
    }

    /// A failed job never poisons the batch: the offending connection is
    /// closed (or rejected) and the drain moves on.
    fn handle_handshake_packet(&mut self, connection: Arc<Connection>, opcode: u16, payload: &[u8]) {
        match self.dispatch(&connection, opcode, payload) {
            Ok(()) => {}
            Err(HandshakeError::DuplicateAccessToken) => {
                tracing::info!(id = %connection.id(), "duplicate access token, rejecting init");
                self.send_response(
                    &connection,
                    OpCode::InitRejected,
                    &InitRejectedResponse {
                        reason: "duplicate access token, retry with a different one".to_string(),
                    },
                );
            }
            Err(err) => {
                tracing::warn!(id = %connection.id(), %err, "handshake failed");
                if err.should_disconnect() {
                    connection.force_close();
                    self.cleanup_connection(connection.id());
                }
            }
        }
    }

    fn dispatch(
        &mut self,
        connection: &Arc<Connection>,
        opcode: u16,
        payload: &[u8],
    ) -> Result<(), HandshakeError> {
        let opcode = OpCode::from_u16(opcode).ok_or(HandshakeError::UnknownOpcode { opcode })?;
        self.validate_state(connection.id(), opcode)?;

        match opcode {
            OpCode::InitRequest => self.process_init(connection, payload),
            OpCode::JoinRequest => self.process_join(connection, payload),
            OpCode::ChannelReadyAck => self.process_ready_ack(connection, payload),
            OpCode::ReconnectRequest => self.process_reconnect(connection, payload),
            other => Err(HandshakeError::InvalidState {
                opcode: other,
                state: "server",
            }),
        }
    }

    /// Unbound connections may Init, Join, or Reconnect; bound connections
    /// may only acknowledge the ready broadcast.
    fn validate_state(&self, id: ConnectionId, opcode: OpCode) -> Result<(), HandshakeError> {
        if self.unbound.contains_key(&id) {
            return match opcode {
                OpCode::InitRequest | OpCode::JoinRequest | OpCode::ReconnectRequest => Ok(()),
                other => Err(HandshakeError::InvalidState {
                    opcode: other,
                    state: "unbound",
                }),
            };
        }

        if self.find_bound_channel(id).is_some() {
            return match opcode {
                OpCode::ChannelReadyAck => Ok(()),
                other => Err(HandshakeError::InvalidState {
                    opcode: other,
                    state: "bound",
                }),
            };
        }

        Err(HandshakeError::UnknownConnection)
    }

    fn find_bound_channel(&self, id: ConnectionId) -> Option<i64> {
        self.inactive_channels
            .values()
            .find(|channel| channel.connections.contains_key(&id))
            .map(|channel| channel.channel_id)
    }

    fn process_init(
        &mut self,
        connection: &Arc<Connection>,
        payload: &[u8],
    ) -> Result<(), HandshakeError> {
        let request = InitRequest::parse(payload).ok_or(HandshakeError::MalformedPayload {
            opcode: OpCode::InitRequest,
        })?;
        if request.access_token.is_empty() {
            return Err(HandshakeError::EmptyAccessToken);
        }
        if self.token_to_channel.contains_key(&request.access_token) {
            return Err(HandshakeError::DuplicateAccessToken);
        }

        let channel_id = self.next_channel_id;
        self.next_channel_id += 1;

        let now = self.clock.now();
        let mut channel = InactiveChannelInfo {
            channel_id,
            access_token: request.access_token.clone(),
            connection_token: generate_token(),
            connections: HashMap::new(),
            required_connections: self.config.required_connections,
            created_at: now,
            expires_at: now + self.config.channel_timeout,
            has_sent_channel_ready: false,
        };

        self.unbound
            .remove(&connection.id())
            .ok_or(HandshakeError::UnknownConnection)?;
        channel.connections.insert(
            connection.id(),
            BoundConnectionInfo {
                connection: Arc::clone(connection),
                has_acknowledged: false,
            },
        );

        let response = InitResponse {
            channel_id,
            required_connections: channel.required_connections as i32,
            optimal_connections: channel.required_connections as i32,
            init_deadline: unix_millis_now() + self.config.channel_timeout.as_millis() as i64,
            channel_token: channel.connection_token.clone(),
        };

        self.token_to_channel
            .insert(channel.access_token.clone(), channel_id);
        self.inactive_channels.insert(channel_id, channel);

        tracing::info!(channel = channel_id, id = %connection.id(), "channel created");
        self.send_response(connection, OpCode::InitResponse, &response);

        // A single-connection quorum is already met.
        if self.inactive_channels[&channel_id].ready_to_broadcast(now) {
            self.send_channel_ready(channel_id);
        }
        Ok(())
    }

    fn process_join(
        &mut self,
        connection: &Arc<Connection>,
        payload: &[u8],
    ) -> Result<(), HandshakeError> {
        let request = JoinRequest::parse(payload).ok_or(HandshakeError::MalformedPayload {
            opcode: OpCode::JoinRequest,
        })?;
        let channel_id = request.channel_id;
        let now = self.clock.now();

        let channel = self
            .inactive_channels
            .get_mut(&channel_id)
            .ok_or(HandshakeError::ChannelNotFound { channel_id })?;
        if !channel.validate_connection_token(&request.channel_token) {
            return Err(HandshakeError::TokenMismatch { channel_id });
        }
        if now > channel.expires_at {
            return Err(HandshakeError::ChannelExpired { channel_id });
        }

        let count = channel
            .bind_connection(Arc::clone(connection))
            .ok_or(HandshakeError::ChannelFull { channel_id })?;
        self.unbound.remove(&connection.id());

        let response = JoinResponse {
            success: true,
            connection_index: request.connection_index,
            active_connection_count: count as i32,
        };
        tracing::info!(channel = channel_id, id = %connection.id(), "connection joined");
        self.send_response(connection, OpCode::JoinResponse, &response);

        if self.inactive_channels[&channel_id].ready_to_broadcast(now) {
            self.send_channel_ready(channel_id);
        }
        Ok(())
    }

    fn send_channel_ready(&mut self, channel_id: i64) {
        let Some(channel) = self.inactive_channels.get_mut(&channel_id) else {
            return;
        };
        channel.has_sent_channel_ready = true;

        let packet = ChannelReadyPacket {
            channel_id,
            final_connection_count: channel.connections.len() as i32,
            server_time: unix_millis_now(),
        };
        let buf = match build_handshake_packet(&self.pool, OpCode::ChannelReady, &packet) {
            Ok(buf) => buf,
            Err(err) => {
                tracing::warn!(channel = channel_id, %err, "failed to build ready broadcast");
                return;
            }
        };

        for bound in channel.connections.values() {
            bound.connection.send(buf.clone());
            tracing::info!(
                channel = channel_id,
                id = %bound.connection.id(),
                "sent channel ready"
            );
        }
    }

    fn process_ready_ack(
        &mut self,
        connection: &Arc<Connection>,
        payload: &[u8],
    ) -> Result<(), HandshakeError> {
        // The ack body carries the client clock; nothing here depends on
        // its value, but it still has to parse.
        AckRequest::parse(payload).ok_or(HandshakeError::MalformedPayload {
            opcode: OpCode::ChannelReadyAck,
        })?;

        let id = connection.id();
        let channel_id = self
            .find_bound_channel(id)
            .ok_or(HandshakeError::UnknownConnection)?;
        let channel = self
            .inactive_channels
            .get_mut(&channel_id)
            .ok_or(HandshakeError::ChannelNotFound { channel_id })?;

        let bound = channel
            .connections
            .get_mut(&id)
            .ok_or(HandshakeError::UnknownConnection)?;
        if bound.has_acknowledged {
            return Err(HandshakeError::DuplicateAck);
        }
        bound.has_acknowledged = true;

        if channel.all_acknowledged() {
            self.activate_channel(channel_id);
        }
        Ok(())
    }

    fn activate_channel(&mut self, channel_id: i64) {
        let Some(channel) = self.inactive_channels.remove(&channel_id) else {
            return;
        };
        self.token_to_channel.remove(&channel.access_token);

        let connections: Vec<Arc<Connection>> = channel
            .connections
            .into_values()
            .map(|bound| bound.connection)
            .collect();
        // Frames from here on belong to the session channel, not to us.
        for connection in &connections {
            connection.detach_handlers();
        }
        let first = connections.first().cloned();

        let info = ActiveChannelInfo {
            channel_id,
            connections,
            reconnect_token: generate_token(),
            activated_at: self.clock.now(),
        };
        (self.on_channel_activated)(info);

        if let Some(first) = first {
            self.send_response(&first, OpCode::ChannelActivated, &ChannelActivated {
                channel_id,
            });
        }
        tracing::info!(channel = channel_id, "channel activated");
    }

    fn process_reconnect(
        &mut self,
        connection: &Arc<Connection>,
        payload: &[u8],
    ) -> Result<(), HandshakeError> {
        let request = ReconnectRequest::parse(payload).ok_or(HandshakeError::MalformedPayload {
            opcode: OpCode::ReconnectRequest,
        })?;

        let channel = (self.find_active_channel)(request.session_id).ok_or(
            HandshakeError::SessionNotFound {
                session_id: request.session_id,
            },
        )?;
        if !channel.handle_reconnection(connection, &request.reconnect_token) {
            return Err(HandshakeError::ReconnectRefused);
        }
        self.unbound.remove(&connection.id());

        let response = ReconnectResponse {
            success: true,
            active_connection_count: channel.connection_count() as i32,
        };
        tracing::info!(
            session = request.session_id,
            id = %connection.id(),
            "connection reconnected"
        );
        self.send_response(connection, OpCode::ReconnectResponse, &response);
        Ok(())
    }

    fn send_response<M: HandshakeMessage>(
        &self,
        connection: &Arc<Connection>,
        opcode: OpCode,
        message: &M,
    ) {
        match build_handshake_packet(&self.pool, opcode, message) {
            Ok(buf) => {
                connection.send(buf);
            }
            Err(err) => {
                tracing::warn!(id = %connection.id(), ?opcode, %err, "failed to build response");
            }
        }
    }

    fn cleanup_connection(&mut self, id: ConnectionId) {
        if self.unbound.remove(&id).is_some() {
            tracing::debug!(%id, "removed connection from unbound");
            return;
        }

        let Some(channel_id) = self.find_bound_channel(id) else {
            return;
        };
        let emptied = {
            let channel = self.inactive_channels.get_mut(&channel_id);
            match channel {
                Some(channel) => {
                    channel.connections.remove(&id);
                    channel.connections.is_empty()
                }
                None => false,
            }
        };
        tracing::debug!(%id, channel = channel_id, "removed connection from pending channel");
        if emptied {
            self.cleanup_channel(channel_id);
        }
    }

    fn cleanup_channel(&mut self, channel_id: i64) {
        let Some(channel) = self.inactive_channels.remove(&channel_id) else {
            return;
        };
        self.token_to_channel.remove(&channel.access_token);
        for bound in channel.connections.values() {
            bound.connection.force_close();
        }
        tracing::info!(channel = channel_id, "cleaned up pending channel");
    }

    fn cleanup_expired(&mut self) {
        let now = self.clock.now();

        let expired_connections: Vec<ConnectionId> = self
            .unbound
            .iter()
            .filter(|(_, info)| info.expires_at < now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired_connections {
            tracing::debug!(%id, "sweeping expired unbound connection");
            if let Some(info) = self.unbound.get(&id) {
                info.connection.force_close();
            }
            self.cleanup_connection(id);
        }

        let expired_channels: Vec<i64> = self
            .inactive_channels
            .iter()
            .filter(|(_, channel)| channel.expires_at < now)
            .map(|(id, _)| *id)
            .collect();
        for channel_id in expired_channels {
            tracing::debug!(channel = channel_id, "sweeping expired pending channel");
            self.cleanup_channel(channel_id);
        }
    }
}

/// 32 bytes of CSPRNG output, used for connection and reconnect tokens.
fn generate_token() -> Vec<u8> {
    let mut token = vec![0u8; 32];
    rand::rng().fill_bytes(&mut token);
    token
}
