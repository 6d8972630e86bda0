//! Bookkeeping records for connections and channels during admission.
//!
//! These are plain data types owned exclusively by the handshake manager
//! task; none of them carry their own synchronization.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::connection::{Connection, ConnectionId};

/// Slack added to the join deadline before the quorum check gives up on
/// late joiners and settles for fewer connections.
pub const READY_DEADLINE_GRACE: Duration = Duration::from_millis(100);

/// A connection that has been accepted but not yet bound to a channel.
pub struct UnboundConnectionInfo {
    /// The connection itself.
    pub connection: Arc<Connection>,
    /// When the socket was accepted.
    pub established_at: Instant,
    /// When the connection is evicted if still unbound.
    pub expires_at: Instant,
}

/// A connection bound to a pending channel.
pub struct BoundConnectionInfo {
    /// The connection itself.
    pub connection: Arc<Connection>,
    /// Whether this connection has acknowledged the ready broadcast.
    pub has_acknowledged: bool,
}

/// A channel that has been initiated but not yet activated.
pub struct InactiveChannelInfo {
    /// Channel identifier, also used as the session id on the wire.
    pub channel_id: i64,
    /// Client-chosen token that initiated the channel; deduplicates Init
    /// requests.
    pub access_token: Vec<u8>,
    /// Server-issued token every Join must present.
    pub connection_token: Vec<u8>,
    /// Connections bound so far, keyed by connection id.
    pub connections: HashMap<ConnectionId, BoundConnectionInfo>,
    /// Connections required for quorum.
    pub required_connections: usize,
    /// When the channel was initiated.
    pub created_at: Instant,
    /// Join deadline; the channel is destroyed if it never becomes ready.
    pub expires_at: Instant,
    /// Whether the ready broadcast already went out (it goes out once).
    pub has_sent_channel_ready: bool,
}

impl InactiveChannelInfo {
    /// Compare a presented token against the issued one by content.
    pub fn validate_connection_token(&self, presented: &[u8]) -> bool {
        !presented.is_empty() && presented == self.connection_token
    }

    /// Bind a connection. Returns the new connection count, or `None` if
    /// the channel is already full.
    pub fn bind_connection(&mut self, connection: Arc<Connection>) -> Option<usize> {
        if self.connections.len() >= self.required_connections {
            return None;
        }
        self.connections.insert(
            connection.id(),
            BoundConnectionInfo {
                connection,
                has_acknowledged: false,
            },
        );
        Some(self.connections.len())
    }

    /// Whether the ready broadcast should go out: quorum reached, or the
    /// join deadline has effectively passed with at least one connection.
    pub fn ready_to_broadcast(&self, now: Instant) -> bool {
        if self.has_sent_channel_ready {
            return false;
        }
        self.connections.len() >= self.required_connections
            || (now > self.expires_at - READY_DEADLINE_GRACE && !self.connections.is_empty())
    }

    /// Number of bound connections that acknowledged the ready broadcast.
    pub fn acknowledged_count(&self) -> usize {
        self.connections
            .values()
            .filter(|info| info.has_acknowledged)
            .count()
    }

    /// Whether every bound connection has acknowledged.
    pub fn all_acknowledged(&self) -> bool {
        self.has_sent_channel_ready
            && !self.connections.is_empty()
            && self.connections.values().all(|info| info.has_acknowledged)
    }
}

/// An activated channel handed over to the session layer.
pub struct ActiveChannelInfo {
    /// Channel identifier.
    pub channel_id: i64,
    /// Connections bound at activation, in arbitrary order.
    pub connections: Vec<Arc<Connection>>,
    /// Token a client must present to re-attach a replacement socket.
    pub reconnect_token: Vec<u8>,
    /// When the channel activated.
    pub activated_at: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(required: usize, expires_in: Duration) -> InactiveChannelInfo {
        let now = Instant::now();
        InactiveChannelInfo {
            channel_id: 1,
            access_token: b"access".to_vec(),
            connection_token: b"issued-token".to_vec(),
            connections: HashMap::new(),
            required_connections: required,
            created_at: now,
            expires_at: now + expires_in,
            has_sent_channel_ready: false,
        }
    }

    #[test]
    fn test_token_validation_is_content_equality() {
        let info = channel(3, Duration::from_secs(60));
        assert!(info.validate_connection_token(&b"issued-token".to_vec()));
        assert!(!info.validate_connection_token(b"wrong-token"));
        assert!(!info.validate_connection_token(b""));
    }

    #[test]
    fn test_quorum_before_deadline() {
        let mut info = channel(2, Duration::from_secs(60));
        let now = Instant::now();
        assert!(!info.ready_to_broadcast(now));

        // Simulate two bound connections without sockets.
        info.required_connections = 0;
        assert!(info.ready_to_broadcast(now));
    }

    #[tokio::test]
    async fn test_deadline_with_partial_quorum() {
        let mut info = channel(3, Duration::from_millis(50));
        let late = info.expires_at + Duration::from_millis(1);

        // No connections: deadline alone is not enough.
        assert!(!info.ready_to_broadcast(late));

        info.connections.insert(
            ConnectionId(1),
            BoundConnectionInfo {
                connection: dummy_connection(1),
                has_acknowledged: false,
            },
        );
        assert!(!info.ready_to_broadcast(info.created_at));
        assert!(info.ready_to_broadcast(late));
    }

    #[tokio::test]
    async fn test_broadcast_happens_once() {
        let mut info = channel(1, Duration::from_secs(60));
        info.connections.insert(
            ConnectionId(1),
            BoundConnectionInfo {
                connection: dummy_connection(1),
                has_acknowledged: false,
            },
        );
        assert!(info.ready_to_broadcast(Instant::now()));
        info.has_sent_channel_ready = true;
        assert!(!info.ready_to_broadcast(Instant::now()));
    }

    #[tokio::test]
    async fn test_all_acknowledged_requires_broadcast_and_every_ack() {
        let mut info = channel(2, Duration::from_secs(60));
        for id in 1..=2 {
            info.connections.insert(
                ConnectionId(id),
                BoundConnectionInfo {
                    connection: dummy_connection(id),
                    has_acknowledged: false,
                },
            );
        }
        assert!(!info.all_acknowledged());

        info.has_sent_channel_ready = true;
        assert!(!info.all_acknowledged());
        assert_eq!(info.acknowledged_count(), 0);

        for bound in info.connections.values_mut() {
            bound.has_acknowledged = true;
        }
        assert_eq!(info.acknowledged_count(), 2);
        assert!(info.all_acknowledged());
    }

    /// Build a connection around a socket that never sees traffic.
    fn dummy_connection(id: u64) -> Arc<Connection> {
        use crate::pool::{BufferPool, PoolConfig};
        use std::net::TcpListener as StdListener;

        // A connected std socket pair, converted without entering the
        // runtime's reactor (the tests never start these connections).
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (_server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        let stream = tokio::net::TcpStream::from_std(client).unwrap();

        Connection::attach(
            ConnectionId(id),
            stream,
            Arc::new(BufferPool::new(PoolConfig::default())),
        )
    }
}
