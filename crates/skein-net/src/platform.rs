//! Socket-level configuration for listeners and accepted connections.
//!
//! Everything latency-sensitive about the transport is decided here:
//! Nagle off, keepalive probing tuned to notice a dead peer well inside
//! the reconnection window, and a dual-stack listener when binding IPv6.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};

/// Conservative MSS for a 1500-byte MTU path (20 B IP header, 20 B TCP
/// header, 12 B timestamp option). Frames at or under this size avoid IP
/// fragmentation.
pub const TCP_MAX_SEGMENT_SIZE: usize = 1448;

/// Socket options applied to the listener and every accepted stream.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm. Default: true.
    pub tcp_nodelay: bool,
    /// Probe idle connections with TCP keepalive. Default: true.
    pub keepalive_enabled: bool,
    /// Idle time before the first keepalive probe. Default: 30s.
    pub keepalive_idle: Duration,
    /// Interval between keepalive probes. Default: 5s.
    pub keepalive_interval: Duration,
    /// Probes before the connection is declared dead. Default: 3.
    pub keepalive_retries: u32,
    /// Set `SO_REUSEADDR` on the listener. Default: true except on
    /// Windows, where it allows port hijacking.
    pub reuse_addr: bool,
    /// Listen backlog. Default: 128.
    pub listen_backlog: i32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_enabled: true,
            keepalive_idle: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(5),
            keepalive_retries: 3,
            reuse_addr: !cfg!(target_os = "windows"),
            listen_backlog: 128,
        }
    }
}

/// Apply the per-connection options to an accepted stream.
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    if config.keepalive_enabled {
        let keepalive = TcpKeepalive::new()
            .with_time(config.keepalive_idle)
            .with_interval(config.keepalive_interval);

        // macOS has no per-socket retry count.
        #[cfg(any(target_os = "linux", target_os = "windows"))]
        let keepalive = keepalive.with_retries(config.keepalive_retries);

        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}

/// Bind a configured listener. An IPv6 bind address gets a dual-stack
/// socket so IPv4 clients can reach it too.
pub async fn create_listener(
    addr: SocketAddr,
    config: &SocketConfig,
) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let socket = socket2::Socket::new(
        domain,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.listen_backlog)?;

    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_accepted_stream_gets_nodelay_and_keepalive() {
        let config = SocketConfig::default();
        let listener = create_listener("127.0.0.1:0".parse().unwrap(), &config)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        configure_stream(&stream, &config).unwrap();

        assert!(stream.nodelay().unwrap());
        assert!(SockRef::from(&stream).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_nodelay_can_be_disabled() {
        let config = SocketConfig {
            tcp_nodelay: false,
            keepalive_enabled: false,
            ..SocketConfig::default()
        };
        let listener = create_listener("127.0.0.1:0".parse().unwrap(), &config)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        configure_stream(&stream, &config).unwrap();
        assert!(!stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_dual_stack_listener_accepts_ipv4() {
        let config = SocketConfig::default();
        let Ok(listener) = create_listener("[::]:0".parse().unwrap(), &config).await else {
            eprintln!("IPv6 unavailable, skipping");
            return;
        };
        let port = listener.local_addr().unwrap().port();

        let v4 = TcpStream::connect(("127.0.0.1", port)).await;
        assert!(v4.is_ok(), "dual-stack listener should accept IPv4");
    }

    #[test]
    fn test_mss_fits_default_mtu() {
        assert_eq!(TCP_MAX_SEGMENT_SIZE, 1500 - 20 - 32);
    }
}
