//! skein-server — the transport front end.
//!
//! Accepts TCP connections, runs the multi-connection admission handshake,
//! and keeps a registry of activated session channels so dropped clients
//! can reconnect. Gameplay on top of the channels belongs to a different
//! binary; this one exists to run and soak-test the transport.
//!
//! Run with: `cargo run -p skein-server -- --bind 0.0.0.0:7777`

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::Parser;
use tracing::info;

use skein_net::channel::{ChannelClosedHandler, NetChannel, channel_from_active};
use skein_net::clock::SystemClock;
use skein_net::handshake::{
    ChannelActivatedCallback, FindActiveChannel, HandshakeConfig, HandshakeManager,
};
use skein_net::platform::SocketConfig;
use skein_net::pool::{BufferPool, PoolConfig};
use skein_net::tcp_server::{ServerConfig, TransportServer};

/// CLI arguments for the server binary.
#[derive(Parser, Debug)]
#[command(name = "skein-server", about = "Multi-connection TCP session server")]
struct ServerArgs {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0:7777")]
    bind: SocketAddr,

    /// Maximum concurrently connected sockets.
    #[arg(long, default_value_t = 1024)]
    max_connections: usize,

    /// Sockets a client must bring before its channel goes ready.
    #[arg(long, default_value_t = 3)]
    required_connections: usize,

    /// Directory for the JSON log file (console logging is always on).
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Log filter directives; `RUST_LOG` takes precedence.
    #[arg(long)]
    log_filter: Option<String>,
}

type SessionRegistry = Arc<Mutex<HashMap<i64, Arc<dyn NetChannel>>>>;

/// Turn each activation into a registered session channel that removes
/// itself when it dies.
fn activation_callback(sessions: SessionRegistry, pool: Arc<BufferPool>) -> ChannelActivatedCallback {
    Arc::new(move |active| {
        let channel_id = active.channel_id;
        let Some(channel) = channel_from_active(active, Arc::clone(&pool)) else {
            return;
        };

        let reaper = Arc::clone(&sessions);
        let on_closed: ChannelClosedHandler = Arc::new(move |id| {
            reaper.lock().unwrap().remove(&id);
            info!(channel = id, "session closed");
        });
        channel.set_closed_handler(on_closed);

        sessions.lock().unwrap().insert(channel_id, channel);
        info!(channel = channel_id, "session registered");
    })
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let args = ServerArgs::parse();
    skein_log::init_logging(args.log_dir.as_deref(), args.log_filter.as_deref());

    let pool = Arc::new(BufferPool::new(PoolConfig::default()));
    let sessions: SessionRegistry = Arc::new(Mutex::new(HashMap::new()));

    let on_activated = activation_callback(Arc::clone(&sessions), Arc::clone(&pool));
    let finder = Arc::clone(&sessions);
    let find_active: FindActiveChannel =
        Arc::new(move |session_id| finder.lock().unwrap().get(&session_id).cloned());

    let handshake = HandshakeManager::spawn(
        HandshakeConfig {
            required_connections: args.required_connections,
            ..HandshakeConfig::default()
        },
        Arc::clone(&pool),
        Arc::new(SystemClock),
        on_activated,
        find_active,
    );

    let server = Arc::new(TransportServer::new(
        ServerConfig {
            bind_addr: args.bind,
            max_connections: args.max_connections,
            socket: SocketConfig::default(),
        },
        pool,
        handshake,
    ));

    let signal_server = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            signal_server.shutdown();
        }
    });

    info!("skein-server listening on {}", args.bind);
    server.run().await
}
