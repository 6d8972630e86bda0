//! End-to-end admission flow against a running [`TransportServer`]:
//! raw TCP clients drive Init → Join → Ready → Ack → activation, then
//! exchange gameplay frames over the activated channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use skein_net::channel::{NetChannel, channel_from_active};
use skein_net::clock::SystemClock;
use skein_net::codec;
use skein_net::handshake::{HandshakeConfig, HandshakeManager};
use skein_net::messages::{
    APP_LEVEL_ACK, AckRequest, ChannelActivated, ChannelReadyPacket, HandshakeMessage, InitRequest,
    InitResponse, JoinRequest, JoinResponse, OpCode,
};
use skein_net::platform::SocketConfig;
use skein_net::pool::{BufferPool, PoolConfig};
use skein_net::tcp_server::{ServerConfig, TransportServer};

struct TestServer {
    addr: std::net::SocketAddr,
    server: Arc<TransportServer>,
    sessions: Arc<Mutex<HashMap<i64, Arc<dyn NetChannel>>>>,
    /// Gameplay frames received on any activated channel.
    inbound_rx: mpsc::UnboundedReceiver<(u16, Vec<u8>)>,
}

async fn start_server(config: HandshakeConfig) -> TestServer {
    let pool = Arc::new(BufferPool::new(PoolConfig::default()));
    let sessions: Arc<Mutex<HashMap<i64, Arc<dyn NetChannel>>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    let registry = Arc::clone(&sessions);
    let activation_pool = Arc::clone(&pool);
    let handshake = HandshakeManager::spawn(
        config,
        Arc::clone(&pool),
        Arc::new(SystemClock),
        Arc::new(move |active| {
            let Some(channel) = channel_from_active(active, Arc::clone(&activation_pool)) else {
                return;
            };
            let tx = inbound_tx.clone();
            channel.set_packet_handler(Arc::new(move |opcode, payload| {
                let _ = tx.send((opcode, payload.to_vec()));
            }));
            registry
                .lock()
                .unwrap()
                .insert(channel.channel_id(), channel);
        }),
        {
            let finder = Arc::clone(&sessions);
            Arc::new(move |session_id| finder.lock().unwrap().get(&session_id).cloned())
        },
    );

    let server = Arc::new(TransportServer::new(
        ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            max_connections: 64,
            socket: SocketConfig::default(),
        },
        pool,
        handshake,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept_server = Arc::clone(&server);
    tokio::spawn(async move {
        accept_server.run_with_listener(listener).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    TestServer {
        addr,
        server,
        sessions,
        inbound_rx,
    }
}

async fn send<M: HandshakeMessage>(stream: &mut TcpStream, opcode: OpCode, msg: &M) {
    let total = codec::HEADER_SIZE + msg.encoded_len();
    let mut bytes = vec![0u8; total];
    codec::write_header(&mut bytes, total as u16, opcode.as_u16());
    msg.encode(&mut bytes[codec::HEADER_SIZE..]);
    stream.write_all(&bytes).await.unwrap();
}

async fn recv(stream: &mut TcpStream) -> (u16, Vec<u8>) {
    let mut header = [0u8; codec::HEADER_SIZE];
    timeout(Duration::from_secs(2), stream.read_exact(&mut header))
        .await
        .expect("timed out waiting for frame")
        .unwrap();
    let size = codec::parse_size(&header) as usize;
    let mut payload = vec![0u8; size - codec::HEADER_SIZE];
    timeout(Duration::from_secs(2), stream.read_exact(&mut payload))
        .await
        .expect("timed out waiting for payload")
        .unwrap();
    (codec::parse_opcode(&header), payload)
}

/// Drive `connections` sockets through the full admission flow; returns
/// the activated channel id and the still-open client sockets.
async fn establish_session(
    server: &TestServer,
    access_token: &[u8],
    connections: usize,
) -> (i64, Vec<TcpStream>) {
    let mut initiator = TcpStream::connect(server.addr).await.unwrap();
    send(&mut initiator, OpCode::InitRequest, &InitRequest {
        access_token: access_token.to_vec(),
    })
    .await;
    let (opcode, payload) = recv(&mut initiator).await;
    assert_eq!(opcode, OpCode::InitResponse.as_u16());
    let init = InitResponse::parse(&payload).unwrap();
    assert_eq!(init.required_connections as usize, connections);

    let mut streams = vec![initiator];
    for index in 1..connections {
        let mut joiner = TcpStream::connect(server.addr).await.unwrap();
        send(&mut joiner, OpCode::JoinRequest, &JoinRequest {
            channel_id: init.channel_id,
            connection_index: index as i32,
            channel_token: init.channel_token.clone(),
        })
        .await;
        let (opcode, payload) = recv(&mut joiner).await;
        assert_eq!(opcode, OpCode::JoinResponse.as_u16());
        let join = JoinResponse::parse(&payload).unwrap();
        assert!(join.success);
        assert_eq!(join.connection_index, index as i32);
        streams.push(joiner);
    }

    // Quorum: every socket gets the ready broadcast and acknowledges it.
    for stream in &mut streams {
        let (opcode, payload) = recv(stream).await;
        assert_eq!(opcode, OpCode::ChannelReady.as_u16());
        let ready = ChannelReadyPacket::parse(&payload).unwrap();
        assert_eq!(ready.channel_id, init.channel_id);
        assert_eq!(ready.final_connection_count as usize, connections);
    }
    for stream in &mut streams {
        send(stream, OpCode::ChannelReadyAck, &AckRequest {
            session_id: init.channel_id,
            client_time: 0,
        })
        .await;
    }

    // Exactly one socket is told the channel went live.
    let mut activated = 0;
    for stream in &mut streams {
        let mut header = [0u8; codec::HEADER_SIZE];
        match timeout(Duration::from_millis(300), stream.read_exact(&mut header)).await {
            Ok(read) => {
                read.unwrap();
                assert_eq!(codec::parse_opcode(&header), OpCode::ChannelActivated.as_u16());
                let size = codec::parse_size(&header) as usize;
                let mut payload = vec![0u8; size - codec::HEADER_SIZE];
                stream.read_exact(&mut payload).await.unwrap();
                let notice = ChannelActivated::parse(&payload).unwrap();
                assert_eq!(notice.channel_id, init.channel_id);
                activated += 1;
            }
            Err(_) => {}
        }
    }
    assert_eq!(activated, 1, "activation is announced on exactly one socket");

    (init.channel_id, streams)
}

#[tokio::test]
async fn test_three_connection_session_end_to_end() {
    let mut server = start_server(HandshakeConfig::default()).await;
    let (channel_id, mut streams) = establish_session(&server, b"client-a", 3).await;

    let channel = server
        .sessions
        .lock()
        .unwrap()
        .get(&channel_id)
        .cloned()
        .expect("session must be registered");
    assert_eq!(channel.connection_count(), 3);

    // Client → server: a gameplay frame reaches the channel handler and
    // is acknowledged at the transport level.
    let payload = b"player input";
    let total = codec::HEADER_SIZE + payload.len();
    let mut bytes = vec![0u8; total];
    codec::write_header(&mut bytes, total as u16, 100);
    bytes[codec::HEADER_SIZE..].copy_from_slice(payload);
    streams[0].write_all(&bytes).await.unwrap();

    let got = timeout(Duration::from_secs(2), server.inbound_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, (100, payload.to_vec()));

    let (opcode, ack_payload) = recv(&mut streams[0]).await;
    assert_eq!(opcode, APP_LEVEL_ACK);
    assert!(ack_payload.is_empty());
}

#[tokio::test]
async fn test_sessions_are_isolated_by_access_token() {
    let server = start_server(HandshakeConfig {
        required_connections: 1,
        ..HandshakeConfig::default()
    })
    .await;

    let (first, _streams_a) = establish_session(&server, b"client-a", 1).await;
    let (second, _streams_b) = establish_session(&server, b"client-b", 1).await;
    assert_ne!(first, second);
    assert_eq!(server.sessions.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_corrupt_frame_terminates_connection() {
    let server = start_server(HandshakeConfig::default()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    // A frame claiming to be smaller than its own header can never
    // resynchronize; the server must drop the connection.
    let mut header = [0u8; codec::HEADER_SIZE];
    codec::write_header(&mut header, 2, OpCode::InitRequest.as_u16());
    stream.write_all(&header).await.unwrap();

    let mut buf = [0u8; 8];
    let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("timed out waiting for close")
        .unwrap();
    assert_eq!(n, 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.server.connections.len(), 0);
}

#[tokio::test]
async fn test_idle_unbound_connection_is_swept() {
    let server = start_server(HandshakeConfig {
        unbound_timeout: Duration::from_millis(200),
        cleanup_interval: Duration::from_millis(50),
        ..HandshakeConfig::default()
    })
    .await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let mut buf = [0u8; 8];
    let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("idle connection should be closed by the sweep")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_frame_split_across_segments_still_admits() {
    let server = start_server(HandshakeConfig {
        required_connections: 1,
        ..HandshakeConfig::default()
    })
    .await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    // Dribble an InitRequest one byte at a time.
    let request = InitRequest {
        access_token: b"dribble".to_vec(),
    };
    let total = codec::HEADER_SIZE + request.encoded_len();
    let mut bytes = vec![0u8; total];
    codec::write_header(&mut bytes, total as u16, OpCode::InitRequest.as_u16());
    request.encode(&mut bytes[codec::HEADER_SIZE..]);
    for byte in bytes {
        stream.write_all(&[byte]).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let (opcode, _) = recv(&mut stream).await;
    assert_eq!(opcode, OpCode::InitResponse.as_u16());
}
