//! Integration tests — connection lifecycle, retry behaviour, command
//! round-trips and disconnect semantics over real sockets on localhost.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;

use tether_core::{
    ClientConfig, ClientConnection, Command, ConnectionListener, ConnectionState, ConstantRetry,
    Endpoint, FailureCode, ServerConfig, ServerConnectListener, ServerListener, ServerMode,
    Session, TetherError,
};

// ── Helpers ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum ClientEvent {
    Connected,
    Received { id: u8, payload: Vec<u8> },
    Disconnected { by_remote: bool },
    Failed(FailureCode),
}

struct RecordingListener(mpsc::UnboundedSender<ClientEvent>);

impl ConnectionListener for RecordingListener {
    fn on_connected(&self) {
        let _ = self.0.send(ClientEvent::Connected);
    }
    fn on_received_data(&self, payload: Bytes, command_id: u8) {
        let _ = self.0.send(ClientEvent::Received {
            id: command_id,
            payload: payload.to_vec(),
        });
    }
    fn on_disconnected(&self, by_remote: bool) {
        let _ = self.0.send(ClientEvent::Disconnected { by_remote });
    }
    fn on_failed(&self, code: FailureCode, _message: &str, _cause: Option<&TetherError>) {
        let _ = self.0.send(ClientEvent::Failed(code));
    }
}

fn client_recorder() -> (Arc<RecordingListener>, mpsc::UnboundedReceiver<ClientEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(RecordingListener(tx)), rx)
}

#[derive(Debug, Clone, PartialEq)]
enum ServerEvent {
    Started,
    StartFailed(FailureCode),
    Stopped,
    ClientConnected(u64),
    Received {
        session: u64,
        id: u8,
        payload: Vec<u8>,
    },
    ClientDisconnected(u64),
}

struct RecordingServer(mpsc::UnboundedSender<ServerEvent>);

impl ServerConnectListener for RecordingServer {
    fn on_started(&self) {
        let _ = self.0.send(ServerEvent::Started);
    }
    fn on_start_failed(&self, code: FailureCode, _message: &str, _cause: Option<&TetherError>) {
        let _ = self.0.send(ServerEvent::StartFailed(code));
    }
    fn on_stopped(&self) {
        let _ = self.0.send(ServerEvent::Stopped);
    }
    fn on_client_connected(&self, session: &Session) {
        let _ = self.0.send(ServerEvent::ClientConnected(session.id()));
    }
    fn on_received_data(&self, session: &Session, payload: Bytes, command_id: u8) {
        let _ = self.0.send(ServerEvent::Received {
            session: session.id(),
            id: command_id,
            payload: payload.to_vec(),
        });
    }
    fn on_client_disconnected(&self, session: &Session) {
        let _ = self.0.send(ServerEvent::ClientDisconnected(session.id()));
    }
}

fn server_recorder() -> (Arc<RecordingServer>, mpsc::UnboundedReceiver<ServerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(RecordingServer(tx)), rx)
}

async fn next_event<E>(rx: &mut mpsc::UnboundedReceiver<E>) -> E {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timeout waiting for event")
        .expect("event channel closed")
}

/// Asserts that nothing further arrives within `dur`.
async fn assert_silent<E: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<E>, dur: Duration) {
    if let Ok(Some(event)) = timeout(dur, rx.recv()).await {
        panic!("unexpected event: {event:?}");
    }
}

/// Grab a port nobody is listening on by binding and dropping.
async fn refused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn retry(max_attempts: u32, delay_ms: u64) -> Arc<ConstantRetry> {
    Arc::new(ConstantRetry::new(max_attempts, Duration::from_millis(delay_ms)))
}

async fn started_server(
    mode: ServerMode,
) -> (ServerListener, mpsc::UnboundedReceiver<ServerEvent>, u16) {
    let (listener, mut rx) = server_recorder();
    let server = ServerListener::with_config(
        ServerConfig {
            mode,
            outbound_queue: 0,
        },
        listener,
    );
    assert!(server.start(0).await);
    assert_eq!(next_event(&mut rx).await, ServerEvent::Started);
    let port = server.local_addr().expect("bound address").port();
    (server, rx, port)
}

// ── Lifecycle ────────────────────────────────────────────────────

#[tokio::test]
async fn test_raw_lifecycle_and_round_trip() {
    let (server, mut server_rx, port) = started_server(ServerMode::Raw).await;
    let (listener, mut client_rx) = client_recorder();
    let client = ClientConnection::new("127.0.0.1", port, listener, retry(3, 50));

    assert_eq!(client.connect().await, ConnectionState::Connected);
    assert_eq!(next_event(&mut client_rx).await, ClientEvent::Connected);
    let session_id = match next_event(&mut server_rx).await {
        ServerEvent::ClientConnected(id) => id,
        other => panic!("expected ClientConnected, got {other:?}"),
    };

    // Client -> server.
    let touch = Command::new(6, Bytes::from_static(b"{\"x\":120,\"y\":540}")).unwrap();
    assert!(client.execute_command(&touch, "touch"));
    assert_eq!(
        next_event(&mut server_rx).await,
        ServerEvent::Received {
            session: session_id,
            id: 6,
            payload: b"{\"x\":120,\"y\":540}".to_vec(),
        }
    );

    // Server -> client.
    let session = server.session(session_id).expect("session registered");
    assert!(session.peer().ip().is_loopback());
    let csd = Command::new(1, Bytes::from_static(b"csd-blob")).unwrap();
    assert!(server.execute_command(&session, &csd, "graphic-csd"));
    assert_eq!(
        next_event(&mut client_rx).await,
        ClientEvent::Received {
            id: 1,
            payload: b"csd-blob".to_vec(),
        }
    );

    // Manual close: client reports a local disconnect, no retry.
    assert!(client.disconnect_manually());
    assert_eq!(
        next_event(&mut client_rx).await,
        ClientEvent::Disconnected { by_remote: false }
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(
        next_event(&mut server_rx).await,
        ServerEvent::ClientDisconnected(session_id)
    );
    assert_silent(&mut client_rx, Duration::from_millis(300)).await;

    // A disconnected client may connect again.
    assert_eq!(client.connect().await, ConnectionState::Connected);
    assert_eq!(next_event(&mut client_rx).await, ClientEvent::Connected);

    server.stop().await;
}

#[tokio::test]
async fn test_connect_while_connecting_is_one_attempt() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (recorder, mut client_rx) = client_recorder();
    let client = ClientConnection::new("127.0.0.1", port, recorder, retry(3, 50));

    let (first, second) = tokio::join!(client.connect(), client.connect());
    assert_eq!(first, ConnectionState::Connected);
    assert!(matches!(
        second,
        ConnectionState::Connecting | ConnectionState::Connected
    ));

    // Exactly one transport-level connect reached the listener.
    let _held = listener.accept().await.unwrap();
    assert!(
        timeout(Duration::from_millis(300), listener.accept())
            .await
            .is_err(),
        "second transport attempt observed"
    );
    assert_eq!(next_event(&mut client_rx).await, ClientEvent::Connected);
    assert_silent(&mut client_rx, Duration::from_millis(200)).await;
}

// ── Retry ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_refused_connect_retries_until_exhausted() {
    let port = refused_port().await;
    let (recorder, mut client_rx) = client_recorder();
    let client = ClientConnection::new("127.0.0.1", port, recorder, retry(3, 50));

    assert_eq!(client.connect().await, ConnectionState::Failed);

    for _ in 0..3 {
        assert_eq!(
            next_event(&mut client_rx).await,
            ClientEvent::Failed(FailureCode::ConnectException)
        );
    }
    assert_eq!(
        next_event(&mut client_rx).await,
        ClientEvent::Failed(FailureCode::ExceededMaxRetries)
    );
    assert_silent(&mut client_rx, Duration::from_millis(300)).await;
    assert_eq!(client.state(), ConnectionState::Failed);
}

#[tokio::test]
async fn test_two_attempt_budget_skips_third_attempt() {
    let port = refused_port().await;
    let (recorder, mut client_rx) = client_recorder();
    let client = ClientConnection::new("127.0.0.1", port, recorder, retry(2, 100));

    let started = Instant::now();
    client.connect().await;

    assert_eq!(
        next_event(&mut client_rx).await,
        ClientEvent::Failed(FailureCode::ConnectException)
    );
    assert_eq!(
        next_event(&mut client_rx).await,
        ClientEvent::Failed(FailureCode::ConnectException)
    );
    assert_eq!(
        next_event(&mut client_rx).await,
        ClientEvent::Failed(FailureCode::ExceededMaxRetries)
    );
    // Attempt 2 ran after one 100ms backoff; attempt 3 never fired.
    assert!(started.elapsed() >= Duration::from_millis(90));
    assert!(started.elapsed() < Duration::from_millis(800));
    assert_silent(&mut client_rx, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_unexpected_drop_reconnects_once() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (recorder, mut client_rx) = client_recorder();
    let client = ClientConnection::new("127.0.0.1", port, recorder, retry(3, 50));

    client.connect().await;
    let (first_peer, _) = listener.accept().await.unwrap();
    assert_eq!(next_event(&mut client_rx).await, ClientEvent::Connected);

    // Kill the link without a close handshake.
    drop(first_peer);

    assert_eq!(
        next_event(&mut client_rx).await,
        ClientEvent::Failed(FailureCode::ConnectionDropped)
    );
    let _second_peer = listener.accept().await.unwrap();
    assert_eq!(next_event(&mut client_rx).await, ClientEvent::Connected);
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_silent(&mut client_rx, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_manual_disconnect_cancels_pending_retry() {
    let port = refused_port().await;
    let (recorder, mut client_rx) = client_recorder();
    // Long delay so the retry is still pending when we cancel it.
    let client = ClientConnection::new("127.0.0.1", port, recorder, retry(3, 60_000));

    assert_eq!(client.connect().await, ConnectionState::Failed);
    assert_eq!(
        next_event(&mut client_rx).await,
        ClientEvent::Failed(FailureCode::ConnectException)
    );

    assert!(client.disconnect_manually());
    assert_silent(&mut client_rx, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_disconnect_during_failing_attempt_stops_the_cycle() {
    // Accepts the socket but never answers the upgrade, so the
    // attempt dies by timeout rather than refusal.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (recorder, mut client_rx) = client_recorder();
    let client = ClientConnection::with_config(
        Endpoint::WebSocket {
            url: format!("ws://127.0.0.1:{port}/tether"),
        },
        ClientConfig {
            connect_timeout: Duration::from_millis(400),
            ..ClientConfig::default()
        },
        recorder,
        retry(5, 50),
    );

    let (state, wanted_out) = tokio::join!(client.connect(), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.disconnect_manually()
    });
    assert_eq!(state, ConnectionState::Failed);
    assert!(wanted_out);

    // The timed-out attempt is still reported, but the cycle ends
    // there: no reconnect after a deliberate disconnect.
    assert_eq!(
        next_event(&mut client_rx).await,
        ClientEvent::Failed(FailureCode::ConnectException)
    );
    assert_silent(&mut client_rx, Duration::from_millis(600)).await;

    let _first = listener.accept().await.unwrap();
    assert!(
        timeout(Duration::from_millis(400), listener.accept())
            .await
            .is_err(),
        "transport attempt observed after a manual disconnect"
    );
}

#[tokio::test]
async fn test_connect_clears_stale_manual_disconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    // Delay the upgrade so a disconnect can race the attempt, then
    // let it succeed, hold the link briefly and kill it uncleanly.
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let ws = accept_async(stream).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        drop(ws);

        // The drop must count as unexpected: a reconnect arrives.
        timeout(Duration::from_secs(3), listener.accept())
            .await
            .expect("no reconnect after the drop")
            .unwrap();
    });

    let (recorder, mut client_rx) = client_recorder();
    let client = ClientConnection::websocket(
        format!("ws://127.0.0.1:{port}/tether"),
        recorder,
        retry(3, 50),
    );

    // The disconnect lands while the attempt is in flight; the
    // attempt then completes and wins.
    let (state, _) = tokio::join!(client.connect(), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(client.disconnect_manually());
    });
    assert_eq!(state, ConnectionState::Connected);
    assert_eq!(next_event(&mut client_rx).await, ClientEvent::Connected);

    assert_eq!(
        next_event(&mut client_rx).await,
        ClientEvent::Failed(FailureCode::ConnectionDropped)
    );
    server.await.unwrap();
}

// ── Failure classification ───────────────────────────────────────

#[tokio::test]
async fn test_garbage_frame_fails_without_retry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (recorder, mut client_rx) = client_recorder();
    let client = ClientConnection::new("127.0.0.1", port, recorder, retry(3, 50));

    client.connect().await;
    let (mut peer, _) = listener.accept().await.unwrap();
    assert_eq!(next_event(&mut client_rx).await, ClientEvent::Connected);

    // An absurd length prefix; the decoder must refuse it.
    peer.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).await.unwrap();
    peer.flush().await.unwrap();

    assert_eq!(
        next_event(&mut client_rx).await,
        ClientEvent::Failed(FailureCode::UnexpectedException)
    );
    // Malformed input never triggers a reconnect.
    assert_silent(&mut client_rx, Duration::from_millis(300)).await;
    assert_eq!(client.state(), ConnectionState::Failed);
    drop(peer);
}

#[tokio::test]
async fn test_release_makes_the_connection_single_use() {
    let (server, _server_rx, port) = started_server(ServerMode::Raw).await;
    let (recorder, mut client_rx) = client_recorder();
    let client = ClientConnection::new("127.0.0.1", port, recorder, retry(3, 50));

    client.connect().await;
    assert_eq!(next_event(&mut client_rx).await, ClientEvent::Connected);

    assert!(client.release().await);
    assert_eq!(client.state(), ConnectionState::Uninitialized);
    // Release tears down silently; no disconnect callback.
    assert_silent(&mut client_rx, Duration::from_millis(300)).await;

    assert_eq!(client.connect().await, ConnectionState::Failed);
    assert_eq!(
        next_event(&mut client_rx).await,
        ClientEvent::Failed(FailureCode::AlreadyReleased)
    );
    assert!(!client.release().await);

    server.stop().await;
}

// ── Command execution ────────────────────────────────────────────

#[tokio::test]
async fn test_execute_requires_connected_state() {
    let (server, _server_rx, port) = started_server(ServerMode::Raw).await;
    let (recorder, mut client_rx) = client_recorder();
    let client = ClientConnection::new("127.0.0.1", port, recorder, retry(3, 50));
    let cmd = Command::new(5, Bytes::new()).unwrap();

    assert!(!client.execute_command(&cmd, "trigger-i-frame"));

    client.connect().await;
    assert_eq!(next_event(&mut client_rx).await, ClientEvent::Connected);
    assert!(client.execute_command(&cmd, "trigger-i-frame"));

    client.disconnect_manually();
    assert_eq!(
        next_event(&mut client_rx).await,
        ClientEvent::Disconnected { by_remote: false }
    );
    assert!(!client.execute_command(&cmd, "trigger-i-frame"));

    server.stop().await;
}

#[tokio::test]
async fn test_large_payload_round_trip() {
    let (_server, mut server_rx, port) = started_server(ServerMode::Raw).await;
    let (recorder, mut client_rx) = client_recorder();
    let client = ClientConnection::new("127.0.0.1", port, recorder, retry(3, 50));

    client.connect().await;
    assert_eq!(next_event(&mut client_rx).await, ClientEvent::Connected);
    let session_id = match next_event(&mut server_rx).await {
        ServerEvent::ClientConnected(id) => id,
        other => panic!("expected ClientConnected, got {other:?}"),
    };

    // A frame the size of a real video packet.
    let blob = vec![0xAB_u8; 200 * 1024];
    let cmd = Command::new(2, Bytes::from(blob.clone())).unwrap();
    assert!(client.execute_command(&cmd, "graphic-data"));

    assert_eq!(
        next_event(&mut server_rx).await,
        ServerEvent::Received {
            session: session_id,
            id: 2,
            payload: blob,
        }
    );
}

// ── WebSocket mode ───────────────────────────────────────────────

#[tokio::test]
async fn test_websocket_round_trip() {
    let (server, mut server_rx, port) = started_server(ServerMode::WebSocket).await;
    let (recorder, mut client_rx) = client_recorder();
    let client = ClientConnection::websocket(
        format!("ws://127.0.0.1:{port}/tether"),
        recorder,
        retry(3, 50),
    );

    assert_eq!(client.connect().await, ConnectionState::Connected);
    assert_eq!(next_event(&mut client_rx).await, ClientEvent::Connected);
    let session_id = match next_event(&mut server_rx).await {
        ServerEvent::ClientConnected(id) => id,
        other => panic!("expected ClientConnected, got {other:?}"),
    };

    let hello = Command::text(4, "{\"width\":1080,\"height\":2340}").unwrap();
    assert!(client.execute_command(&hello, "device-screen-info"));
    assert_eq!(
        next_event(&mut server_rx).await,
        ServerEvent::Received {
            session: session_id,
            id: 4,
            payload: b"{\"width\":1080,\"height\":2340}".to_vec(),
        }
    );

    let session = server.session(session_id).expect("session registered");
    let frame = Command::new(2, Bytes::from_static(&[0x00, 0x01, 0x02, 0x80])).unwrap();
    assert!(server.execute_command(&session, &frame, "graphic-data"));
    assert_eq!(
        next_event(&mut client_rx).await,
        ClientEvent::Received {
            id: 2,
            payload: vec![0x00, 0x01, 0x02, 0x80],
        }
    );

    server.stop().await;
}

#[tokio::test]
async fn test_websocket_ping_is_not_data() {
    let (_server, mut server_rx, port) = started_server(ServerMode::WebSocket).await;
    let (recorder, mut client_rx) = client_recorder();
    let client = ClientConnection::websocket(
        format!("ws://127.0.0.1:{port}/tether"),
        recorder,
        retry(3, 50),
    );

    client.connect().await;
    assert_eq!(next_event(&mut client_rx).await, ClientEvent::Connected);
    let session_id = match next_event(&mut server_rx).await {
        ServerEvent::ClientConnected(id) => id,
        other => panic!("expected ClientConnected, got {other:?}"),
    };

    // The keep-alive travels as a control frame, invisible to the
    // server's data callback.
    let ping = Command::new(5, Bytes::new()).unwrap();
    assert!(client.execute_ping_command(&ping, "keep-alive"));

    // A ping bigger than a control frame is refused up front.
    let oversized = Command::new(5, Bytes::from(vec![0_u8; 200])).unwrap();
    assert!(!client.execute_ping_command(&oversized, "keep-alive"));

    let data = Command::new(3, Bytes::from_static(b"paint")).unwrap();
    assert!(client.execute_command(&data, "paint-event"));
    assert_eq!(
        next_event(&mut server_rx).await,
        ServerEvent::Received {
            session: session_id,
            id: 3,
            payload: b"paint".to_vec(),
        }
    );
}

#[tokio::test]
async fn test_websocket_server_close_reports_by_remote() {
    let (server, mut server_rx, port) = started_server(ServerMode::WebSocket).await;
    let (recorder, mut client_rx) = client_recorder();
    let client = ClientConnection::websocket(
        format!("ws://127.0.0.1:{port}/tether"),
        recorder,
        retry(3, 50),
    );

    client.connect().await;
    assert_eq!(next_event(&mut client_rx).await, ClientEvent::Connected);
    let session_id = match next_event(&mut server_rx).await {
        ServerEvent::ClientConnected(id) => id,
        other => panic!("expected ClientConnected, got {other:?}"),
    };

    // Stopping the server performs the close handshake per session.
    assert!(server.stop().await);
    assert_eq!(
        next_event(&mut client_rx).await,
        ClientEvent::Disconnected { by_remote: true }
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);
    // A deliberate remote close is not a drop; no retry.
    assert_silent(&mut client_rx, Duration::from_millis(300)).await;

    let mut saw_disconnect = false;
    let mut saw_stopped = false;
    for _ in 0..2 {
        match next_event(&mut server_rx).await {
            ServerEvent::ClientDisconnected(id) => {
                assert_eq!(id, session_id);
                saw_disconnect = true;
            }
            ServerEvent::Stopped => saw_stopped = true,
            other => panic!("unexpected server event: {other:?}"),
        }
    }
    assert!(saw_disconnect && saw_stopped);
}

#[tokio::test]
async fn test_stop_closes_sockets_awaiting_upgrade() {
    let (server, mut server_rx, port) = started_server(ServerMode::WebSocket).await;

    // A bare TCP connection that never starts the upgrade.
    let mut socket = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(server.stop().await);
    assert_eq!(next_event(&mut server_rx).await, ServerEvent::Stopped);

    // The half-open socket dies with the server rather than lingering
    // past the stop.
    let mut buf = [0_u8; 16];
    match timeout(Duration::from_secs(2), socket.read(&mut buf)).await {
        Ok(Ok(0)) => {}
        Ok(Ok(n)) => panic!("unexpected {n} bytes from a stopped server"),
        Ok(Err(_)) => {}
        Err(_) => panic!("socket outlived the stopped server"),
    }
}

// ── Sessions ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_two_sessions_receive_their_own_commands() {
    let (server, mut server_rx, port) = started_server(ServerMode::Raw).await;

    let (rec_a, mut rx_a) = client_recorder();
    let client_a = ClientConnection::new("127.0.0.1", port, rec_a, retry(3, 50));
    client_a.connect().await;
    assert_eq!(next_event(&mut rx_a).await, ClientEvent::Connected);
    let session_a = match next_event(&mut server_rx).await {
        ServerEvent::ClientConnected(id) => id,
        other => panic!("expected ClientConnected, got {other:?}"),
    };

    let (rec_b, mut rx_b) = client_recorder();
    let client_b = ClientConnection::new("127.0.0.1", port, rec_b, retry(3, 50));
    client_b.connect().await;
    assert_eq!(next_event(&mut rx_b).await, ClientEvent::Connected);
    let session_b = match next_event(&mut server_rx).await {
        ServerEvent::ClientConnected(id) => id,
        other => panic!("expected ClientConnected, got {other:?}"),
    };

    assert_ne!(session_a, session_b);
    assert_eq!(server.sessions().len(), 2);

    let to_a = Command::new(1, Bytes::from_static(b"alpha")).unwrap();
    let to_b = Command::new(1, Bytes::from_static(b"beta")).unwrap();
    let a = server.session(session_a).unwrap();
    let b = server.session(session_b).unwrap();
    assert!(server.execute_command(&a, &to_a, "fanout"));
    assert!(server.execute_command(&b, &to_b, "fanout"));

    assert_eq!(
        next_event(&mut rx_a).await,
        ClientEvent::Received {
            id: 1,
            payload: b"alpha".to_vec(),
        }
    );
    assert_eq!(
        next_event(&mut rx_b).await,
        ClientEvent::Received {
            id: 1,
            payload: b"beta".to_vec(),
        }
    );
    // No cross-talk.
    assert_silent(&mut rx_a, Duration::from_millis(200)).await;
    assert_silent(&mut rx_b, Duration::from_millis(200)).await;

    client_a.disconnect_manually();
    client_b.disconnect_manually();
    let mut gone = Vec::new();
    for _ in 0..2 {
        match next_event(&mut server_rx).await {
            ServerEvent::ClientDisconnected(id) => gone.push(id),
            other => panic!("unexpected server event: {other:?}"),
        }
    }
    gone.sort_unstable();
    let mut expected = vec![session_a, session_b];
    expected.sort_unstable();
    assert_eq!(gone, expected);
    assert!(server.sessions().is_empty());

    server.stop().await;
}
