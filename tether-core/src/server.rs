//! The server side: accept inbound links and fan out their commands.
//!
//! A `ServerListener` owns one accept loop plus one channel task and
//! one event-consumer task per accepted session. There is no retry
//! concept here; a server just keeps accepting. Each session decodes
//! independently, so one slow or broken peer cannot corrupt another's
//! frame boundary.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, ChannelHandle, WireStream, spawn_channel};
use crate::codec::CommandCodec;
use crate::command::Command;
use crate::dispatch::CommandDispatcher;
use crate::error::{FailureCode, TetherError};
use crate::listener::ServerConnectListener;
use crate::state::ConnectionState;

/// How long an accepted socket may take to finish the WebSocket
/// upgrade before it is dropped.
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

// ── Session ──────────────────────────────────────────────────────

/// One accepted connection.
pub struct Session {
    id: u64,
    state: Mutex<ConnectionState>,
    pub(crate) handle: ChannelHandle,
}

impl Session {
    /// Monotonic id, unique within this server instance.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.handle.peer()
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_open()
    }

    fn set_state(&self, next: ConnectionState) {
        *lock(&self.state) = next;
    }
}

impl std::fmt::Display for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session {} ({})", self.id, self.peer())
    }
}

// ── ServerConfig ─────────────────────────────────────────────────

/// Framing mode for accepted connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerMode {
    /// Length-prefixed frames straight on TCP.
    #[default]
    Raw,
    /// Expect a WebSocket upgrade on every accepted socket.
    WebSocket,
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub mode: ServerMode,
    /// Depth of each session's outbound queue. Zero means the
    /// default depth.
    pub outbound_queue: usize,
}

impl ServerConfig {
    fn queue(&self) -> usize {
        if self.outbound_queue == 0 {
            128
        } else {
            self.outbound_queue
        }
    }
}

// ── ServerListener ───────────────────────────────────────────────

/// Accepts connections and fans decoded commands out per session.
pub struct ServerListener {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    listener: Arc<dyn ServerConnectListener>,
    running: AtomicBool,
    released: AtomicBool,
    shutdown: Mutex<CancellationToken>,
    local_addr: Mutex<Option<SocketAddr>>,
    next_session: AtomicU64,
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ServerListener {
    pub fn new(listener: Arc<dyn ServerConnectListener>) -> Self {
        Self::with_config(ServerConfig::default(), listener)
    }

    pub fn with_config(config: ServerConfig, listener: Arc<dyn ServerConnectListener>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                listener,
                running: AtomicBool::new(false),
                released: AtomicBool::new(false),
                shutdown: Mutex::new(CancellationToken::new()),
                local_addr: Mutex::new(None),
                next_session: AtomicU64::new(0),
                sessions: Mutex::new(HashMap::new()),
                accept_task: Mutex::new(None),
            }),
        }
    }

    /// Binds `0.0.0.0:port` and starts accepting. Fires `on_started`
    /// on success, `on_start_failed` when the bind is refused.
    /// Returns `false` when already running or already released.
    pub async fn start(&self, port: u16) -> bool {
        self.inner.start(port).await
    }

    /// Stops accepting and closes every live session, then fires
    /// `on_stopped`. Per-session disconnect callbacks complete
    /// asynchronously. Returns whether the server had been running.
    pub async fn stop(&self) -> bool {
        self.inner.stop().await
    }

    /// Stops the server for good; a released server refuses `start`.
    pub async fn release(&self) -> bool {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            debug!("release ignored: server already released");
            return false;
        }
        info!("releasing server");
        self.inner.stop().await;
        true
    }

    /// Enqueues a data command on one session's channel. Same
    /// fire-and-forget contract as the client side.
    pub fn execute_command(&self, session: &Session, cmd: &Command, description: &str) -> bool {
        self.inner.execute(session, cmd, description, false)
    }

    /// Keep-alive variant; a Ping control frame in WebSocket mode.
    pub fn execute_ping_command(
        &self,
        session: &Session,
        cmd: &Command,
        description: &str,
    ) -> bool {
        self.inner.execute(session, cmd, description, true)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Bound address once running; handy with an ephemeral port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.inner.local_addr)
    }

    /// Snapshot of the live sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        lock(&self.inner.sessions).values().cloned().collect()
    }

    pub fn session(&self, id: u64) -> Option<Arc<Session>> {
        lock(&self.inner.sessions).get(&id).cloned()
    }
}

impl ServerInner {
    async fn start(self: &Arc<Self>, port: u16) -> bool {
        if self.released.load(Ordering::SeqCst) {
            warn!("start refused: server already released");
            self.listener.on_start_failed(
                FailureCode::AlreadyReleased,
                "start on a released server",
                Some(&TetherError::AlreadyReleased),
            );
            return false;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("start ignored: server already running");
            return false;
        }

        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(l) => l,
            Err(e) => {
                warn!("bind 0.0.0.0:{port} failed: {e}");
                self.running.store(false, Ordering::SeqCst);
                let err = TetherError::from(e);
                self.listener.on_start_failed(
                    FailureCode::ConnectException,
                    &format!("bind failed on port {port}"),
                    Some(&err),
                );
                return false;
            }
        };

        let addr = listener.local_addr().ok();
        *lock(&self.local_addr) = addr;
        let token = CancellationToken::new();
        *lock(&self.shutdown) = token.clone();

        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            inner.accept_loop(listener, token).await;
        });
        *lock(&self.accept_task) = Some(task);

        match addr {
            Some(addr) => info!("server listening on {addr}"),
            None => info!("server listening on port {port}"),
        }
        self.listener.on_started();
        true
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("accept loop shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let inner = Arc::clone(&self);
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                inner.run_session(stream, peer, shutdown).await;
                            });
                        }
                        Err(e) => warn!("accept failed: {e}"),
                    }
                }
            }
        }
    }

    /// Handshakes one accepted socket, registers the session and
    /// consumes its channel events until the link ends. A socket that
    /// is still mid-upgrade when the server stops is dropped rather
    /// than left to linger past the shutdown.
    async fn run_session(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) {
        let wire = match self.config.mode {
            ServerMode::Raw => WireStream::Raw(Framed::new(stream, CommandCodec)),
            ServerMode::WebSocket => tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("dropping {peer}: server stopped during the upgrade");
                    return;
                }
                upgraded = timeout(UPGRADE_TIMEOUT, accept_async(stream)) => match upgraded {
                    Ok(Ok(ws)) => WireStream::Ws(Box::new(ws)),
                    Ok(Err(e)) => {
                        warn!("websocket handshake with {peer} failed: {e}");
                        return;
                    }
                    Err(_) => {
                        warn!("websocket handshake with {peer} timed out");
                        return;
                    }
                },
            },
        };
        if shutdown.is_cancelled() {
            debug!("dropping {peer}: server stopped before registration");
            return;
        }

        let id = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        let queue = self.config.queue();
        let (event_tx, mut event_rx) = mpsc::channel(queue);
        let (handle, _io_task) = spawn_channel(wire, peer, queue, event_tx);
        let session = Arc::new(Session {
            id,
            state: Mutex::new(ConnectionState::Connected),
            handle,
        });
        lock(&self.sessions).insert(id, Arc::clone(&session));
        info!("{session} connected");
        self.listener.on_client_connected(&session);

        let mut failed = false;
        while let Some(event) = event_rx.recv().await {
            match event {
                ChannelEvent::Received(cmd) => {
                    let cmd_id = cmd.id();
                    self.listener
                        .on_received_data(&session, cmd.into_payload(), cmd_id);
                }
                ChannelEvent::Inactive { .. } => break,
                ChannelEvent::Fault(e) => {
                    warn!("{session} fault: {e}");
                    session.handle.close();
                    failed = true;
                    break;
                }
            }
        }

        session.set_state(if failed {
            ConnectionState::Failed
        } else {
            ConnectionState::Disconnected
        });
        lock(&self.sessions).remove(&id);
        info!("{session} disconnected");
        self.listener.on_client_disconnected(&session);
    }

    async fn stop(&self) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("stop ignored: server not running");
            return false;
        }

        lock(&self.shutdown).cancel();
        let task = lock(&self.accept_task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        *lock(&self.local_addr) = None;

        let sessions: Vec<Arc<Session>> = lock(&self.sessions).drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.handle.close();
        }
        if !sessions.is_empty() {
            info!("closed {} live sessions", sessions.len());
        }

        info!("server stopped");
        self.listener.on_stopped();
        true
    }

    fn execute(&self, session: &Session, cmd: &Command, description: &str, ping: bool) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            warn!("exe[{description}]: server not running");
            return false;
        }
        CommandDispatcher::send(&session.handle, cmd, description, ping)
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.shutdown
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        for session in self
            .sessions
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
        {
            session.handle.close();
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    struct QuietListener;

    impl ServerConnectListener for QuietListener {
        fn on_started(&self) {}
        fn on_start_failed(
            &self,
            _code: FailureCode,
            _message: &str,
            _cause: Option<&TetherError>,
        ) {
        }
        fn on_stopped(&self) {}
        fn on_client_connected(&self, _session: &Session) {}
        fn on_received_data(&self, _session: &Session, _payload: Bytes, _command_id: u8) {}
        fn on_client_disconnected(&self, _session: &Session) {}
    }

    #[tokio::test]
    async fn stop_before_start_returns_false() {
        let server = ServerListener::new(Arc::new(QuietListener));
        assert!(!server.stop().await);
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let server = ServerListener::new(Arc::new(QuietListener));
        assert!(server.start(0).await);
        assert!(!server.start(0).await);
        assert!(server.stop().await);
    }

    #[tokio::test]
    async fn released_server_refuses_start() {
        let server = ServerListener::new(Arc::new(QuietListener));
        assert!(server.start(0).await);
        assert!(server.release().await);
        assert!(!server.start(0).await);
        assert!(!server.release().await);
    }

    #[tokio::test]
    async fn ephemeral_port_is_reported() {
        let server = ServerListener::new(Arc::new(QuietListener));
        assert!(server.start(0).await);
        let addr = server.local_addr().expect("bound address");
        assert_ne!(addr.port(), 0);
        server.stop().await;
        assert!(server.local_addr().is_none());
    }
}
