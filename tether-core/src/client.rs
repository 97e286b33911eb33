//! The client side: one resilient outbound connection.
//!
//! A `ClientConnection` is built once with an endpoint, a listener and
//! a retry policy, then reused across connect/disconnect cycles until
//! [`release`](ClientConnection::release) retires it for good.
//!
//! Threading model: `connect` / `disconnect_manually` / `release` all
//! serialize on the per-connection state lock, held only around state
//! checks and mutations. Transport I/O runs in the channel task (see
//! [`crate::channel`]); its events are consumed by a single task, so
//! every state transition has exactly one writer. Listener callbacks
//! fire from whichever task completes the transition.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::client_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, ChannelHandle, WireStream, spawn_channel};
use crate::codec::CommandCodec;
use crate::command::Command;
use crate::dispatch::CommandDispatcher;
use crate::error::{FailureCode, TetherError};
use crate::listener::ConnectionListener;
use crate::retry::RetryPolicy;
use crate::state::ConnectionState;

/// How long `release` waits for the channel tasks to wind down.
const RELEASE_GRACE: Duration = Duration::from_secs(2);

// ── Endpoint ─────────────────────────────────────────────────────

/// Where the client connects, and in which framing mode.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// Raw TCP carrying length-prefixed frames.
    Tcp { host: String, port: u16 },

    /// WebSocket upgrade over TCP (`ws://host:port/path`; TLS is out
    /// of scope).
    WebSocket { url: String },
}

impl Endpoint {
    fn connect_addr(&self) -> Result<String, TetherError> {
        match self {
            Self::Tcp { host, port } => Ok(format!("{host}:{port}")),
            Self::WebSocket { url } => ws_authority(url),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
            Self::WebSocket { url } => write!(f, "{url}"),
        }
    }
}

/// Extracts `host:port` from a `ws://` url, defaulting the port to 80.
fn ws_authority(url: &str) -> Result<String, TetherError> {
    let rest = url
        .strip_prefix("ws://")
        .ok_or_else(|| TetherError::WebSocket(format!("unsupported url scheme: {url}")))?;
    let authority = match rest.split('/').next() {
        Some(a) if !a.is_empty() => a,
        _ => return Err(TetherError::WebSocket(format!("missing host in url: {url}"))),
    };
    if authority.contains(':') {
        Ok(authority.to_string())
    } else {
        Ok(format!("{authority}:80"))
    }
}

// ── ClientConfig ─────────────────────────────────────────────────

/// Tunables for one client connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline for the transport connect (and, in WebSocket mode,
    /// for the upgrade handshake).
    pub connect_timeout: Duration,

    /// Depth of the per-channel outbound queue.
    pub outbound_queue: usize,

    /// Extra headers added to the WebSocket upgrade request.
    pub headers: Vec<(String, String)>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            outbound_queue: 128,
            headers: Vec::new(),
        }
    }
}

// ── ClientConnection ─────────────────────────────────────────────

/// One resilient outbound connection.
pub struct ClientConnection {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    endpoint: Endpoint,
    config: ClientConfig,
    listener: Arc<dyn ConnectionListener>,
    policy: Arc<dyn RetryPolicy>,

    /// The per-connection lock; every state check/mutation goes
    /// through it and it is never held across I/O.
    state: Mutex<ConnectionState>,

    /// Transport attempts made in the current reconnect cycle.
    attempts: AtomicU32,
    manual_disconnect: AtomicBool,
    caught_failure: AtomicBool,
    released: AtomicBool,

    live: Mutex<Option<LiveChannel>>,
    retry_cancel: Mutex<CancellationToken>,
}

struct LiveChannel {
    handle: ChannelHandle,
    io_task: JoinHandle<()>,
    consumer_task: JoinHandle<()>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ClientConnection {
    /// Raw-TCP client with the default configuration.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        listener: Arc<dyn ConnectionListener>,
        policy: Arc<dyn RetryPolicy>,
    ) -> Self {
        Self::with_config(
            Endpoint::Tcp {
                host: host.into(),
                port,
            },
            ClientConfig::default(),
            listener,
            policy,
        )
    }

    /// WebSocket client with the default configuration.
    pub fn websocket(
        url: impl Into<String>,
        listener: Arc<dyn ConnectionListener>,
        policy: Arc<dyn RetryPolicy>,
    ) -> Self {
        Self::with_config(
            Endpoint::WebSocket { url: url.into() },
            ClientConfig::default(),
            listener,
            policy,
        )
    }

    pub fn with_config(
        endpoint: Endpoint,
        config: ClientConfig,
        listener: Arc<dyn ConnectionListener>,
        policy: Arc<dyn RetryPolicy>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                endpoint,
                config,
                listener,
                policy,
                state: Mutex::new(ConnectionState::Uninitialized),
                attempts: AtomicU32::new(0),
                manual_disconnect: AtomicBool::new(false),
                caught_failure: AtomicBool::new(false),
                released: AtomicBool::new(false),
                live: Mutex::new(None),
                retry_cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Starts a connect cycle and returns the resulting state.
    ///
    /// No-op while already `Connecting`/`Connected`. After a failure
    /// the retry policy takes over; the return value reflects this
    /// first attempt only.
    pub async fn connect(&self) -> ConnectionState {
        self.inner.connect().await
    }

    /// Closes the link on purpose, so the eventual channel-inactive
    /// event reports `on_disconnected` instead of scheduling a retry.
    ///
    /// Returns `false` (and fires nothing) when there is nothing to
    /// disconnect. The `Disconnected` transition itself arrives with
    /// the channel-inactive event, not from this call.
    pub fn disconnect_manually(&self) -> bool {
        self.inner.disconnect_manually()
    }

    /// Tears the connection down for good. The object is single-use
    /// dead afterwards; `connect` reports `AlreadyReleased`.
    ///
    /// Blocks until the channel tasks stop, up to a bounded grace
    /// period, so avoid calling it from a latency-sensitive task.
    pub async fn release(&self) -> bool {
        self.inner.release().await
    }

    /// Enqueues a data command. `false` on any failed precondition
    /// (no channel, not `Connected`, queue full); write completion is
    /// never reflected here.
    pub fn execute_command(&self, cmd: &Command, description: &str) -> bool {
        self.inner.execute(cmd, description, false)
    }

    /// Enqueues a keep-alive. In WebSocket mode this goes out as a
    /// Ping control frame, so the encoded envelope must fit the
    /// 125-byte control-frame cap; raw mode sends it as data.
    pub fn execute_ping_command(&self, cmd: &Command, description: &str) -> bool {
        self.inner.execute(cmd, description, true)
    }

    /// Read-only state snapshot.
    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }
}

// ── Connect / retry ──────────────────────────────────────────────

impl ClientInner {
    async fn connect(self: &Arc<Self>) -> ConnectionState {
        if self.released.load(Ordering::SeqCst) {
            warn!("connect refused: connection already released");
            self.set_state(ConnectionState::Failed);
            self.listener.on_failed(
                FailureCode::AlreadyReleased,
                "connect on a released connection",
                Some(&TetherError::AlreadyReleased),
            );
            return ConnectionState::Failed;
        }

        {
            let mut state = lock(&self.state);
            if !state.can_initiate_connect() {
                debug!("connect ignored while {}", *state);
                return *state;
            }
            *state = ConnectionState::Connecting;
            // A fresh cycle; the previous manual disconnect is spent.
            self.manual_disconnect.store(false, Ordering::SeqCst);
        }
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        info!("connecting to {} (attempt {attempt})", self.endpoint);

        match self.establish().await {
            Ok((stream, peer)) => {
                if self.released.load(Ordering::SeqCst) {
                    // release() raced the attempt; drop the socket.
                    debug!("discarding socket established after release");
                    return *lock(&self.state);
                }
                self.install_channel(stream, peer);
                self.attempts.store(0, Ordering::SeqCst);
                self.caught_failure.store(false, Ordering::SeqCst);
                // A disconnect that raced this attempt is spent; the
                // established link must report later drops as unexpected.
                self.manual_disconnect.store(false, Ordering::SeqCst);
                self.set_state(ConnectionState::Connected);
                info!("connected to {} ({peer})", self.endpoint);
                self.listener.on_connected();
                ConnectionState::Connected
            }
            Err(e) => {
                warn!("connect to {} failed: {e}", self.endpoint);
                self.set_state(ConnectionState::Failed);
                self.listener.on_failed(
                    FailureCode::ConnectException,
                    &format!("connect failed: {e}"),
                    Some(&e),
                );
                if self.manual_disconnect.load(Ordering::SeqCst) {
                    debug!("not retrying: disconnect requested during the attempt");
                } else {
                    self.do_retry();
                }
                ConnectionState::Failed
            }
        }
    }

    /// Transport connect plus, in WebSocket mode, the upgrade
    /// handshake. Runs without any lock held.
    async fn establish(&self) -> Result<(WireStream, SocketAddr), TetherError> {
        let addr = self.endpoint.connect_addr()?;
        let tcp = match timeout(self.config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(TetherError::Timeout(self.config.connect_timeout)),
        };
        let peer = tcp.peer_addr()?;

        match &self.endpoint {
            Endpoint::Tcp { .. } => Ok((WireStream::Raw(Framed::new(tcp, CommandCodec)), peer)),
            Endpoint::WebSocket { url } => {
                let request = self.upgrade_request(url)?;
                let (ws, response) =
                    match timeout(self.config.connect_timeout, client_async(request, tcp)).await {
                        Ok(Ok(pair)) => pair,
                        Ok(Err(e)) => return Err(TetherError::Handshake(e.to_string())),
                        Err(_) => return Err(TetherError::Timeout(self.config.connect_timeout)),
                    };
                debug!("websocket upgrade completed: {}", response.status());
                Ok((WireStream::Ws(Box::new(ws)), peer))
            }
        }
    }

    fn upgrade_request(
        &self,
        url: &str,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, TetherError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TetherError::Handshake(e.to_string()))?;
        for (name, value) in &self.config.headers {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                (Ok(n), Ok(v)) => {
                    debug!("upgrade header {name}");
                    request.headers_mut().insert(n, v);
                }
                _ => warn!("skipping invalid upgrade header {name}"),
            }
        }
        Ok(request)
    }

    fn install_channel(self: &Arc<Self>, stream: WireStream, peer: SocketAddr) {
        let queue = self.config.outbound_queue.max(1);
        let (event_tx, event_rx) = mpsc::channel(queue);
        let (handle, io_task) = spawn_channel(stream, peer, queue, event_tx);
        let consumer_task = tokio::spawn(consume_events(
            Arc::downgrade(self),
            event_rx,
            handle.clone(),
        ));
        *lock(&self.live) = Some(LiveChannel {
            handle,
            io_task,
            consumer_task,
        });
    }

    /// Evaluates the retry budget and either schedules the next
    /// attempt on a cancellable timer or reports exhaustion.
    fn do_retry(self: &Arc<Self>) {
        if self.released.load(Ordering::SeqCst) {
            return;
        }

        let made = self.attempts.load(Ordering::SeqCst);
        let next = made + 1;
        if !self.policy.should_retry(next) {
            info!("retry budget exhausted after {made} attempts");
            self.stop_retry();
            self.set_state(ConnectionState::Failed);
            self.listener.on_failed(
                FailureCode::ExceededMaxRetries,
                "exceeded max retry attempts",
                None,
            );
            return;
        }

        let delay = self.policy.delay(next);
        let token = lock(&self.retry_cancel).clone();
        let weak = Arc::downgrade(self);
        info!("scheduling reconnect attempt {next} in {delay:?}");
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("scheduled reconnect cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            // Cancellation wins if it raced the timer.
            if token.is_cancelled() {
                debug!("scheduled reconnect cancelled");
                return;
            }
            if let Some(inner) = weak.upgrade() {
                inner.connect().await;
            }
        });
    }

    /// Cancels any pending retry and resets the cycle counter.
    fn stop_retry(&self) {
        let token = {
            let mut guard = lock(&self.retry_cancel);
            std::mem::replace(&mut *guard, CancellationToken::new())
        };
        token.cancel();
        self.attempts.store(0, Ordering::SeqCst);
    }

    // ── Disconnect / release ─────────────────────────────────────

    fn disconnect_manually(&self) -> bool {
        {
            let state = lock(&self.state);
            if !state.can_disconnect() {
                debug!("manual disconnect ignored while {}", *state);
                return false;
            }
        }
        info!("manual disconnect from {}", self.endpoint);
        self.manual_disconnect.store(true, Ordering::SeqCst);
        self.stop_retry();
        self.close_channel();
        true
    }

    async fn release(&self) -> bool {
        {
            let state = lock(&self.state);
            if *state == ConnectionState::Uninitialized {
                debug!("release ignored while Uninitialized");
                return false;
            }
        }
        if self.released.swap(true, Ordering::SeqCst) {
            debug!("release ignored: already released");
            return false;
        }

        info!("releasing connection to {}", self.endpoint);
        self.manual_disconnect.store(true, Ordering::SeqCst);
        self.stop_retry();

        let live = lock(&self.live).take();
        if let Some(live) = live {
            live.handle.close();
            let teardown = async {
                let _ = live.io_task.await;
                let _ = live.consumer_task.await;
            };
            if timeout(RELEASE_GRACE, teardown).await.is_err() {
                warn!("channel tasks did not stop within {RELEASE_GRACE:?}");
            }
        }

        self.set_state(ConnectionState::Uninitialized);
        info!("released connection to {}", self.endpoint);
        true
    }

    fn close_channel(&self) {
        let live = lock(&self.live);
        if let Some(live) = live.as_ref() {
            live.handle.close();
        }
    }

    // ── Command execution ────────────────────────────────────────

    fn execute(&self, cmd: &Command, description: &str, ping: bool) -> bool {
        if !lock(&self.state).is_connected() {
            warn!("exe[{description}]: not connected");
            return false;
        }
        let handle = lock(&self.live).as_ref().map(|l| l.handle.clone());
        let Some(handle) = handle else {
            warn!("exe[{description}]: channel not initialized");
            return false;
        };
        CommandDispatcher::send(&handle, cmd, description, ping)
    }

    // ── Event handling ───────────────────────────────────────────

    fn set_state(&self, next: ConnectionState) {
        let mut state = lock(&self.state);
        if *state != next {
            debug!("connection state {} -> {next}", *state);
            *state = next;
        }
    }

    fn handle_inactive(self: &Arc<Self>, clean: bool) {
        if self.released.load(Ordering::SeqCst) {
            // Teardown already owned by release(); stay quiet.
            return;
        }
        if self.caught_failure.load(Ordering::SeqCst) {
            // A fault already reported this root cause.
            return;
        }

        if self.manual_disconnect.load(Ordering::SeqCst) {
            info!("disconnected from {}", self.endpoint);
            self.set_state(ConnectionState::Disconnected);
            self.listener.on_disconnected(false);
        } else if clean {
            info!("disconnected by remote close handshake");
            self.set_state(ConnectionState::Disconnected);
            self.listener.on_disconnected(true);
        } else {
            warn!("connection to {} dropped", self.endpoint);
            self.set_state(ConnectionState::Failed);
            self.listener.on_failed(
                FailureCode::ConnectionDropped,
                "connection disconnected by remote",
                None,
            );
            self.do_retry();
        }
    }

    fn handle_fault(self: &Arc<Self>, e: TetherError, handle: &ChannelHandle) {
        if self.caught_failure.swap(true, Ordering::SeqCst) {
            debug!("suppressing repeated failure: {e}");
            return;
        }
        handle.close();
        if self.released.load(Ordering::SeqCst) {
            return;
        }

        let code = match &e {
            TetherError::Io(_) => FailureCode::NetworkLost,
            _ => FailureCode::UnexpectedException,
        };
        warn!("channel fault on {}: {e}", self.endpoint);
        self.set_state(ConnectionState::Failed);
        self.listener.on_failed(code, &e.to_string(), Some(&e));
        if code.auto_retries() && !self.manual_disconnect.load(Ordering::SeqCst) {
            self.do_retry();
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        // Owner handle is gone; stop the retry timer and the io task.
        self.retry_cancel
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        if let Some(live) = self
            .live
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            live.handle.close();
        }
    }
}

/// The single consumer of channel events; the only place runtime
/// transitions are applied.
async fn consume_events(
    inner: Weak<ClientInner>,
    mut event_rx: mpsc::Receiver<ChannelEvent>,
    handle: ChannelHandle,
) {
    while let Some(event) = event_rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            handle.close();
            return;
        };
        match event {
            ChannelEvent::Received(cmd) => {
                let id = cmd.id();
                inner.listener.on_received_data(cmd.into_payload(), id);
            }
            ChannelEvent::Inactive { clean } => {
                inner.handle_inactive(clean);
                return;
            }
            ChannelEvent::Fault(e) => {
                inner.handle_fault(e, &handle);
                return;
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::ConstantRetry;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    /// Listener that only counts how often each callback fired.
    #[derive(Default)]
    struct CountingListener {
        connected: AtomicUsize,
        disconnected: AtomicUsize,
        failed: AtomicUsize,
        received: AtomicUsize,
    }

    impl ConnectionListener for CountingListener {
        fn on_connected(&self) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }
        fn on_received_data(&self, _payload: Bytes, _command_id: u8) {
            self.received.fetch_add(1, Ordering::SeqCst);
        }
        fn on_disconnected(&self, _by_remote: bool) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
        fn on_failed(&self, _code: FailureCode, _message: &str, _cause: Option<&TetherError>) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fresh_client(listener: Arc<CountingListener>) -> ClientConnection {
        ClientConnection::new(
            "127.0.0.1",
            9,
            listener,
            Arc::new(ConstantRetry::new(1, Duration::from_millis(10))),
        )
    }

    #[test]
    fn starts_uninitialized() {
        let client = fresh_client(Arc::new(CountingListener::default()));
        assert_eq!(client.state(), ConnectionState::Uninitialized);
    }

    #[test]
    fn manual_disconnect_before_connect_is_a_noop() {
        let listener = Arc::new(CountingListener::default());
        let client = fresh_client(Arc::clone(&listener));

        assert!(!client.disconnect_manually());
        assert_eq!(client.state(), ConnectionState::Uninitialized);
        assert_eq!(listener.disconnected.load(Ordering::SeqCst), 0);
        assert_eq!(listener.failed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn release_before_connect_is_a_noop() {
        tokio_test::block_on(async {
            let client = fresh_client(Arc::new(CountingListener::default()));
            assert!(!client.release().await);
            assert_eq!(client.state(), ConnectionState::Uninitialized);
        });
    }

    #[test]
    fn execute_before_connect_returns_false() {
        let listener = Arc::new(CountingListener::default());
        let client = fresh_client(Arc::clone(&listener));

        let cmd = Command::new(6, Bytes::from_static(b"tap")).unwrap();
        assert!(!client.execute_command(&cmd, "touch"));
    }

    #[test]
    fn ws_authority_parsing() {
        assert_eq!(ws_authority("ws://10.0.0.7:8080/ss").unwrap(), "10.0.0.7:8080");
        assert_eq!(ws_authority("ws://example.test/ss").unwrap(), "example.test:80");
        assert!(ws_authority("wss://example.test/ss").is_err());
        assert!(ws_authority("ws:///nohost").is_err());
    }
}
