//! Viewer service core logic.
//!
//! Owns the client connection and its event stream: advertises the
//! local viewport after every connect, counts frames, answers the
//! stream with a demo tap and keeps the link alive with pings. Drops
//! are retried by the connection; this loop only decides which
//! failures are final.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use tether_core::{
    ClientConfig, ClientConnection, Command, ConnectionListener, ConstantRetry, Endpoint,
    ExponentRetry, FailureCode, RetryPolicy, TetherError,
};

use crate::config::{KeepaliveConfig, NetworkConfig, RetryConfig, ViewerConfig};

// ── Command vocabulary ───────────────────────────────────────────

pub const CMD_HEARTBEAT: u8 = 0;
pub const CMD_GRAPHIC_CSD: u8 = 1;
pub const CMD_GRAPHIC_DATA: u8 = 2;
pub const CMD_PAINT_EVENT: u8 = 3;
pub const CMD_DEVICE_SCREEN_INFO: u8 = 4;
pub const CMD_TRIGGER_I_FRAME: u8 = 5;
pub const CMD_TOUCH_EVENT: u8 = 6;

#[derive(Debug, Serialize, Deserialize)]
pub struct ScreenInfo {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TouchEvent {
    pub x: f32,
    pub y: f32,
    /// 0 = down, 1 = move, 2 = up.
    pub action: u8,
}

// ── Event plumbing ───────────────────────────────────────────────

#[derive(Debug)]
enum ViewerEvent {
    Connected,
    Received { id: u8, payload: Bytes },
    Disconnected { by_remote: bool },
    Failed(FailureCode),
}

struct ViewerListener(mpsc::UnboundedSender<ViewerEvent>);

impl ConnectionListener for ViewerListener {
    fn on_connected(&self) {
        let _ = self.0.send(ViewerEvent::Connected);
    }
    fn on_received_data(&self, payload: Bytes, command_id: u8) {
        let _ = self.0.send(ViewerEvent::Received {
            id: command_id,
            payload,
        });
    }
    fn on_disconnected(&self, by_remote: bool) {
        let _ = self.0.send(ViewerEvent::Disconnected { by_remote });
    }
    fn on_failed(&self, code: FailureCode, _message: &str, _cause: Option<&TetherError>) {
        let _ = self.0.send(ViewerEvent::Failed(code));
    }
}

fn retry_policy(cfg: &RetryConfig) -> Arc<dyn RetryPolicy> {
    let delay = Duration::from_millis(cfg.delay_ms);
    if cfg.exponential {
        Arc::new(ExponentRetry::new(cfg.max_attempts, delay))
    } else {
        Arc::new(ConstantRetry::new(cfg.max_attempts, delay))
    }
}

/// `None` disables keep-alives entirely.
fn ping_period(cfg: &KeepaliveConfig) -> Option<Duration> {
    if cfg.interval_secs == 0 {
        None
    } else {
        Some(Duration::from_secs(cfg.interval_secs))
    }
}

fn ws_url(net: &NetworkConfig) -> String {
    if net.path.starts_with('/') {
        format!("ws://{}:{}{}", net.host, net.port, net.path)
    } else {
        format!("ws://{}:{}/{}", net.host, net.port, net.path)
    }
}

fn endpoint(net: &NetworkConfig) -> Endpoint {
    match net.mode.as_str() {
        "raw" => Endpoint::Tcp {
            host: net.host.clone(),
            port: net.port,
        },
        "websocket" | "ws" => Endpoint::WebSocket { url: ws_url(net) },
        other => {
            warn!("unknown mode {other:?}; defaulting to websocket");
            Endpoint::WebSocket { url: ws_url(net) }
        }
    }
}

// ── ViewerService ────────────────────────────────────────────────

/// The top-level viewer service.
pub struct ViewerService {
    config: ViewerConfig,
    connection: ClientConnection,
    events: mpsc::UnboundedReceiver<ViewerEvent>,
    device: Option<ScreenInfo>,
    tapped: bool,
    frames: u64,
    window_frames: u64,
    window_bytes: u64,
    window_started: Instant,
}

impl ViewerService {
    pub fn new(config: ViewerConfig) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let client_config = ClientConfig {
            headers: vec![("x-tether-client".into(), env!("CARGO_PKG_VERSION").into())],
            ..ClientConfig::default()
        };
        let connection = ClientConnection::with_config(
            endpoint(&config.network),
            client_config,
            Arc::new(ViewerListener(tx)),
            retry_policy(&config.retry),
        );
        Self {
            config,
            connection,
            events,
            device: None,
            tapped: false,
            frames: 0,
            window_frames: 0,
            window_bytes: 0,
            window_started: Instant::now(),
        }
    }

    /// Run until Ctrl-C, a final failure or a disconnect.
    pub async fn run(mut self) -> Result<(), Box<dyn std::error::Error>> {
        info!("connecting to {}", self.connection.endpoint());
        self.connection.connect().await;

        // The interval needs some period even with pings disabled;
        // the select guard keeps it from ever firing.
        let ping = ping_period(&self.config.keepalive);
        let mut ping_timer = tokio::time::interval(ping.unwrap_or(Duration::from_secs(3600)));
        ping_timer.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl-C received — shutting down");
                    self.connection.disconnect_manually();
                    self.connection.release().await;
                    break;
                }
                event = self.events.recv() => match event {
                    Some(event) => {
                        if self.handle_event(event) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping_timer.tick(), if ping.is_some() => self.send_ping(),
            }
        }
        info!("viewer exiting after {} frames", self.frames);
        Ok(())
    }

    /// Returns `true` when the service should exit.
    fn handle_event(&mut self, event: ViewerEvent) -> bool {
        match event {
            ViewerEvent::Connected => {
                info!("connected to {}", self.connection.endpoint());
                self.advertise_viewport();
                self.window_frames = 0;
                self.window_bytes = 0;
                self.window_started = Instant::now();
                false
            }
            ViewerEvent::Received { id, payload } => {
                self.handle_command(id, payload);
                false
            }
            ViewerEvent::Disconnected { by_remote } => {
                if by_remote {
                    info!("master closed the stream");
                } else {
                    info!("disconnected");
                }
                true
            }
            ViewerEvent::Failed(code) => match code {
                FailureCode::ExceededMaxRetries => {
                    error!("giving up: retry budget exhausted");
                    true
                }
                FailureCode::AlreadyReleased => true,
                code if code.auto_retries() => {
                    warn!("link lost ({code}); reconnecting");
                    false
                }
                code => {
                    error!("unrecoverable failure: {code}");
                    true
                }
            },
        }
    }

    fn handle_command(&mut self, id: u8, payload: Bytes) {
        match id {
            CMD_GRAPHIC_CSD => {
                info!("codec config: {}", String::from_utf8_lossy(&payload));
            }
            CMD_GRAPHIC_DATA => self.count_frame(payload.len()),
            CMD_PAINT_EVENT => info!("paint event ({} bytes)", payload.len()),
            CMD_DEVICE_SCREEN_INFO => match serde_json::from_slice::<ScreenInfo>(&payload) {
                Ok(screen) => {
                    info!("device screen {}x{}", screen.width, screen.height);
                    self.device = Some(screen);
                }
                Err(e) => warn!("malformed screen info: {e}"),
            },
            other => debug!("ignoring command {other} ({} bytes)", payload.len()),
        }
    }

    fn count_frame(&mut self, len: usize) {
        self.frames += 1;
        self.window_frames += 1;
        self.window_bytes += len as u64;

        let elapsed = self.window_started.elapsed();
        if elapsed >= Duration::from_secs(5) {
            let secs = elapsed.as_secs_f64();
            info!(
                "{:.1} fps, {:.1} KiB/s",
                self.window_frames as f64 / secs,
                self.window_bytes as f64 / 1024.0 / secs
            );
            self.window_frames = 0;
            self.window_bytes = 0;
            self.window_started = Instant::now();
        }

        if !self.tapped {
            self.tapped = true;
            self.send_demo_tap();
        }
    }

    /// Tell the master how big our window is, for coordinate mapping.
    fn advertise_viewport(&self) {
        let viewport = ScreenInfo {
            width: self.config.viewport.width,
            height: self.config.viewport.height,
        };
        match serde_json::to_vec(&viewport) {
            Ok(json) => self.send(CMD_DEVICE_SCREEN_INFO, Bytes::from(json), "viewport"),
            Err(e) => warn!("cannot encode viewport: {e}"),
        }
    }

    /// One tap in the middle of the device screen, once the first
    /// frame has arrived.
    fn send_demo_tap(&self) {
        let (width, height) = match &self.device {
            Some(screen) => (screen.width, screen.height),
            None => (self.config.viewport.width, self.config.viewport.height),
        };
        let (x, y) = (width as f32 / 2.0, height as f32 / 2.0);
        for action in [0_u8, 2] {
            let touch = TouchEvent { x, y, action };
            match serde_json::to_vec(&touch) {
                Ok(json) => self.send(CMD_TOUCH_EVENT, Bytes::from(json), "touch"),
                Err(e) => warn!("cannot encode touch: {e}"),
            }
        }
        info!("sent demo tap at ({x:.0}, {y:.0})");
    }

    fn send_ping(&self) {
        if !self.connection.state().is_connected() {
            return;
        }
        match Command::new(CMD_HEARTBEAT, Bytes::new()) {
            Ok(ping) => {
                self.connection.execute_ping_command(&ping, "keep-alive");
            }
            Err(e) => warn!("cannot build keep-alive: {e}"),
        }
    }

    fn send(&self, id: u8, payload: Bytes, what: &str) {
        match Command::new(id, payload) {
            Ok(cmd) => {
                self.connection.execute_command(&cmd, what);
            }
            Err(e) => warn!("cannot build {what}: {e}"),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
