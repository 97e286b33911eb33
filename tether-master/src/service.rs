//! Master service core logic.
//!
//! Runs the listener, greets each viewer with the screen geometry and
//! codec setup data, then pushes synthetic frames at the configured
//! rate while applying whatever commands the viewers send back.

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tether_core::{
    Command, FailureCode, ServerConfig, ServerConnectListener, ServerListener, ServerMode, Session,
    TetherError,
};

use crate::config::MasterConfig;

// ── Command vocabulary ───────────────────────────────────────────

pub const CMD_HEARTBEAT: u8 = 0;
pub const CMD_GRAPHIC_CSD: u8 = 1;
pub const CMD_GRAPHIC_DATA: u8 = 2;
pub const CMD_PAINT_EVENT: u8 = 3;
pub const CMD_DEVICE_SCREEN_INFO: u8 = 4;
pub const CMD_TRIGGER_I_FRAME: u8 = 5;
pub const CMD_TOUCH_EVENT: u8 = 6;
pub const CMD_TOUCH_HOME: u8 = 7;
pub const CMD_TOUCH_BACK: u8 = 8;
pub const CMD_TOUCH_RECENT: u8 = 9;
pub const CMD_TOUCH_DRAG: u8 = 10;

/// Advertised to each viewer right after it connects.
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

impl TouchEvent {
    fn action_name(&self) -> &'static str {
        match self.action {
            0 => "down",
            1 => "move",
            2 => "up",
            _ => "unknown",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DragEvent {
    pub from_x: f32,
    pub from_y: f32,
    pub to_x: f32,
    pub to_y: f32,
    pub duration_ms: u64,
}

// ── Event plumbing ───────────────────────────────────────────────

#[derive(Debug)]
enum MasterEvent {
    Started,
    StartFailed(FailureCode),
    Stopped,
    ViewerConnected(u64),
    ViewerDisconnected(u64),
    Command {
        session: u64,
        id: u8,
        payload: Bytes,
    },
}

/// Forwards listener callbacks into the service's event loop.
struct PushListener(mpsc::UnboundedSender<MasterEvent>);

impl ServerConnectListener for PushListener {
    fn on_started(&self) {
        let _ = self.0.send(MasterEvent::Started);
    }
    fn on_start_failed(&self, code: FailureCode, _message: &str, _cause: Option<&TetherError>) {
        let _ = self.0.send(MasterEvent::StartFailed(code));
    }
    fn on_stopped(&self) {
        let _ = self.0.send(MasterEvent::Stopped);
    }
    fn on_client_connected(&self, session: &Session) {
        let _ = self.0.send(MasterEvent::ViewerConnected(session.id()));
    }
    fn on_received_data(&self, session: &Session, payload: Bytes, command_id: u8) {
        let _ = self.0.send(MasterEvent::Command {
            session: session.id(),
            id: command_id,
            payload,
        });
    }
    fn on_client_disconnected(&self, session: &Session) {
        let _ = self.0.send(MasterEvent::ViewerDisconnected(session.id()));
    }
}

fn server_mode(mode: &str) -> ServerMode {
    match mode {
        "raw" => ServerMode::Raw,
        "websocket" | "ws" => ServerMode::WebSocket,
        other => {
            warn!("unknown mode {other:?}; defaulting to websocket");
            ServerMode::WebSocket
        }
    }
}

// ── MasterService ────────────────────────────────────────────────

/// The top-level master service.
pub struct MasterService {
    config: MasterConfig,
    server: ServerListener,
    events: mpsc::UnboundedReceiver<MasterEvent>,
    seq: u32,
    force_keyframe: bool,
}

impl MasterService {
    pub fn new(config: MasterConfig) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let server = ServerListener::with_config(
            ServerConfig {
                mode: server_mode(&config.network.mode),
                outbound_queue: 0,
            },
            Arc::new(PushListener(tx)),
        );
        Self {
            config,
            server,
            events,
            seq: 0,
            force_keyframe: false,
        }
    }

    /// Run until Ctrl-C.
    pub async fn run(mut self) -> Result<(), Box<dyn std::error::Error>> {
        let port = self.config.network.port;
        if !self.server.start(port).await {
            return Err(format!("failed to start listener on port {port}").into());
        }

        let fps = u64::from(self.config.stream.fps.max(1));
        let mut ticker = tokio::time::interval(Duration::from_millis((1000 / fps).max(1)));

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl-C received — shutting down");
                    break;
                }
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = ticker.tick() => self.push_frame(),
            }
        }

        self.server.release().await;
        Ok(())
    }

    fn handle_event(&mut self, event: MasterEvent) {
        match event {
            MasterEvent::Started => debug!("listener up"),
            MasterEvent::StartFailed(code) => warn!("listener start failed: {code}"),
            MasterEvent::Stopped => debug!("listener stopped"),
            MasterEvent::ViewerConnected(id) => self.greet_viewer(id),
            MasterEvent::ViewerDisconnected(id) => info!("viewer {id} left"),
            MasterEvent::Command {
                session,
                id,
                payload,
            } => self.apply_command(session, id, payload),
        }
    }

    /// Screen geometry plus codec setup data, then a fresh keyframe.
    fn greet_viewer(&mut self, id: u64) {
        let Some(session) = self.server.session(id) else {
            return;
        };
        info!("viewer {id} connected from {}", session.peer());

        let stream = &self.config.stream;
        let screen = ScreenInfo {
            width: stream.width,
            height: stream.height,
        };
        match serde_json::to_vec(&screen) {
            Ok(json) => {
                self.send(&session, CMD_DEVICE_SCREEN_INFO, Bytes::from(json), "screen-info")
            }
            Err(e) => warn!("cannot encode screen info: {e}"),
        }

        let csd = format!("csd:{}x{}@{}", stream.width, stream.height, stream.fps);
        self.send(&session, CMD_GRAPHIC_CSD, Bytes::from(csd), "graphic-csd");
        self.force_keyframe = true;
    }

    fn apply_command(&mut self, session: u64, id: u8, payload: Bytes) {
        match id {
            // In raw mode keep-alives arrive as ordinary commands.
            CMD_HEARTBEAT => debug!("viewer {session} heartbeat"),
            CMD_TRIGGER_I_FRAME => {
                debug!("viewer {session} requested a keyframe");
                self.force_keyframe = true;
            }
            CMD_TOUCH_EVENT => match serde_json::from_slice::<TouchEvent>(&payload) {
                Ok(touch) => info!(
                    "viewer {session} touch {} at ({:.0}, {:.0})",
                    touch.action_name(),
                    touch.x,
                    touch.y
                ),
                Err(e) => warn!("viewer {session} sent malformed touch event: {e}"),
            },
            CMD_TOUCH_DRAG => match serde_json::from_slice::<DragEvent>(&payload) {
                Ok(drag) => info!(
                    "viewer {session} drag ({:.0}, {:.0}) -> ({:.0}, {:.0}) over {}ms",
                    drag.from_x, drag.from_y, drag.to_x, drag.to_y, drag.duration_ms
                ),
                Err(e) => warn!("viewer {session} sent malformed drag event: {e}"),
            },
            CMD_TOUCH_HOME => info!("viewer {session} pressed home"),
            CMD_TOUCH_BACK => info!("viewer {session} pressed back"),
            CMD_TOUCH_RECENT => info!("viewer {session} pressed recents"),
            CMD_PAINT_EVENT => info!("viewer {session} paint event ({} bytes)", payload.len()),
            CMD_DEVICE_SCREEN_INFO => match serde_json::from_slice::<ScreenInfo>(&payload) {
                Ok(vp) => info!("viewer {session} viewport {}x{}", vp.width, vp.height),
                Err(e) => warn!("viewer {session} sent malformed viewport: {e}"),
            },
            other => warn!("viewer {session} sent unknown command {other}"),
        }
    }

    /// One tick of the synthetic encoder.
    fn push_frame(&mut self) {
        let sessions = self.server.sessions();
        if sessions.is_empty() {
            return;
        }

        self.seq = self.seq.wrapping_add(1);
        let interval = self.config.stream.keyframe_interval.max(1);
        let keyframe = self.force_keyframe || self.seq % interval == 0;
        self.force_keyframe = false;

        let frame = self.synthetic_frame(keyframe);
        for session in &sessions {
            self.send(session, CMD_GRAPHIC_DATA, frame.clone(), "graphic-data");
        }
        if keyframe {
            debug!("pushed keyframe {} to {} viewers", self.seq, sessions.len());
        }
    }

    /// Frame stand-in: sequence number, keyframe flag, filler.
    fn synthetic_frame(&self, keyframe: bool) -> Bytes {
        let len = self.config.stream.frame_bytes.max(8);
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u32_le(self.seq);
        buf.put_u8(keyframe as u8);
        buf.resize(len, self.seq as u8);
        buf.freeze()
    }

    fn send(&self, session: &Session, id: u8, payload: Bytes, what: &str) {
        match Command::new(id, payload) {
            Ok(cmd) => {
                self.server.execute_command(session, &cmd, what);
            }
            Err(e) => warn!("cannot build {what}: {e}"),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
