//! Application callback surfaces.
//!
//! Exactly one listener is registered per client connection (and one
//! per server). Callbacks fire on whichever worker task completes the
//! transition, never on a guaranteed thread, so implementations must
//! be `Send + Sync` and must not block; hand heavy work to a channel
//! or spawned task.

use bytes::Bytes;

use crate::error::{FailureCode, TetherError};
use crate::server::Session;

/// Client-side connection events.
pub trait ConnectionListener: Send + Sync {
    /// The link is up and commands may be sent.
    fn on_connected(&self);

    /// One decoded command arrived.
    fn on_received_data(&self, payload: Bytes, command_id: u8);

    /// The link closed on purpose. `by_remote` is true only for a
    /// clean close initiated by the peer (WebSocket close handshake).
    fn on_disconnected(&self, by_remote: bool);

    /// The link failed. Fires once per root cause; automatic retry,
    /// when the code allows it, is already scheduled by the time this
    /// runs.
    fn on_failed(&self, code: FailureCode, message: &str, cause: Option<&TetherError>);
}

/// Server-side lifecycle and per-session events.
pub trait ServerConnectListener: Send + Sync {
    /// The listening socket is bound and accepting.
    fn on_started(&self);

    /// Binding or accepting could not start.
    fn on_start_failed(&self, code: FailureCode, message: &str, cause: Option<&TetherError>);

    /// The server stopped accepting and closed its sessions.
    fn on_stopped(&self);

    /// A client completed the transport (and, in WebSocket mode, the
    /// upgrade) and is ready for traffic.
    fn on_client_connected(&self, session: &Session);

    /// One decoded command arrived on a session.
    fn on_received_data(&self, session: &Session, payload: Bytes, command_id: u8);

    /// A session's channel went away, cleanly or not.
    fn on_client_disconnected(&self, session: &Session);
}
