//! Connection lifecycle state, shared by the client connection and by
//! each server-side session.
//!
//! ```text
//!  Uninitialized ──► Connecting ──► Connected ──┬──► Disconnected
//!        ▲               ▲  │                   │
//!        │               │  ▼                   ▼
//!     release()          └─ Failed ◄────────────┘
//!                 (retry / connect() re-enter Connecting)
//! ```
//!
//! Transitions are applied by the owning connection under its lock (or
//! by its single event-consumer task); this module only defines the
//! vocabulary and the read-only predicates used by callers and tests.

/// The current lifecycle state of one connection or session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Never connected, or fully torn down. Initial state.
    #[default]
    Uninitialized,

    /// A transport connect (and, in WebSocket mode, the upgrade
    /// handshake) is in flight.
    Connecting,

    /// The link is up; commands may flow.
    Connected,

    /// Closed on purpose, locally or by a clean remote close.
    Disconnected,

    /// The link died or never came up; a retry may be pending.
    Failed,
}

impl ConnectionState {
    /// Ready for protocol traffic.
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_connecting(self) -> bool {
        matches!(self, Self::Connecting)
    }

    /// Whether `connect()` would actually start an attempt from here
    /// rather than no-op.
    pub fn can_initiate_connect(self) -> bool {
        matches!(self, Self::Uninitialized | Self::Disconnected | Self::Failed)
    }

    /// Whether a manual disconnect has anything to do from here.
    pub fn can_disconnect(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Failed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "Uninitialized"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
