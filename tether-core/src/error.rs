//! Domain-specific error types for the tether framework.
//!
//! All fallible operations return `Result<T, TetherError>`.
//! No panics on invalid input — every error is typed and recoverable.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the tether framework.
#[derive(Debug, Error)]
pub enum TetherError {
    // ── Framing Errors ───────────────────────────────────────────
    /// The length prefix declares more bytes than the codec allows.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The length prefix is too small to hold the id/version header.
    #[error("invalid frame length: {declared}")]
    InvalidFrameLength { declared: usize },

    /// A WebSocket frame's embedded length disagrees with its content.
    #[error("content length mismatch: declared {declared}, actual {actual}")]
    ContentLengthMismatch { declared: usize, actual: usize },

    /// A WebSocket frame's content is shorter than the envelope header.
    #[error("truncated content: {len} bytes")]
    TruncatedContent { len: usize },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── WebSocket Errors ─────────────────────────────────────────
    /// The HTTP upgrade exchange failed before the link was usable.
    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    /// The WebSocket layer reported a protocol-level error.
    #[error("websocket error: {0}")]
    WebSocket(String),

    // ── Lifecycle Errors ─────────────────────────────────────────
    /// The connection object was released and cannot be reused.
    #[error("connection already released")]
    AlreadyReleased,
}

impl From<tokio_tungstenite::tungstenite::Error> for TetherError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        match e {
            tokio_tungstenite::tungstenite::Error::Io(io) => TetherError::Io(io),
            other => TetherError::WebSocket(other.to_string()),
        }
    }
}

// ── Failure codes ────────────────────────────────────────────────

/// Closed set of connection-failure classes surfaced through
/// [`on_failed`](crate::listener::ConnectionListener::on_failed).
///
/// Discriminants are stable wire-visible values; add new classes at
/// the end, never renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum FailureCode {
    /// The connection object was released and refused further use.
    AlreadyReleased = 1,

    /// The transport-level connect attempt failed (refused, timed out).
    ConnectException = 2,

    /// An unclassified error; never retried automatically.
    UnexpectedException = 3,

    /// The retry policy ran out of attempts.
    ExceededMaxRetries = 4,

    /// The remote end dropped the channel without a local disconnect.
    ConnectionDropped = 5,

    /// An I/O error killed an established channel.
    NetworkLost = 6,
}

impl FailureCode {
    /// The stable integer value for this class.
    pub fn as_code(self) -> i32 {
        self as i32
    }

    /// Whether this failure class schedules an automatic reconnect.
    ///
    /// Only transport-connect failures and established-link losses
    /// retry; unknown errors never do, to avoid retry storms.
    pub fn auto_retries(self) -> bool {
        match self {
            Self::ConnectException | Self::ConnectionDropped | Self::NetworkLost => true,
            Self::AlreadyReleased | Self::UnexpectedException | Self::ExceededMaxRetries => false,
        }
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::AlreadyReleased => "connection already released",
            Self::ConnectException => "connect exception",
            Self::UnexpectedException => "unexpected exception",
            Self::ExceededMaxRetries => "exceeded max retries",
            Self::ConnectionDropped => "connection disconnected by remote",
            Self::NetworkLost => "network lost",
        };
        write!(f, "{msg}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = TetherError::FrameTooLarge {
            size: 1000,
            max: 500,
        };
        assert!(e.to_string().contains("1000"));
        assert!(e.to_string().contains("500"));

        let e = TetherError::Timeout(Duration::from_secs(30));
        assert!(e.to_string().contains("30"));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: TetherError = io_err.into();
        assert!(matches!(e, TetherError::Io(_)));
    }

    #[test]
    fn failure_codes_are_stable() {
        assert_eq!(FailureCode::AlreadyReleased.as_code(), 1);
        assert_eq!(FailureCode::ConnectException.as_code(), 2);
        assert_eq!(FailureCode::UnexpectedException.as_code(), 3);
        assert_eq!(FailureCode::ExceededMaxRetries.as_code(), 4);
        assert_eq!(FailureCode::ConnectionDropped.as_code(), 5);
        assert_eq!(FailureCode::NetworkLost.as_code(), 6);
    }

    #[test]
    fn only_transport_failures_retry() {
        assert!(FailureCode::ConnectException.auto_retries());
        assert!(FailureCode::ConnectionDropped.auto_retries());
        assert!(FailureCode::NetworkLost.auto_retries());

        assert!(!FailureCode::AlreadyReleased.auto_retries());
        assert!(!FailureCode::UnexpectedException.auto_retries());
        assert!(!FailureCode::ExceededMaxRetries.auto_retries());
    }
}
