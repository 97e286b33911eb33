//! Core connection framework shared by the tether tools.
//!
//! Both sides of a link speak the same length-prefixed command frames,
//! either straight over TCP or tunnelled through WebSocket frames:
//!
//! ```text
//!   ClientConnection ──connect──▶ ServerListener
//!        │    ▲                        │
//!     commands └──── auto retry ───────┘ sessions
//! ```
//!
//! The client side recovers from drops on its own (see
//! [`retry::RetryPolicy`]); the server side just keeps accepting.
//! Everything user-visible arrives through the listener traits, never
//! as an exception out of an I/O task.

mod channel;
pub mod client;
pub mod codec;
pub mod command;
mod dispatch;
pub mod error;
pub mod listener;
pub mod retry;
pub mod server;
pub mod state;

pub use channel::MAX_PING_CONTENT;
pub use client::{ClientConfig, ClientConnection, Endpoint};
pub use codec::CommandCodec;
pub use command::{CONTENT_HEADER_LEN, Command, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
pub use error::{FailureCode, TetherError};
pub use listener::{ConnectionListener, ServerConnectListener};
pub use retry::{ConstantRetry, ExponentRetry, RetryPolicy};
pub use server::{ServerConfig, ServerListener, ServerMode, Session};
pub use state::ConnectionState;
