//! # tether-client — screen-share viewer
//!
//! Connects a [`tether_core::ClientConnection`] to a running master,
//! reports frame throughput, keeps the link alive with pings and
//! sends touch commands back. Reconnection on drops is handled by the
//! connection itself; this crate only decides when to give up.

pub mod config;
pub mod service;
