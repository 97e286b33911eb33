//! # tether-master — screen-share source
//!
//! Hosts a [`tether_core::ServerListener`] that viewers connect to,
//! pushes a synthetic frame stream to every session and applies the
//! touch/navigation commands viewers send back.
//!
//! The frame generator stands in for a real capture pipeline; the
//! command vocabulary and the session handling are the part that
//! matters here.

pub mod config;
pub mod service;
