//! # warden-server
//!
//! Hosts the arbiter over WebSocket. Each connection is one channel: the
//! handshake's `Origin` header becomes the verified origin of every request
//! on it, and once-grants made on it end with it.
//!
//! - [`server`]: router, `/health`, `/ws`, connection limit, shutdown
//! - [`websocket`]: the WebSocket transport adapter and session driver
//! - [`health`]: the `/health` body

#![deny(unsafe_code)]

pub mod health;
pub mod server;
pub mod websocket;

pub use server::{AppState, WardenServer};
