//! WebSocket server module
//!
//! Handles WebSocket connections from game clients and routes their messages
//! to rooms.

#[allow(dead_code)]
mod protocol;
mod websocket;

pub use protocol::*;
pub use websocket::*;
