//! WebSocket upgrades: console stream and bidirectional control socket.

mod handler;

pub use handler::{console_ws_handler, control_ws_handler};
