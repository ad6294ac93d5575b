//! WebSocket relay server

mod context;
mod handler;
mod listener;

pub use context::{RelayContext, Timeouts};
pub use handler::{handle_socket, ConnectionPhase};
pub use listener::{RelayHandle, RelayServer};
