//! ca-relay: Claude Anywhere relay
//!
//! Streams an AI coding agent's terminal to remote devices over WebSocket.
//! Each connection gets its own pseudo-terminal and agent process, which is
//! killed when the connection goes away.

pub mod commands;
pub mod output;
pub mod server;
pub mod service;
pub mod session;

pub use server::{RelayContext, RelayHandle, RelayServer, Timeouts};
pub use service::{RelayService, StartTrigger};
pub use session::{CommandSpec, PtySession, SessionManager, SessionState};
