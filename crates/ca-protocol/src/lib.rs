//! ca-protocol: Wire vocabulary for the Claude Anywhere relay
//!
//! The transport is a WebSocket. Binary frames carry raw terminal bytes in
//! both directions; JSON text frames carry the small set of control and
//! status messages defined here.

pub mod error;
pub mod frame;
pub mod message;
pub mod session;

pub use error::ProtocolError;
pub use frame::{classify_binary, classify_text, close_code, parse_init, InboundFrame};
pub use message::{ClientMessage, InitMessage, ServerMessage, StatusKind, TerminalSize};
pub use session::SessionId;
