//! Inbound frame classification and close codes
//!
//! After the init exchange every binary frame is terminal input. Text frames
//! are terminal input too unless they parse as a [`ClientMessage`], so a
//! client that only ever sends keystrokes as text still works.

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::message::{ClientMessage, InitMessage};

/// WebSocket close codes used by the relay
pub mod close_code {
    /// Session ended normally
    pub const NORMAL: u16 = 1000;
    /// Relay is shutting down or being reconfigured
    pub const GOING_AWAY: u16 = 1001;
    /// Credential missing, malformed or wrong
    pub const AUTH_REJECTED: u16 = 4001;
    /// The agent process could not be started
    pub const SPAWN_FAILED: u16 = 4002;
    /// No traffic from the client within the heartbeat timeout
    pub const HEARTBEAT_TIMEOUT: u16 = 4003;
}

/// Meaning of a frame received from the client while bridging
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// A control message for the relay
    Control(ClientMessage),
    /// Bytes to write to the agent's terminal
    Input(Bytes),
}

/// Classify a text frame
pub fn classify_text(text: &str) -> InboundFrame {
    if text.trim_start().starts_with('{') {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => return InboundFrame::Control(message),
            Err(e) => {
                tracing::trace!("Text frame is not a control message ({}), forwarding as input", e);
            }
        }
    }
    InboundFrame::Input(Bytes::copy_from_slice(text.as_bytes()))
}

/// Classify a binary frame (always terminal input)
pub fn classify_binary(data: impl Into<Bytes>) -> InboundFrame {
    InboundFrame::Input(data.into())
}

/// Parse the mandatory init message of an authenticating connection
pub fn parse_init(text: &str) -> Result<InitMessage, ProtocolError> {
    match serde_json::from_str::<ClientMessage>(text)? {
        ClientMessage::Init(init) => Ok(init),
        other => Err(ProtocolError::Unexpected {
            expected: "init",
            actual: other.kind().to_string(),
        }),
    }
}
