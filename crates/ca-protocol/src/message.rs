//! Control and status messages
//!
//! Messages are JSON objects discriminated by a `type` field and travel in
//! WebSocket text frames. Terminal data never goes through this module: it
//! is sent as binary frames, byte for byte.
//!
//! # Message Flow
//!
//! 1. Client connects and sends `init` (carrying the token in local-subnet mode)
//! 2. Server answers `status: starting`, spawns the agent, then `status: ready`
//! 3. Terminal I/O flows bidirectionally as binary frames
//! 4. Client may send `resize`, `restart` or `ping` at any time
//! 5. Server sends `status: session_ended` when the agent process exits

use std::fmt;

use serde::{Deserialize, Serialize};

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Number of rows
    pub rows: u16,
    /// Number of columns
    pub cols: u16,
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Default terminal size (24x80)
    pub fn default_size() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::default_size()
    }
}

/// First message sent by a client after the upgrade
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitMessage {
    /// Shared token (required in local-subnet mode, ignored otherwise)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Requested working directory for the agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Initial terminal width
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    /// Initial terminal height
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
}

impl InitMessage {
    /// Terminal size requested by the client, falling back to 24x80
    pub fn size(&self) -> TerminalSize {
        let default = TerminalSize::default();
        TerminalSize::new(
            self.rows.unwrap_or(default.rows),
            self.cols.unwrap_or(default.cols),
        )
    }
}

impl fmt::Debug for InitMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitMessage")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("cwd", &self.cwd)
            .field("cols", &self.cols)
            .field("rows", &self.rows)
            .finish()
    }
}

/// Control messages sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Session parameters and credential
    Init(InitMessage),

    /// Resize the pseudo-terminal
    Resize { cols: u16, rows: u16 },

    /// Kill the current agent process and start a fresh one
    Restart,

    /// Application-level keepalive
    Ping,
}

impl ClientMessage {
    /// Short name used in logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Init(_) => "init",
            ClientMessage::Resize { .. } => "resize",
            ClientMessage::Restart => "restart",
            ClientMessage::Ping => "ping",
        }
    }
}

/// Session status reported to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    /// Agent process is being spawned
    Starting,
    /// Agent process is running and attached
    Ready,
    /// Credential missing or wrong; the socket is about to close
    AuthFailed,
    /// Agent process could not be created
    SpawnFailed,
    /// Agent process exited or the session was torn down
    SessionEnded,
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusKind::Starting => "starting",
            StatusKind::Ready => "ready",
            StatusKind::AuthFailed => "auth_failed",
            StatusKind::SpawnFailed => "spawn_failed",
            StatusKind::SessionEnded => "session_ended",
        };
        f.write_str(s)
    }
}

/// Messages sent by the server in text frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Session status change
    Status { status: StatusKind, message: String },

    /// Reply to a client `ping`
    Pong,
}

impl ServerMessage {
    /// Build a status message
    pub fn status(status: StatusKind, message: impl Into<String>) -> Self {
        ServerMessage::Status {
            status,
            message: message.into(),
        }
    }

    /// Encode as the JSON text carried by a WebSocket text frame
    pub fn to_json(&self) -> String {
        // Serializing these enums cannot fail: every field is a plain string or enum.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}
