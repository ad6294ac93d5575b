//! Protocol error types

use thiserror::Error;

/// Errors that can occur while interpreting client frames
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Text frame looked like a control message but did not parse
    #[error("Malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A control message arrived where a different one was required
    #[error("Unexpected message: expected {expected}, got {actual}")]
    Unexpected {
        expected: &'static str,
        actual: String,
    },

    /// Binary payload where a JSON control message was required
    #[error("Expected a text control message, got {0} binary bytes")]
    BinaryControl(usize),
}
