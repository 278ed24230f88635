//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! One JSON object per text frame, discriminated by the `message` field.

use serde::{Deserialize, Serialize};

/// Messages exchanged between client and server.
///
/// Both sides speak the same closed set of frames; the heartbeat probe and
/// its reply travel as ordinary `ping`/`pong` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "snake_case")]
pub enum WireMessage {
    /// Bind this connection to a player identity.
    JoinGame {
        /// Requested player name. Must be non-empty.
        username: String,
    },

    /// Release this connection's player binding.
    LeaveGame,

    /// Heartbeat probe.
    Ping,

    /// Heartbeat reply.
    Pong,

    /// Protocol error report.
    Error {
        /// What went wrong.
        error: ProtocolError,
    },
}

/// Protocol error codes.
///
/// All of these are recoverable: the offending frame is answered with an
/// `error` reply and the connection stays open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolError {
    /// The requested username is bound to a live connection.
    UsernameInUse,

    /// The frame decoded but nothing routed it in this connection state.
    UnhandledMessage,

    /// The frame was not valid JSON or matched no known shape.
    MalformedMessage,

    /// `join_game` with an empty username.
    BlankUsername,
}

impl ProtocolError {
    /// Wire-format spelling of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolError::UsernameInUse => "username_in_use",
            ProtocolError::UnhandledMessage => "unhandled_message",
            ProtocolError::MalformedMessage => "malformed_message",
            ProtocolError::BlankUsername => "blank_username",
        }
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl WireMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Shorthand for an `error` reply frame.
    pub fn error(error: ProtocolError) -> Self {
        WireMessage::Error { error }
    }
}
