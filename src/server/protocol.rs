//! Protocol message definitions
//!
//! Defines the message types exchanged between game clients and the room server.
//! All messages are JSON text frames tagged by `"type"`. Client frames may carry a
//! protocol version for compatibility checking.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::room::{ClientId, RoomState};

/// Current protocol version
/// Increment when making breaking changes to message format
pub const PROTOCOL_VERSION: u32 = 1;

/// Minimum supported protocol version
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Maximum room name length
pub const MAX_ROOM_NAME_LENGTH: usize = 256;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Protocol version {0} not supported (min: {MIN_PROTOCOL_VERSION}, current: {PROTOCOL_VERSION})")]
    UnsupportedVersion(u32),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Message Envelope
// ============================================================================

/// Protocol envelope wrapping all client messages
/// Includes version for compatibility checking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    /// Protocol version used by the client
    #[serde(default = "default_version")]
    pub version: u32,
    /// The actual message payload
    #[serde(flatten)]
    pub message: ClientMessage,
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

impl ClientEnvelope {
    /// Create a new client envelope with the current protocol version
    pub fn new(message: ClientMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message,
        }
    }

    /// Parse and validate a client envelope from JSON
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let envelope: Self = serde_json::from_str(json)?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Validate the envelope and its contents
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.version < MIN_PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(self.version));
        }

        self.message.validate()
    }

    /// Serialize the envelope to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Client Messages
// ============================================================================

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join the running instance of a room type, creating it if needed
    JoinOrCreate {
        /// Room type name
        room: String,
        /// Free-form join options (accepted and ignored by the room)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<serde_json::Value>,
    },

    /// Overwrite the sender's stored position
    Position { x: f64, y: f64 },

    /// Leave the room gracefully; the connection is closed afterwards
    Leave,

    /// Connection keepalive ping
    Ping {
        /// Sequence number for tracking round-trip time
        seq: u64,
    },
}

impl ClientMessage {
    /// Validate message structure.
    ///
    /// Positions are not checked here: whether a coordinate is acceptable is
    /// decided by the room's [`PositionPolicy`](crate::room::PositionPolicy).
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            ClientMessage::JoinOrCreate { room, .. } => {
                if room.is_empty() {
                    return Err(ProtocolError::ValidationError(
                        "room cannot be empty".to_string(),
                    ));
                }
                if room.len() > MAX_ROOM_NAME_LENGTH {
                    return Err(ProtocolError::ValidationError(format!(
                        "room exceeds maximum length of {} characters",
                        MAX_ROOM_NAME_LENGTH
                    )));
                }
                Ok(())
            }
            ClientMessage::Position { .. } => Ok(()),
            ClientMessage::Leave => Ok(()),
            ClientMessage::Ping { .. } => Ok(()),
        }
    }

    /// Create a JoinOrCreate message without options
    pub fn join_or_create(room: impl Into<String>) -> Self {
        ClientMessage::JoinOrCreate {
            room: room.into(),
            options: None,
        }
    }

    /// Create a Position message
    pub fn position(x: f64, y: f64) -> Self {
        ClientMessage::Position { x, y }
    }

    /// Create a Ping message
    pub fn ping(seq: u64) -> Self {
        ClientMessage::Ping { seq }
    }
}

// ============================================================================
// Server Messages
// ============================================================================

/// Messages sent from server to clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Sent once right after the WebSocket upgrade
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected {
        /// Server protocol version
        version: u32,
        /// Id assigned to this connection
        session_id: ClientId,
    },

    /// Unicast greeting sent to a client after it joined
    #[serde(rename = "welcomeMessage")]
    WelcomeMessage {
        /// Human-readable text including the current player count
        message: String,
    },

    /// Broadcast after a join
    #[serde(rename = "player_joined", rename_all = "camelCase")]
    PlayerJoined {
        player_id: ClientId,
        player_count: usize,
    },

    /// Broadcast to the remaining clients after a leave
    #[serde(rename = "player_left", rename_all = "camelCase")]
    PlayerLeft {
        player_id: ClientId,
        player_count: usize,
    },

    /// Full room state, pushed after every change
    #[serde(rename = "state")]
    State { state: RoomState },

    /// Response to Ping
    #[serde(rename = "pong")]
    Pong {
        /// Echo back the sequence number
        seq: u64,
    },

    /// Error response
    #[serde(rename = "error")]
    Error {
        /// Error message
        message: String,
        /// Error code for programmatic handling
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Invalid message format
    InvalidMessage,
    /// Unsupported protocol version
    UnsupportedVersion,
    /// Message requires a joined room
    NotJoined,
    /// Connection already joined a room
    AlreadyJoined,
    /// No room type with that name
    RoomNotFound,
    /// Room could not accept the join
    RoomUnavailable,
    /// Internal server error
    InternalError,
}

impl ServerMessage {
    /// Create a Connected message
    pub fn connected(session_id: ClientId) -> Self {
        ServerMessage::Connected {
            version: PROTOCOL_VERSION,
            session_id,
        }
    }

    /// Create a WelcomeMessage
    pub fn welcome(message: impl Into<String>) -> Self {
        ServerMessage::WelcomeMessage {
            message: message.into(),
        }
    }

    /// Create a PlayerJoined message
    pub fn player_joined(player_id: ClientId, player_count: usize) -> Self {
        ServerMessage::PlayerJoined {
            player_id,
            player_count,
        }
    }

    /// Create a PlayerLeft message
    pub fn player_left(player_id: ClientId, player_count: usize) -> Self {
        ServerMessage::PlayerLeft {
            player_id,
            player_count,
        }
    }

    /// Create a State message
    pub fn state(state: RoomState) -> Self {
        ServerMessage::State { state }
    }

    /// Create a Pong message
    pub fn pong(seq: u64) -> Self {
        ServerMessage::Pong { seq }
    }

    /// Create an Error message with code
    pub fn error_with_code(message: impl Into<String>, code: ErrorCode) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: Some(code),
        }
    }

    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from a JSON text frame (used by clients and tests)
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// ============================================================================
// Conversion Traits
// ============================================================================

impl From<ProtocolError> for ServerMessage {
    fn from(err: ProtocolError) -> Self {
        let code = match &err {
            ProtocolError::SerializationError(_) => ErrorCode::InvalidMessage,
            ProtocolError::UnsupportedVersion(_) => ErrorCode::UnsupportedVersion,
            ProtocolError::ValidationError(_) => ErrorCode::InvalidMessage,
        };
        ServerMessage::error_with_code(err.to_string(), code)
    }
}

// ============================================================================
// Tests
// ============================================================================
