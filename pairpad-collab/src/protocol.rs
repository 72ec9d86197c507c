//! Binary protocol for origin-tagged buffer synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ origin    │ room_id  │ seq      │ hub_seq  │ payload  │
//! │ 1 byte   │ 16 bytes  │ variable │ varint   │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! `seq` is the origin's own monotonically increasing edit counter. `hub_seq`
//! is assigned by the hub when it serializes an edit (0 on the way in), and is
//! the authoritative order every peer observes.
//!
//! Edit and snapshot payloads are the full buffer text as UTF-8, never a diff.
//! Connections that speak plain WebSocket text frames skip this format entirely
//! and exchange the raw buffer text.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Connection announces itself and the room it wants
    Join = 1,
    /// Full-buffer edit
    Edit = 2,
    /// Canonical buffer sent to a freshly joined (or resynced) connection
    Snapshot = 3,
    /// Peer joined notification
    PeerJoined = 4,
    /// Peer left notification
    PeerLeft = 5,
    /// Heartbeat ping
    Ping = 6,
    /// Heartbeat pong
    Pong = 7,
}

/// Peer identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            peer_id: Uuid::new_v4(),
            name: name.into(),
        }
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
        }
    }
}

/// Presence payload carried by PeerJoined / PeerLeft.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Presence {
    pub peer: PeerInfo,
    /// Open connections in the room after the change
    pub peer_count: usize,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Connection the message originated from (nil for hub-originated)
    pub origin: Uuid,
    pub room_id: String,
    /// Origin-local edit sequence number
    pub seq: u64,
    /// Hub serialization order (0 until the hub stamps it)
    pub hub_seq: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Create a join request.
    pub fn join(room_id: impl Into<String>, info: &PeerInfo) -> Self {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type: MessageType::Join,
            origin: info.peer_id,
            room_id: room_id.into(),
            seq: 0,
            hub_seq: 0,
            payload,
        }
    }

    /// Create a full-buffer edit.
    pub fn edit(origin: Uuid, room_id: impl Into<String>, seq: u64, hub_seq: u64, text: &str) -> Self {
        Self {
            msg_type: MessageType::Edit,
            origin,
            room_id: room_id.into(),
            seq,
            hub_seq,
            payload: text.as_bytes().to_vec(),
        }
    }

    /// Create a snapshot of the canonical buffer at `hub_seq`.
    pub fn snapshot(room_id: impl Into<String>, hub_seq: u64, text: &str) -> Self {
        Self {
            msg_type: MessageType::Snapshot,
            origin: Uuid::nil(),
            room_id: room_id.into(),
            seq: 0,
            hub_seq,
            payload: text.as_bytes().to_vec(),
        }
    }

    /// Create a peer joined notification.
    pub fn peer_joined(room_id: impl Into<String>, presence: &Presence) -> Self {
        Self::presence(MessageType::PeerJoined, room_id, presence)
    }

    /// Create a peer left notification.
    pub fn peer_left(room_id: impl Into<String>, presence: &Presence) -> Self {
        Self::presence(MessageType::PeerLeft, room_id, presence)
    }

    fn presence(msg_type: MessageType, room_id: impl Into<String>, presence: &Presence) -> Self {
        let payload = bincode::serde::encode_to_vec(presence, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type,
            origin: presence.peer.peer_id,
            room_id: room_id.into(),
            seq: 0,
            hub_seq: 0,
            payload,
        }
    }

    /// Create a ping message.
    pub fn ping(origin: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            origin,
            room_id: String::new(),
            seq: 0,
            hub_seq: 0,
            payload: Vec::new(),
        }
    }

    /// Create a pong message.
    pub fn pong(origin: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            origin,
            room_id: String::new(),
            seq: 0,
            hub_seq: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Buffer text of an Edit or Snapshot.
    pub fn text(&self) -> Result<&str, ProtocolError> {
        match self.msg_type {
            MessageType::Edit | MessageType::Snapshot => std::str::from_utf8(&self.payload)
                .map_err(|e| ProtocolError::DeserializationError(e.to_string())),
            _ => Err(ProtocolError::InvalidMessageType),
        }
    }

    /// Parse the peer info of a Join.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::Join {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (info, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(info)
    }

    /// Parse the presence payload of PeerJoined / PeerLeft.
    pub fn presence_info(&self) -> Result<Presence, ProtocolError> {
        if !matches!(self.msg_type, MessageType::PeerJoined | MessageType::PeerLeft) {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (presence, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(presence)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    /// Operation not valid in the connection's current lifecycle state
    InvalidState(&'static str),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::InvalidState(state) => write!(f, "Invalid connection state: {state}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
