//! Persistent storage for room snapshots.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   save on GC    ┌──────────────┐
//! │ Room actor  │ ──────────────► │  RoomStore   │
//! │ (in-memory) │                 │ (RocksDB or  │
//! └──────┬──────┘                 │  in-memory)  │
//!        │ load on creation       └──────┬───────┘
//!        ▼                               │ column families
//! ┌─────────────┐     ┌──────────────────────────────────┐
//! │ buffer text │     │ CF "rooms":    LZ4 snapshots     │
//! └─────────────┘     │ CF "metadata": room metadata     │
//!                     └──────────────────────────────────┘
//! ```
//!
//! A snapshot is the full buffer text. Saving is an overwrite: saving the same
//! text twice leaves the store unchanged.

pub mod memory;
pub mod rocks;

pub use memory::MemoryRoomStore;
pub use rocks::{RocksRoomStore, StoreConfig};

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// Length of generated room identifiers.
pub const ROOM_ID_LEN: usize = 8;

/// Metadata stored alongside each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub room_id: String,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Stored (compressed) snapshot size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last content change (seconds since epoch)
    pub updated_at: u64,
}

impl RoomMetadata {
    pub(crate) fn new(room_id: &str) -> Self {
        let now = unix_now();
        Self {
            room_id: room_id.to_string(),
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Room not found: {0}")]
    NotFound(String),
    #[error("Room already exists: {0}")]
    AlreadyExists(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
}

/// Room persistence collaborator.
///
/// Implementations are synchronous; callers on the async side treat a call as a
/// short blocking write, the same way the hub treats any other local I/O.
pub trait RoomStore: Send + Sync {
    /// Register a new room with an empty snapshot.
    fn create_room(&self, room_id: &str) -> Result<RoomMetadata, StoreError>;

    /// Overwrite the room's snapshot, creating the room if it is unknown.
    fn save_snapshot(&self, room_id: &str, code: &str) -> Result<RoomMetadata, StoreError>;

    /// Load the room's snapshot; `None` if the room was never persisted.
    fn load_snapshot(&self, room_id: &str) -> Result<Option<String>, StoreError>;

    fn load_metadata(&self, room_id: &str) -> Result<Option<RoomMetadata>, StoreError>;

    fn room_exists(&self, room_id: &str) -> Result<bool, StoreError> {
        Ok(self.load_metadata(room_id)?.is_some())
    }

    fn list_rooms(&self) -> Result<Vec<String>, StoreError>;
}

/// Generate a short room identifier from a random v4 UUID.
pub fn generate_room_id() -> String {
    Uuid::new_v4().simple().to_string()[..ROOM_ID_LEN].to_string()
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
