//! In-memory room store, used when no storage path is configured.

use std::collections::HashMap;
use std::sync::RwLock;

use super::{unix_now, RoomMetadata, RoomStore, StoreError};

#[derive(Debug, Clone)]
struct StoredRoom {
    code: String,
    meta: RoomMetadata,
}

/// Volatile `RoomStore`; contents are lost with the process.
#[derive(Debug, Default)]
pub struct MemoryRoomStore {
    rooms: RwLock<HashMap<String, StoredRoom>>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StoreError {
        StoreError::DatabaseError("room map lock poisoned".into())
    }
}

impl RoomStore for MemoryRoomStore {
    fn create_room(&self, room_id: &str) -> Result<RoomMetadata, StoreError> {
        let mut rooms = self.rooms.write().map_err(|_| Self::poisoned())?;
        if rooms.contains_key(room_id) {
            return Err(StoreError::AlreadyExists(room_id.to_string()));
        }
        let meta = RoomMetadata::new(room_id);
        rooms.insert(
            room_id.to_string(),
            StoredRoom {
                code: String::new(),
                meta: meta.clone(),
            },
        );
        Ok(meta)
    }

    fn save_snapshot(&self, room_id: &str, code: &str) -> Result<RoomMetadata, StoreError> {
        let mut rooms = self.rooms.write().map_err(|_| Self::poisoned())?;
        let entry = rooms.entry(room_id.to_string()).or_insert_with(|| StoredRoom {
            code: String::new(),
            meta: RoomMetadata::new(room_id),
        });
        if entry.code != code {
            entry.code = code.to_string();
            entry.meta.snapshot_size = code.len() as u64;
            entry.meta.compressed_size = code.len() as u64;
            entry.meta.updated_at = unix_now();
        }
        Ok(entry.meta.clone())
    }

    fn load_snapshot(&self, room_id: &str) -> Result<Option<String>, StoreError> {
        let rooms = self.rooms.read().map_err(|_| Self::poisoned())?;
        Ok(rooms.get(room_id).map(|r| r.code.clone()))
    }

    fn load_metadata(&self, room_id: &str) -> Result<Option<RoomMetadata>, StoreError> {
        let rooms = self.rooms.read().map_err(|_| Self::poisoned())?;
        Ok(rooms.get(room_id).map(|r| r.meta.clone()))
    }

    fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let rooms = self.rooms.read().map_err(|_| Self::poisoned())?;
        let mut ids: Vec<String> = rooms.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_then_load_empty() {
        let store = MemoryRoomStore::new();
        store.create_room("abc").unwrap();
        assert_eq!(store.load_snapshot("abc").unwrap().as_deref(), Some(""));
        assert!(store.room_exists("abc").unwrap());
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let store = MemoryRoomStore::new();
        store.create_room("abc").unwrap();
        assert!(matches!(
            store.create_room("abc"),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_save_is_idempotent() {
        let store = MemoryRoomStore::new();
        let first = store.save_snapshot("r", "print(1)").unwrap();
        let second = store.save_snapshot("r", "print(1)").unwrap();
        assert_eq!(first, second);
        assert_eq!(store.load_snapshot("r").unwrap().as_deref(), Some("print(1)"));
        assert_eq!(store.list_rooms().unwrap(), vec!["r".to_string()]);
    }

    #[test]
    fn test_unknown_room() {
        let store = MemoryRoomStore::new();
        assert!(store.load_snapshot("missing").unwrap().is_none());
        assert!(!store.room_exists("missing").unwrap());
    }
}
