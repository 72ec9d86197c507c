//! RocksDB-backed persistent room store.
//!
//! Column families:
//! - `rooms`:    Full buffer snapshots (LZ4 compressed), keyed by room id
//! - `metadata`: Room metadata (bincode), keyed by room id
//!
//! Snapshot and metadata are always written in one atomic batch.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};

use super::{unix_now, RoomMetadata, RoomStore, StoreError};

/// Column family names.
const CF_ROOMS: &str = "rooms";
const CF_METADATA: &str = "metadata";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_ROOMS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pairpad_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed `RoomStore`.
pub struct RocksRoomStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksRoomStore {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened room store at {}", config.path.display());
        Ok(Self { db, config })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_ROOMS => {
                // Values are already LZ4 framed by us
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn write(&self, room_id: &str, compressed: &[u8], meta: &RoomMetadata) -> Result<(), StoreError> {
        let cf_rooms = self.cf(CF_ROOMS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_rooms, room_id.as_bytes(), compressed);
        batch.put_cf(cf_meta, room_id.as_bytes(), encode_metadata(meta)?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

impl RoomStore for RocksRoomStore {
    fn create_room(&self, room_id: &str) -> Result<RoomMetadata, StoreError> {
        if self.load_metadata(room_id)?.is_some() {
            return Err(StoreError::AlreadyExists(room_id.to_string()));
        }
        let compressed = lz4_flex::compress_prepend_size(b"");
        let mut meta = RoomMetadata::new(room_id);
        meta.compressed_size = compressed.len() as u64;
        self.write(room_id, &compressed, &meta)?;
        Ok(meta)
    }

    fn save_snapshot(&self, room_id: &str, code: &str) -> Result<RoomMetadata, StoreError> {
        let existing = self.load_metadata(room_id)?;
        if let Some(meta) = &existing {
            if self.load_snapshot(room_id)?.as_deref() == Some(code) {
                return Ok(meta.clone());
            }
        }

        let compressed = lz4_flex::compress_prepend_size(code.as_bytes());
        let mut meta = existing.unwrap_or_else(|| RoomMetadata::new(room_id));
        meta.snapshot_size = code.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        self.write(room_id, &compressed, &meta)?;
        log::debug!("Saved snapshot for room {room_id} ({} bytes)", code.len());
        Ok(meta)
    }

    fn load_snapshot(&self, room_id: &str) -> Result<Option<String>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        match self.db.get_cf(cf, room_id.as_bytes())? {
            Some(compressed) => {
                let bytes = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::CompressionError(e.to_string()))?;
                String::from_utf8(bytes)
                    .map(Some)
                    .map_err(|e| StoreError::DeserializationError(e.to_string()))
            }
            None => Ok(None),
        }
    }

    fn load_metadata(&self, room_id: &str) -> Result<Option<RoomMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, room_id.as_bytes())? {
            Some(bytes) => decode_metadata(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut room_ids = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            room_ids.push(id);
        }

        Ok(room_ids)
    }
}

fn encode_metadata(meta: &RoomMetadata) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(meta, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode_metadata(bytes: &[u8]) -> Result<RoomMetadata, StoreError> {
    let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(meta)
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
