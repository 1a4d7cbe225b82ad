//! RocksDB-backed store.
//!
//! Column families, one per keyspace:
//! - `documents`   — `{project_id}` → document snapshot (LZ4 compressed)
//! - `changes`     — `{project_id}/{seq:u64 BE}` → change batch (LZ4 compressed)
//! - `sync_states` — `{project_id}/{peer_id}` → checkpoint with embedded expiry
//! - `chat`        — `{project_id}` → recent-chat ring
//! - `meta`        — `{project_id}` → { name, created_at, updated_at }
//!
//! Project ids contain no `/`, so the `{project_id}/` prefix is unambiguous
//! and change batches iterate in sequence order under the big-endian key.
//!
//! Writes that the room acknowledges (change appends, compaction) go through
//! atomic `WriteBatch`es with fsync, so a crash leaves the store at a batch
//! boundary. Compaction is a single batch: new snapshot in, superseded
//! change keys out.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, MultiThreaded, Options, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::clock::unix_secs;
use crate::protocol::ChatEntry;

const CF_DOCUMENTS: &str = "documents";
const CF_CHANGES: &str = "changes";
const CF_SYNC_STATES: &str = "sync_states";
const CF_CHAT: &str = "chat";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_CHANGES, CF_SYNC_STATES, CF_CHAT, CF_META];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path.
    pub path: PathBuf,
    /// Block cache size in bytes.
    pub block_cache_size: usize,
    /// fsync change appends and compactions. Durability of acknowledged
    /// mutations depends on this; disable only for tests.
    pub sync_writes: bool,
    /// Max open files for RocksDB.
    pub max_open_files: i32,
    /// Write buffer size per column family.
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/collab"),
            block_cache_size: 128 * 1024 * 1024,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync. For tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Project metadata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMeta {
    pub project_id: String,
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ProjectMeta {
    pub fn new(project_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = unix_secs();
        Self {
            project_id: project_id.into(),
            name: name.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Sync-state checkpoint with its expiry, stored as one value.
#[derive(Debug, Serialize, Deserialize)]
struct SyncStateRecord {
    expires_at: i64,
    state: Vec<u8>,
}

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

type Db = DBWithThreadMode<MultiThreaded>;

/// The durable key-value store behind every room.
pub struct CollabStore {
    db: Db,
    config: StoreConfig,
}

impl CollabStore {
    /// Open the store, creating the database and column families as needed.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
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

        let db = Db::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // Snapshots are large, infrequently rewritten.
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_CHANGES => {
                // Many small sequential writes, prefix-scanned per project.
                opts.set_max_write_buffer_number(4);
            }
            _ => {
                opts.set_max_write_buffer_number(2);
            }
        }

        opts
    }

    // ─── Snapshots & change log ───────────────────────────────────────

    /// Write a document snapshot without touching the change log.
    pub fn save_snapshot(&self, project_id: &str, snapshot: &[u8]) -> StoreResult<()> {
        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut batch = WriteBatch::default();
        batch.put_cf(&self.cf(CF_DOCUMENTS)?, project_id.as_bytes(), &compressed);
        self.touch_meta(&mut batch, project_id)?;
        self.write(batch, self.config.sync_writes)
    }

    /// Load a document snapshot, if one exists.
    pub fn load_snapshot(&self, project_id: &str) -> StoreResult<Option<Vec<u8>>> {
        match self.db.get_cf(&self.cf(CF_DOCUMENTS)?, project_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    /// Durably append one change batch. The caller owns the per-project
    /// sequence; the append is fsynced before returning (unless disabled).
    pub fn append_changes(&self, project_id: &str, seq: u64, changes: &[u8]) -> StoreResult<()> {
        let compressed = lz4_flex::compress_prepend_size(changes);
        let key = change_key(project_id, seq);

        let mut batch = WriteBatch::default();
        batch.put_cf(&self.cf(CF_CHANGES)?, &key, &compressed);
        self.touch_meta(&mut batch, project_id)?;
        self.write(batch, self.config.sync_writes)
    }

    /// Load all persisted change batches for a project, in sequence order.
    pub fn load_changes(&self, project_id: &str) -> StoreResult<Vec<(u64, Vec<u8>)>> {
        let cf = self.cf(CF_CHANGES)?;
        let prefix = change_prefix(project_id);

        let mut batches = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            if key.len() != prefix.len() + 8 {
                continue;
            }
            let mut seq_buf = [0u8; 8];
            seq_buf.copy_from_slice(&key[prefix.len()..]);
            let seq = u64::from_be_bytes(seq_buf);

            let changes = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            batches.push((seq, changes));
        }
        Ok(batches)
    }

    /// Highest persisted change sequence for a project.
    pub fn last_change_seq(&self, project_id: &str) -> StoreResult<Option<u64>> {
        Ok(self.load_change_seqs(project_id)?.last().copied())
    }

    /// Write a consolidating snapshot and delete the change batches it
    /// supersedes, in one atomic, synced batch. Returns the number of
    /// change keys deleted. Safe to re-run after a crash.
    pub fn compact(
        &self,
        project_id: &str,
        snapshot: &[u8],
        up_to_seq: u64,
    ) -> StoreResult<u64> {
        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut batch = WriteBatch::default();
        batch.put_cf(&self.cf(CF_DOCUMENTS)?, project_id.as_bytes(), &compressed);

        let cf_changes = self.cf(CF_CHANGES)?;
        let mut deleted = 0u64;
        for seq in self.load_change_seqs(project_id)? {
            if seq > up_to_seq {
                break;
            }
            batch.delete_cf(&cf_changes, change_key(project_id, seq));
            deleted += 1;
        }
        self.touch_meta(&mut batch, project_id)?;
        self.write(batch, self.config.sync_writes)?;
        Ok(deleted)
    }

    // ─── Sync-state checkpoints ───────────────────────────────────────

    /// Checkpoint a peer's sync state with an expiry timestamp.
    pub fn put_sync_state(
        &self,
        project_id: &str,
        peer_id: &str,
        state: &[u8],
        expires_at: i64,
    ) -> StoreResult<()> {
        let record = SyncStateRecord {
            expires_at,
            state: state.to_vec(),
        };
        let value = encode_record(&record)?;
        self.db
            .put_cf(&self.cf(CF_SYNC_STATES)?, sync_key(project_id, peer_id), value)?;
        Ok(())
    }

    /// Fetch a checkpointed sync state. Expired checkpoints are deleted and
    /// reported as absent.
    pub fn get_sync_state(
        &self,
        project_id: &str,
        peer_id: &str,
        now: i64,
    ) -> StoreResult<Option<Vec<u8>>> {
        let cf = self.cf(CF_SYNC_STATES)?;
        let key = sync_key(project_id, peer_id);
        match self.db.get_cf(&cf, &key)? {
            Some(bytes) => {
                let record: SyncStateRecord = decode_record(&bytes)?;
                if record.expires_at <= now {
                    self.db.delete_cf(&cf, &key)?;
                    Ok(None)
                } else {
                    Ok(Some(record.state))
                }
            }
            None => Ok(None),
        }
    }

    /// Drop a peer's checkpoint.
    pub fn delete_sync_state(&self, project_id: &str, peer_id: &str) -> StoreResult<()> {
        self.db
            .delete_cf(&self.cf(CF_SYNC_STATES)?, sync_key(project_id, peer_id))?;
        Ok(())
    }

    /// Sweep every expired checkpoint. Returns the number removed.
    pub fn delete_expired_sync_states(&self, now: i64) -> StoreResult<u64> {
        let cf = self.cf(CF_SYNC_STATES)?;
        let mut batch = WriteBatch::default();
        let mut removed = 0u64;

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            let expired = match decode_record::<SyncStateRecord>(&value) {
                Ok(record) => record.expires_at <= now,
                // Unreadable checkpoints are useless; drop them too.
                Err(_) => true,
            };
            if expired {
                batch.delete_cf(&cf, &key);
                removed += 1;
            }
        }

        if removed > 0 {
            self.db.write(batch)?;
        }
        Ok(removed)
    }

    // ─── Chat ring ────────────────────────────────────────────────────

    pub fn save_chat(&self, project_id: &str, entries: &[ChatEntry]) -> StoreResult<()> {
        let value = encode_record(&entries.to_vec())?;
        self.db
            .put_cf(&self.cf(CF_CHAT)?, project_id.as_bytes(), value)?;
        Ok(())
    }

    pub fn load_chat(&self, project_id: &str) -> StoreResult<Vec<ChatEntry>> {
        match self.db.get_cf(&self.cf(CF_CHAT)?, project_id.as_bytes())? {
            Some(bytes) => decode_record(&bytes),
            None => Ok(Vec::new()),
        }
    }

    // ─── Project metadata ─────────────────────────────────────────────

    pub fn put_meta(&self, meta: &ProjectMeta) -> StoreResult<()> {
        let value = encode_record(meta)?;
        self.db
            .put_cf(&self.cf(CF_META)?, meta.project_id.as_bytes(), value)?;
        Ok(())
    }

    pub fn get_meta(&self, project_id: &str) -> StoreResult<Option<ProjectMeta>> {
        match self.db.get_cf(&self.cf(CF_META)?, project_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_projects(&self) -> StoreResult<Vec<ProjectMeta>> {
        let cf = self.cf(CF_META)?;
        let mut projects = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            projects.push(decode_record(&value)?);
        }
        Ok(projects)
    }

    /// Remove every trace of a project.
    pub fn delete_project(&self, project_id: &str) -> StoreResult<()> {
        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf(CF_DOCUMENTS)?, project_id.as_bytes());
        batch.delete_cf(&self.cf(CF_CHAT)?, project_id.as_bytes());
        batch.delete_cf(&self.cf(CF_META)?, project_id.as_bytes());

        let cf_changes = self.cf(CF_CHANGES)?;
        for seq in self.load_change_seqs(project_id)? {
            batch.delete_cf(&cf_changes, change_key(project_id, seq));
        }

        let cf_sync = self.cf(CF_SYNC_STATES)?;
        let prefix = change_prefix(project_id);
        for item in self.db.iterator_cf(
            &cf_sync,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        ) {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            batch.delete_cf(&cf_sync, &key);
        }

        self.write(batch, self.config.sync_writes)
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> StoreResult<()> {
        self.db
            .flush()
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> StoreResult<std::sync::Arc<rocksdb::BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch, sync: bool) -> StoreResult<()> {
        let mut opts = WriteOptions::default();
        opts.set_sync(sync);
        self.db.write_opt(batch, &opts)?;
        Ok(())
    }

    fn touch_meta(&self, batch: &mut WriteBatch, project_id: &str) -> StoreResult<()> {
        if let Some(mut meta) = self.get_meta(project_id)? {
            meta.updated_at = unix_secs();
            batch.put_cf(&self.cf(CF_META)?, project_id.as_bytes(), encode_record(&meta)?);
        }
        Ok(())
    }

    fn load_change_seqs(&self, project_id: &str) -> StoreResult<Vec<u64>> {
        let cf = self.cf(CF_CHANGES)?;
        let prefix = change_prefix(project_id);
        let mut seqs = Vec::new();
        for item in self.db.iterator_cf(
            &cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        ) {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            if key.len() != prefix.len() + 8 {
                continue;
            }
            let mut seq_buf = [0u8; 8];
            seq_buf.copy_from_slice(&key[prefix.len()..]);
            seqs.push(u64::from_be_bytes(seq_buf));
        }
        Ok(seqs)
    }
}

fn change_prefix(project_id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(project_id.len() + 1);
    prefix.extend_from_slice(project_id.as_bytes());
    prefix.push(b'/');
    prefix
}

fn change_key(project_id: &str, seq: u64) -> Vec<u8> {
    let mut key = change_prefix(project_id);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn sync_key(project_id: &str, peer_id: &str) -> Vec<u8> {
    let mut key = change_prefix(project_id);
    key.extend_from_slice(peer_id.as_bytes());
    key
}

fn encode_record<T: serde::Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Codec(e.to_string()))
}

fn decode_record<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Codec(e.to_string()))?;
    Ok(value)
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
