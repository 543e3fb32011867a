//! RocksDB-backed versioned object store and client registry.
//!
//! Column families:
//! - `objects` — `(doc, key)` → current row `{version, deleted, payload}`.
//!   Deletes are tombstones: the row stays queryable for diffing.
//! - `changes` — `(doc, version BE, key)` → (empty). Secondary index for
//!   "changed since" scans; holds exactly one entry per key because the
//!   stale entry is removed in the same batch that rewrites the row.
//! - `clients` — `client_id` → `{last_mutation_id, last_cookie, doc}`.
//! - `meta`    — `doc` → head version (8 bytes big-endian).
//!
//! Object payloads are LZ4-compressed JSON. All keys are prefixed with the
//! length-framed document id so documents never interleave in a scan.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, SnapshotWithThreadMode, WriteBatch,
    WriteOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Column family names.
const CF_OBJECTS: &str = "objects";
const CF_CHANGES: &str = "changes";
const CF_CLIENTS: &str = "clients";
const CF_META: &str = "meta";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_OBJECTS, CF_CHANGES, CF_CLIENTS, CF_META];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every commit (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ripple_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Current row for one `(document, key)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ObjectRecord {
    /// Commit version of the last write to this key
    version: u64,
    /// Tombstone flag — the key reads as absent but stays diffable
    deleted: bool,
    /// LZ4-compressed JSON value (empty for tombstones)
    payload: Vec<u8>,
}

impl ObjectRecord {
    fn live(version: u64, value: &Value) -> Result<Self, StoreError> {
        let json = serde_json::to_vec(value)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        Ok(Self {
            version,
            deleted: false,
            payload: lz4_flex::compress_prepend_size(&json),
        })
    }

    fn tombstone(version: u64) -> Self {
        Self {
            version,
            deleted: true,
            payload: Vec::new(),
        }
    }

    fn value(&self) -> Result<Value, StoreError> {
        let json = lz4_flex::decompress_size_prepended(&self.payload)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| StoreError::DeserializationError(e.to_string()))
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(record)
    }
}

/// Per-client registry record.
///
/// `last_mutation_id` is the idempotency watermark; `last_cookie` is the
/// checkpoint most recently handed to the client by a pull. Created lazily
/// on first contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub last_mutation_id: u64,
    pub last_cookie: u64,
    pub document_id: String,
}

impl ClientRecord {
    fn new(document_id: &str) -> Self {
        Self {
            last_mutation_id: 0,
            last_cookie: 0,
            document_id: document_id.to_string(),
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(record)
    }
}

/// Result of a snapshot-consistent pull read.
#[derive(Debug, Clone)]
pub struct PullData {
    /// Rows changed since the request cookie: `None` value = tombstone
    pub rows: Vec<(String, Option<Value>)>,
    /// Head version of the document at the snapshot (the response cookie)
    pub head_version: u64,
    /// The pulling client's mutation watermark at the snapshot
    pub last_mutation_id: u64,
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed versioned object store.
///
/// One commit version is assigned per write batch; every row written by a
/// batch shares it, so a diff covering that version returns all of them.
/// The version counter is recovered from the `meta` column family at open.
pub struct ObjectStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    /// Store configuration
    config: StoreConfig,
    /// Last assigned commit version
    version: AtomicU64,
    /// Serializes read-modify-write commits so the change index never
    /// holds two entries for one key
    commit_lock: Mutex<()>,
}

impl ObjectStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let cf_opts = Self::cf_options(name, &config);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let version = Self::recover_version(&db)?;

        Ok(Self {
            db,
            config,
            version: AtomicU64::new(version),
            commit_lock: Mutex::new(()),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_OBJECTS | CF_CLIENTS | CF_META => {
                // Point lookups dominate
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_CHANGES => {
                // Range-scanned by (doc, version); values are empty
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    /// Recover the highest assigned commit version by scanning document
    /// head versions in the `meta` column family.
    fn recover_version(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let cf = match db.cf_handle(CF_META) {
            Some(cf) => cf,
            None => return Ok(0),
        };

        let mut max = 0u64;
        let iter = db.iterator_cf(&cf, IteratorMode::Start);
        for item in iter {
            let (_, value) = item?;
            max = max.max(decode_u64(&value)?);
        }
        Ok(max)
    }

    // ─── Object reads ─────────────────────────────────────────────────

    /// Get the current value for a key.
    ///
    /// Returns `None` for tombstoned and never-written keys alike.
    pub fn get(&self, document_id: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let cf = self.cf(CF_OBJECTS)?;
        match self.db.get_cf(&cf, object_key(document_id, key))? {
            Some(bytes) => {
                let record = ObjectRecord::decode(&bytes)?;
                if record.deleted {
                    Ok(None)
                } else {
                    Ok(Some(record.value()?))
                }
            }
            None => Ok(None),
        }
    }

    /// Every key changed strictly after `since`, including tombstones.
    ///
    /// The boundary is exclusive: a cookie handed out by a previous pull
    /// never re-delivers rows that pull already covered.
    pub fn changed_since(
        &self,
        document_id: &str,
        since: u64,
    ) -> Result<Vec<(String, Option<Value>)>, StoreError> {
        let cf_changes = self.cf(CF_CHANGES)?;
        let cf_objects = self.cf(CF_OBJECTS)?;
        let snapshot = self.db.snapshot();
        self.scan_changes(&snapshot, cf_changes, cf_objects, document_id, since)
    }

    /// Max `last_modified` across the document, 0 when empty.
    pub fn head_version(&self, document_id: &str) -> Result<u64, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(&cf, doc_prefix(document_id))? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    /// Snapshot-consistent read of everything a pull needs: changed rows,
    /// document head version, and the client's watermark, all at one point
    /// in time.
    pub fn pull_snapshot(
        &self,
        document_id: &str,
        client_id: &str,
        since: u64,
    ) -> Result<PullData, StoreError> {
        let cf_changes = self.cf(CF_CHANGES)?;
        let cf_objects = self.cf(CF_OBJECTS)?;
        let cf_clients = self.cf(CF_CLIENTS)?;
        let cf_meta = self.cf(CF_META)?;

        let snapshot = self.db.snapshot();

        let head_version = match snapshot.get_cf(cf_meta, doc_prefix(document_id))? {
            Some(bytes) => decode_u64(&bytes)?,
            None => 0,
        };

        let last_mutation_id = match snapshot.get_cf(cf_clients, client_id.as_bytes())? {
            Some(bytes) => ClientRecord::decode(&bytes)?.last_mutation_id,
            None => 0,
        };

        let rows = self.scan_changes(&snapshot, cf_changes, cf_objects, document_id, since)?;

        Ok(PullData {
            rows,
            head_version,
            last_mutation_id,
        })
    }

    /// Walk the change index from `since + 1` to the end of the document.
    fn scan_changes(
        &self,
        snapshot: &SnapshotWithThreadMode<'_, DBWithThreadMode<SingleThreaded>>,
        cf_changes: &rocksdb::ColumnFamily,
        cf_objects: &rocksdb::ColumnFamily,
        document_id: &str,
        since: u64,
    ) -> Result<Vec<(String, Option<Value>)>, StoreError> {
        let prefix = doc_prefix(document_id);
        let start = change_key(document_id, since.saturating_add(1), "");

        let mut rows = Vec::new();
        let iter = snapshot.iterator_cf(
            cf_changes,
            IteratorMode::From(&start, Direction::Forward),
        );

        for item in iter {
            let (key, _) = item?;

            // Stop once we've left this document's key range
            if key.len() < prefix.len() + 8 || key[..prefix.len()] != prefix[..] {
                break;
            }

            let user_key = std::str::from_utf8(&key[prefix.len() + 8..])
                .map_err(|_| {
                    StoreError::DeserializationError("Non-UTF8 key in change index".into())
                })?
                .to_string();

            let record = match snapshot.get_cf(cf_objects, object_key(document_id, &user_key))? {
                Some(bytes) => ObjectRecord::decode(&bytes)?,
                // Index entry without a row should not happen; skip rather
                // than fail the whole pull
                None => continue,
            };

            let value = if record.deleted {
                None
            } else {
                Some(record.value()?)
            };
            rows.push((user_key, value));
        }

        Ok(rows)
    }

    // ─── Commits ──────────────────────────────────────────────────────

    /// Upsert one key. Clears any tombstone.
    ///
    /// Returns the commit version assigned to the write.
    pub fn put(&self, document_id: &str, key: &str, value: Value) -> Result<u64, StoreError> {
        self.commit(document_id, &[(key.to_string(), Some(value))], None)
    }

    /// Tombstone one key. The row stays queryable for diffing.
    ///
    /// Returns the commit version assigned to the tombstone.
    pub fn delete(&self, document_id: &str, key: &str) -> Result<u64, StoreError> {
        self.commit(document_id, &[(key.to_string(), None)], None)
    }

    /// Apply a batch of writes and an optional client watermark update as
    /// one atomic transaction.
    ///
    /// `writes` entries with `Some(value)` upsert the key and clear any
    /// tombstone; `None` entries tombstone it. All rows written by one call
    /// share a single freshly assigned commit version, and the document
    /// head advances to it. The watermark never decreases, regardless of
    /// the id passed in.
    ///
    /// Returns the document head version after the commit. A watermark-only
    /// commit (empty `writes`) leaves the document where it was.
    pub fn commit(
        &self,
        document_id: &str,
        writes: &[(String, Option<Value>)],
        client: Option<(&str, u64)>,
    ) -> Result<u64, StoreError> {
        let cf_objects = self.cf(CF_OBJECTS)?;
        let cf_changes = self.cf(CF_CHANGES)?;
        let cf_clients = self.cf(CF_CLIENTS)?;
        let cf_meta = self.cf(CF_META)?;

        let _guard = self
            .commit_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut batch = WriteBatch::default();

        let commit_version = if writes.is_empty() {
            match self.db.get_cf(cf_meta, doc_prefix(document_id))? {
                Some(bytes) => decode_u64(&bytes)?,
                None => 0,
            }
        } else {
            let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;

            for (key, value) in writes {
                let okey = object_key(document_id, key);

                // Drop the stale index entry so the change index keeps
                // exactly one entry per key
                if let Some(bytes) = self.db.get_cf(cf_objects, &okey)? {
                    let old = ObjectRecord::decode(&bytes)?;
                    batch.delete_cf(cf_changes, change_key(document_id, old.version, key));
                }

                let record = match value {
                    Some(v) => ObjectRecord::live(version, v)?,
                    None => ObjectRecord::tombstone(version),
                };
                batch.put_cf(cf_objects, &okey, record.encode()?);
                batch.put_cf(cf_changes, change_key(document_id, version, key), b"");
            }

            batch.put_cf(cf_meta, doc_prefix(document_id), version.to_be_bytes());
            version
        };

        if let Some((client_id, last_mutation_id)) = client {
            let mut record = self
                .client_record(client_id)?
                .unwrap_or_else(|| ClientRecord::new(document_id));
            record.last_mutation_id = record.last_mutation_id.max(last_mutation_id);
            record.document_id = document_id.to_string();
            batch.put_cf(cf_clients, client_id.as_bytes(), record.encode()?);
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(commit_version)
    }

    // ─── Client registry ──────────────────────────────────────────────

    /// Load a client record, `None` for a client never seen before.
    pub fn client_record(&self, client_id: &str) -> Result<Option<ClientRecord>, StoreError> {
        let cf = self.cf(CF_CLIENTS)?;
        match self.db.get_cf(&cf, client_id.as_bytes())? {
            Some(bytes) => Ok(Some(ClientRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The client's idempotency watermark (0 for an unknown client).
    pub fn last_mutation_id(&self, client_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .client_record(client_id)?
            .map(|r| r.last_mutation_id)
            .unwrap_or(0))
    }

    /// The checkpoint most recently returned to the client by a pull
    /// (0 for an unknown client).
    pub fn last_cookie(&self, client_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .client_record(client_id)?
            .map(|r| r.last_cookie)
            .unwrap_or(0))
    }

    /// Record the checkpoint a pull just handed to the client, creating
    /// the record on first contact.
    pub fn set_last_cookie(
        &self,
        client_id: &str,
        document_id: &str,
        cookie: u64,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_CLIENTS)?;

        let _guard = self
            .commit_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut record = self
            .client_record(client_id)?
            .unwrap_or_else(|| ClientRecord::new(document_id));
        record.last_cookie = cookie;
        record.document_id = document_id.to_string();

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(&cf, client_id.as_bytes(), record.encode()?, &write_opts)?;
        Ok(())
    }

    // ─── Maintenance ──────────────────────────────────────────────────

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

// ─── Key encoding ─────────────────────────────────────────────────────

/// Length-framed document prefix: `len(doc):u32 BE ++ doc`.
///
/// Length framing keeps documents from interleaving in scans even when one
/// document id is a prefix of another.
fn doc_prefix(document_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + document_id.len());
    key.extend_from_slice(&(document_id.len() as u32).to_be_bytes());
    key.extend_from_slice(document_id.as_bytes());
    key
}

/// Object row key: doc prefix + user key.
fn object_key(document_id: &str, key: &str) -> Vec<u8> {
    let mut k = doc_prefix(document_id);
    k.extend_from_slice(key.as_bytes());
    k
}

/// Change index key: doc prefix + version (8 bytes BE) + user key.
///
/// Big-endian versions sort numerically, so a forward scan from
/// `(doc, since + 1)` visits exactly the rows newer than `since`.
fn change_key(document_id: &str, version: u64, key: &str) -> Vec<u8> {
    let mut k = doc_prefix(document_id);
    k.extend_from_slice(&version.to_be_bytes());
    k.extend_from_slice(key.as_bytes());
    k
}

fn decode_u64(bytes: &[u8]) -> Result<u64, StoreError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::DeserializationError("Invalid u64 value".into()))?;
    Ok(u64::from_be_bytes(arr))
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
