//! Transaction-scoped read-through, write-back overlay on the object store.
//!
//! A push request may contain many mutations touching overlapping keys;
//! without this buffer every mutation would round-trip to the store. Reads
//! consult the in-memory entry first (absent results are cached too), and
//! writes only mark entries dirty — the store sees exactly one write per
//! dirty key when the buffer is flushed into a commit.
//!
//! The buffer never outlives one push: it is either flushed whole or
//! dropped whole.

use crate::error::SyncError;
use crate::storage::ObjectStore;
use serde_json::Value;
use std::collections::HashMap;

struct CacheEntry {
    /// `None` means the key reads as absent (deleted or never written)
    value: Option<Value>,
    dirty: bool,
}

/// Per-push overlay with map semantics over one document.
pub struct WriteBuffer<'a> {
    store: &'a ObjectStore,
    document_id: &'a str,
    cache: HashMap<String, CacheEntry>,
}

impl<'a> WriteBuffer<'a> {
    /// Create a buffer scoped to one document and one push.
    pub fn new(store: &'a ObjectStore, document_id: &'a str) -> Self {
        Self {
            store,
            document_id,
            cache: HashMap::new(),
        }
    }

    /// Read a key: buffered entry first, then the store.
    ///
    /// Store results — including "absent" — are cached so repeated reads
    /// within one push cost one store round trip.
    pub fn get(&mut self, key: &str) -> Result<Option<Value>, SyncError> {
        if let Some(entry) = self.cache.get(key) {
            return Ok(entry.value.clone());
        }

        let value = self.store.get(self.document_id, key)?;
        self.cache.insert(
            key.to_string(),
            CacheEntry {
                value: value.clone(),
                dirty: false,
            },
        );
        Ok(value)
    }

    /// Buffer an upsert. Nothing reaches the store until flush.
    pub fn put(&mut self, key: impl Into<String>, value: Value) {
        self.cache.insert(
            key.into(),
            CacheEntry {
                value: Some(value),
                dirty: true,
            },
        );
    }

    /// Buffer a delete. Flush writes it as a tombstone.
    pub fn delete(&mut self, key: impl Into<String>) {
        self.cache.insert(
            key.into(),
            CacheEntry {
                value: None,
                dirty: true,
            },
        );
    }

    /// Number of dirty entries a flush would write.
    pub fn dirty_count(&self) -> usize {
        self.cache.values().filter(|e| e.dirty).count()
    }

    /// Drain the buffer into store writes — exactly one per dirty key,
    /// clean entries skipped. `None` values become tombstones.
    pub fn into_writes(self) -> Vec<(String, Option<Value>)> {
        self.cache
            .into_iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(key, entry)| (key, entry.value))
            .collect()
    }
}
