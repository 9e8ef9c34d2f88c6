// Path: crates/storage/src/redb_store.rs

//! A durable `KvStore` over a single redb table. The tree engine layers its
//! own key namespace on top, so one flat table is all the backend needs.

use crate::{range_is_empty, KvIter, KvStore};
use canopy_types::error::StorageError;
use redb::{Database, ReadableTable, TableDefinition};
use std::ops::Bound;
use std::path::Path;

const KV: TableDefinition<&[u8], &[u8]> = TableDefinition::new("KV");

/// A redb-backed ordered byte store.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Opens (or creates) a store at `path` and ensures the table exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = Database::create(path).map_err(|e| StorageError::Backend(e.to_string()))?;
        {
            let w = db
                .begin_write()
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            w.open_table(KV)
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            w.commit().map_err(|e| StorageError::Backend(e.to_string()))?;
        }
        Ok(Self { db })
    }
}

impl KvStore for RedbStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let table = txn
            .open_table(KV)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let value = table
            .get(key)
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .map(|guard| guard.value().to_vec());
        Ok(value)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let w = self
            .db
            .begin_write()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        {
            let mut table = w
                .open_table(KV)
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            table
                .insert(key, value)
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        }
        w.commit().map_err(|e| StorageError::Backend(e.to_string()))
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        let w = self
            .db
            .begin_write()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        {
            let mut table = w
                .open_table(KV)
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            table
                .remove(key)
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        }
        w.commit().map_err(|e| StorageError::Backend(e.to_string()))
    }

    fn iterate(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> Result<KvIter<'_>, StorageError> {
        if range_is_empty(start, end) {
            return Ok(Box::new(std::iter::empty()));
        }
        let txn = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let table = txn
            .open_table(KV)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let lower = start.map_or(Bound::Unbounded, Bound::Included);
        let upper = end.map_or(Bound::Unbounded, Bound::Excluded);
        let range = table
            .range::<&[u8]>((lower, upper))
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        // Materialize the scan: the read transaction cannot outlive this call.
        let mut entries = Vec::new();
        for item in range {
            let (k, v) = item.map_err(|e| StorageError::Backend(e.to_string()))?;
            entries.push((k.value().to_vec(), v.value().to_vec()));
        }
        if !ascending {
            entries.reverse();
        }
        Ok(Box::new(entries.into_iter()))
    }
}
