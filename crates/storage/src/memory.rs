// Path: crates/storage/src/memory.rs

//! An in-memory `KvStore` over a `BTreeMap`, used by tests and ephemeral
//! trees. Range scans clone the matching entries so the iterator does not
//! hold the lock.

use crate::{range_is_empty, KvIter, KvStore};
use canopy_types::error::StorageError;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{PoisonError, RwLock};

/// An ordered in-memory byte store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries, across all namespaces.
    pub fn len(&self) -> usize {
        self.map.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        map.remove(key);
        Ok(())
    }

    fn has(&self, key: &[u8]) -> Result<bool, StorageError> {
        let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map.contains_key(key))
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
        let lower = start.map_or(Bound::Unbounded, Bound::Included);
        let upper = end.map_or(Bound::Unbounded, Bound::Excluded);

        let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = map
            .range::<[u8], _>((lower, upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !ascending {
            entries.reverse();
        }
        Ok(Box::new(entries.into_iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(itr: KvIter<'_>) -> Vec<(Vec<u8>, Vec<u8>)> {
        itr.collect()
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        store.set(b"a", b"1").unwrap();
        store.set(b"a", b"2").unwrap();

        assert_eq!(store.get(b"a").unwrap(), Some(b"2".to_vec()));
        assert!(store.has(b"a").unwrap());

        store.delete(b"a").unwrap();
        assert_eq!(store.get(b"a").unwrap(), None);
        // deleting twice is fine
        store.delete(b"a").unwrap();
    }

    #[test]
    fn test_memory_store_iterate_bounds_and_order() {
        let store = MemoryStore::new();
        for k in [b"a", b"b", b"c", b"d"] {
            store.set(k, k).unwrap();
        }

        let asc = collect(store.iterate(Some(b"b"), Some(b"d"), true).unwrap());
        assert_eq!(
            asc,
            vec![(b"b".to_vec(), b"b".to_vec()), (b"c".to_vec(), b"c".to_vec())]
        );

        let desc = collect(store.iterate(None, None, false).unwrap());
        let keys: Vec<_> = desc.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"d".to_vec(), b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn test_memory_store_iterate_empty_range() {
        let store = MemoryStore::new();
        store.set(b"a", b"1").unwrap();
        // start == end is a well-formed empty range, not a panic
        assert_eq!(collect(store.iterate(Some(b"a"), Some(b"a"), true).unwrap()), vec![]);
        assert_eq!(collect(store.iterate(Some(b"z"), Some(b"a"), true).unwrap()), vec![]);
    }
}
