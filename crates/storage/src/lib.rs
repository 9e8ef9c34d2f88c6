// Path: crates/storage/src/lib.rs
#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::unimplemented,
        clippy::todo,
        clippy::indexing_slicing
    )
)]

//! Ordered byte→byte storage backends consumed by the canopy tree engine.
//! This crate defines the `KvStore` abstraction and two implementations: an
//! in-memory `MemoryStore` (BTreeMap) for tests and ephemeral trees, and a
//! redb-backed `RedbStore` for durable deployments.

pub mod memory;
pub mod redb_store;

pub use canopy_types::error::StorageError;
pub use memory::MemoryStore;
pub use redb_store::RedbStore;

/// An ordered iterator over raw key-value pairs, yielded in the order
/// requested from [`KvStore::iterate`].
pub type KvIter<'a> = Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>;

/// The minimal ordered byte-store interface the tree engine is written
/// against. Keys and values are raw bytes; keys order lexicographically.
///
/// Mutation goes through `&self` so a single store can be shared behind an
/// `Arc` by the node database and any number of read-only tree views.
pub trait KvStore: Send + Sync {
    /// Returns the value stored under `key`, if any.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Stores `value` under `key`, overwriting any previous value.
    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    /// Removes `key` from the store. Deleting an absent key is not an error.
    fn delete(&self, key: &[u8]) -> Result<(), StorageError>;

    /// Returns whether `key` is present.
    fn has(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.get(key)?.is_some())
    }

    /// Returns an iterator over the half-open range `[start, end)` in the
    /// requested order. A `None` bound means unbounded on that side.
    fn iterate(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> Result<KvIter<'_>, StorageError>;
}

/// Returns whether the half-open range `[start, end)` is trivially empty.
pub(crate) fn range_is_empty(start: Option<&[u8]>, end: Option<&[u8]>) -> bool {
    matches!((start, end), (Some(s), Some(e)) if s >= e)
}
