// Path: crates/state/src/tree/node_db.rs

//! The adapter between the tree and the external ordered byte store. Owns the
//! key namespace, encodes/decodes nodes, indexes roots by version, tracks
//! orphan windows and persists fast-index records.
//!
//! Namespace layout (prefixes are distinct and sort-stable within a group):
//!
//! | prefix | payload |
//! |---|---|
//! | `n/<hash>` | one encoded node |
//! | `r/<be-version>` | root hash for a version (empty value = empty tree) |
//! | `o/<be-to>/<be-from>/<hash>` | orphan window |
//! | `f/<raw-key>` | encoded fast-index record |
//! | `m/latest_version` | latest committed version |
//! | `m/storage_version` | fast-index schema marker |

use super::encode;
use super::fast_node::FastNode;
use super::node::{Node, NodeHash};
use super::options::TreeOptions;
use canopy_storage::{KvIter, KvStore};
use canopy_types::error::StateError;
use canopy_types::prelude::OptionExt;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

const NODE_PREFIX: &[u8] = b"n/";
const ROOT_PREFIX: &[u8] = b"r/";
const ORPHAN_PREFIX: &[u8] = b"o/";
const FAST_PREFIX: &[u8] = b"f/";
const LATEST_VERSION_KEY: &[u8] = b"m/latest_version";
const STORAGE_VERSION_KEY: &[u8] = b"m/storage_version";

/// Schema marker written once the fast-index is fully populated.
pub(crate) const FAST_STORAGE_VERSION: u64 = 2;

fn node_key(hash: &NodeHash) -> Vec<u8> {
    [NODE_PREFIX, hash.as_slice()].concat()
}

fn root_key(version: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(ROOT_PREFIX.len() + 8);
    key.extend_from_slice(ROOT_PREFIX);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

fn orphan_key(to: u64, from: u64, hash: &NodeHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(ORPHAN_PREFIX.len() + 8 + 1 + 8 + 1 + 32);
    key.extend_from_slice(ORPHAN_PREFIX);
    key.extend_from_slice(&to.to_be_bytes());
    key.push(b'/');
    key.extend_from_slice(&from.to_be_bytes());
    key.push(b'/');
    key.extend_from_slice(hash);
    key
}

fn fast_key(key: &[u8]) -> Vec<u8> {
    [FAST_PREFIX, key].concat()
}

fn be64(bytes: &[u8]) -> Result<u64, StateError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StateError::Decode(format!("expected 8 byte integer, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(arr))
}

/// Calculates the lexicographical successor of a byte slice, which bounds a
/// prefix scan. Returns `None` if the slice is all `0xFF` bytes.
pub(crate) fn lexicographical_successor(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut successor = bytes.to_vec();
    while let Some(last) = successor.last().copied() {
        if last != 0xFF {
            if let Some(slot) = successor.last_mut() {
                *slot = last.wrapping_add(1);
            }
            return Some(successor);
        }
        successor.pop();
    }
    None
}

/// Content-addressed node database over an external `KvStore`.
pub struct NodeDb {
    db: Arc<dyn KvStore>,
    node_cache: Mutex<LruCache<NodeHash, Arc<Node>>>,
    latest_version: Mutex<u64>,
    opts: TreeOptions,
}

impl NodeDb {
    /// Opens a node database over `db`, recovering the latest committed
    /// version from the metadata namespace.
    pub fn new(db: Arc<dyn KvStore>, opts: TreeOptions) -> Result<Self, StateError> {
        let latest = match db.get(LATEST_VERSION_KEY)? {
            Some(raw) => be64(&raw)?,
            None => {
                // Stores written before the scalar existed: recover it from
                // the highest root record.
                let mut itr = db.iterate(
                    Some(ROOT_PREFIX),
                    lexicographical_successor(ROOT_PREFIX).as_deref(),
                    false,
                )?;
                match itr.next() {
                    Some((key, _)) => parse_root_version(&key)?,
                    None => 0,
                }
            }
        };
        let cache_size =
            NonZeroUsize::new(opts.cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        let ndb = Self {
            db,
            node_cache: Mutex::new(LruCache::new(cache_size)),
            latest_version: Mutex::new(latest),
            opts,
        };
        // A fresh store with the fast-index enabled is born on the current
        // schema; only pre-existing trees need a migration pass on load.
        if ndb.opts.fast_index && latest == 0 && ndb.storage_version()? < FAST_STORAGE_VERSION {
            ndb.set_storage_version(FAST_STORAGE_VERSION)?;
        }
        Ok(ndb)
    }

    pub(crate) fn options(&self) -> &TreeOptions {
        &self.opts
    }

    pub(crate) fn fast_index_enabled(&self) -> bool {
        self.opts.fast_index
    }

    /// The latest committed version, 0 when nothing has been saved.
    pub fn latest_version(&self) -> u64 {
        *self
            .latest_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_latest_version(&self, version: u64) -> Result<(), StateError> {
        self.db.set(LATEST_VERSION_KEY, &version.to_be_bytes())?;
        *self
            .latest_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = version;
        Ok(())
    }

    /// Resolves a node reference, faulting persisted nodes in from the store.
    pub(crate) fn resolve(&self, node_ref: &super::node::NodeRef) -> Result<Arc<Node>, StateError> {
        match node_ref {
            super::node::NodeRef::Saved(hash) => self.get_node(*hash),
            super::node::NodeRef::New(node) => Ok(node.clone()),
        }
    }

    /// Fetches and decodes a node by hash, consulting the bounded in-memory
    /// cache first. Cached nodes are shared freely across tree views because
    /// they are content-addressed and never mutated.
    pub(crate) fn get_node(&self, hash: NodeHash) -> Result<Arc<Node>, StateError> {
        {
            let mut cache = self
                .node_cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(node) = cache.get(&hash) {
                return Ok(node.clone());
            }
        }
        let bytes = self
            .db
            .get(&node_key(&hash))?
            .required(StateError::NodeMissing(hex::encode(hash)))?;
        let decoded = encode::decode_node(&bytes)?;
        let node = Arc::new(Node::from_decoded(decoded, hash)?);
        self.node_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(hash, node.clone());
        Ok(node)
    }

    /// Writes a node under its content address. A no-op when the record is
    /// already present.
    pub(crate) fn save_node(&self, node: &Arc<Node>) -> Result<NodeHash, StateError> {
        let hash = node.hash()?;
        let key = node_key(&hash);
        if !self.db.has(&key)? {
            self.db.set(&key, &encode::encode_node(node)?)?;
        }
        self.node_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(hash, node.clone());
        Ok(hash)
    }

    /// Records the root for a version. Errors if the version was already saved.
    pub(crate) fn save_root(&self, version: u64, hash: Option<NodeHash>) -> Result<(), StateError> {
        let key = root_key(version);
        if self.db.has(&key)? {
            return Err(StateError::VersionAlreadyExists(version));
        }
        let value = hash.map(|h| h.to_vec()).unwrap_or_default();
        self.db.set(&key, &value)?;
        if version > self.latest_version() {
            self.set_latest_version(version)?;
        }
        Ok(())
    }

    /// The root hash for a version; `Ok(None)` is the empty tree.
    pub(crate) fn get_root(&self, version: u64) -> Result<Option<NodeHash>, StateError> {
        let raw = self
            .db
            .get(&root_key(version))?
            .required(StateError::VersionNotFound(version))?;
        if raw.is_empty() {
            return Ok(None);
        }
        let hash: NodeHash = raw.as_slice().try_into().map_err(|_| {
            StateError::Decode(format!("root record for version {version} is malformed"))
        })?;
        Ok(Some(hash))
    }

    pub(crate) fn has_version(&self, version: u64) -> Result<bool, StateError> {
        Ok(self.db.has(&root_key(version))?)
    }

    /// All committed versions, ascending.
    pub(crate) fn versions(&self) -> Result<Vec<u64>, StateError> {
        let itr = self.db.iterate(
            Some(ROOT_PREFIX),
            lexicographical_successor(ROOT_PREFIX).as_deref(),
            true,
        )?;
        let mut versions = Vec::new();
        for (key, _) in itr {
            versions.push(parse_root_version(&key)?);
        }
        Ok(versions)
    }

    /// The highest committed version strictly below `version`, or 0.
    pub(crate) fn previous_version(&self, version: u64) -> Result<u64, StateError> {
        let mut itr = self
            .db
            .iterate(Some(ROOT_PREFIX), Some(&root_key(version)), false)?;
        match itr.next() {
            Some((key, _)) => parse_root_version(&key),
            None => Ok(0),
        }
    }

    /// Records that a node was live during the inclusive version window
    /// `[from, to]` and becomes reclaimable once no retained version lies
    /// within it.
    pub(crate) fn save_orphan(
        &self,
        hash: NodeHash,
        from: u64,
        to: u64,
    ) -> Result<(), StateError> {
        if from > to {
            return Err(StateError::InvariantViolation(format!(
                "orphan window [{from}, {to}] is inverted"
            )));
        }
        Ok(self.db.set(&orphan_key(to, from, &hash), &hash)?)
    }

    /// Orphan records whose window ends exactly at `version`.
    fn orphans_ending_at(&self, version: u64) -> Result<Vec<(Vec<u8>, u64, NodeHash)>, StateError> {
        let mut start = Vec::with_capacity(ORPHAN_PREFIX.len() + 9);
        start.extend_from_slice(ORPHAN_PREFIX);
        start.extend_from_slice(&version.to_be_bytes());
        start.push(b'/');
        let end = lexicographical_successor(&start);

        let itr = self.db.iterate(Some(&start), end.as_deref(), true)?;
        let mut orphans = Vec::new();
        for (key, _) in itr {
            let mut cursor = key.as_slice();
            encode::take(&mut cursor, start.len())?;
            let from = be64(encode::take(&mut cursor, 8)?)?;
            encode::take(&mut cursor, 1)?;
            let hash: NodeHash = encode::take(&mut cursor, 32)?
                .try_into()
                .map_err(|_| StateError::Decode("orphan key is malformed".into()))?;
            orphans.push((key, from, hash));
        }
        Ok(orphans)
    }

    /// Rewrites every orphan window ending at `version` against the retained
    /// `predecessor`: windows still covering the predecessor shrink to it,
    /// windows that no longer cover any retained version reclaim their node.
    fn delete_orphans(&self, version: u64, predecessor: u64) -> Result<(), StateError> {
        for (key, from, hash) in self.orphans_ending_at(version)? {
            self.db.delete(&key)?;
            if predecessor < from {
                self.db.delete(&node_key(&hash))?;
                self.node_cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop(&hash);
            } else {
                self.save_orphan(hash, from, predecessor)?;
            }
        }
        Ok(())
    }

    /// Deletes one historical version. The latest version cannot be deleted.
    pub(crate) fn delete_version(&self, version: u64) -> Result<(), StateError> {
        let latest = self.latest_version();
        if version == latest {
            return Err(StateError::CannotDeleteLatestVersion(version));
        }
        if !self.has_version(version)? {
            return Err(StateError::VersionNotFound(version));
        }
        let predecessor = self.previous_version(version)?;
        self.delete_orphans(version, predecessor)?;
        self.db.delete(&root_key(version))?;
        log::debug!("deleted version {version} (predecessor {predecessor})");
        Ok(())
    }

    /// Deletes versions in `[from, to)`, collapsing the orphan rewrites onto
    /// the single predecessor of `from`.
    pub(crate) fn delete_versions_range(&self, from: u64, to: u64) -> Result<(), StateError> {
        if from >= to {
            return Err(StateError::InvalidVersionRange { from, to });
        }
        let latest = self.latest_version();
        if to > latest {
            return Err(StateError::CannotDeleteLatestVersion(latest));
        }
        let predecessor = self.previous_version(from)?;
        for version in from..to {
            self.delete_orphans(version, predecessor)?;
            self.db.delete(&root_key(version))?;
        }
        log::debug!("deleted versions [{from}, {to}) (predecessor {predecessor})");
        Ok(())
    }

    // ---- fast-index records ----

    pub(crate) fn save_fast_node(&self, node: &FastNode) -> Result<(), StateError> {
        Ok(self.db.set(&fast_key(&node.key), &node.encode()?)?)
    }

    pub(crate) fn delete_fast_node(&self, key: &[u8]) -> Result<(), StateError> {
        Ok(self.db.delete(&fast_key(key))?)
    }

    pub(crate) fn get_fast_node(&self, key: &[u8]) -> Result<Option<FastNode>, StateError> {
        match self.db.get(&fast_key(key))? {
            Some(bytes) => Ok(Some(FastNode::decode(key, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Raw scan over the fast-index records in `[start, end)`, translated into
    /// the `f/` namespace. Yields full storage keys.
    pub(crate) fn fast_iterator(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> Result<KvIter<'_>, StateError> {
        let start_key = start.map_or_else(|| FAST_PREFIX.to_vec(), fast_key);
        let end_key = match end {
            Some(e) => Some(fast_key(e)),
            None => lexicographical_successor(FAST_PREFIX),
        };
        Ok(self
            .db
            .iterate(Some(&start_key), end_key.as_deref(), ascending)?)
    }

    /// Strips the fast-index namespace from a storage key.
    pub(crate) fn fast_entry_key(storage_key: &[u8]) -> Result<&[u8], StateError> {
        let mut cursor = storage_key;
        let prefix = encode::take(&mut cursor, FAST_PREFIX.len())?;
        if prefix != FAST_PREFIX {
            return Err(StateError::Decode("fast-index key is malformed".into()));
        }
        Ok(cursor)
    }

    // ---- schema marker ----

    pub(crate) fn storage_version(&self) -> Result<u64, StateError> {
        match self.db.get(STORAGE_VERSION_KEY)? {
            Some(raw) => be64(&raw),
            None => Ok(1),
        }
    }

    pub(crate) fn set_storage_version(&self, version: u64) -> Result<(), StateError> {
        Ok(self.db.set(STORAGE_VERSION_KEY, &version.to_be_bytes())?)
    }
}

fn parse_root_version(key: &[u8]) -> Result<u64, StateError> {
    let mut cursor = key;
    encode::take(&mut cursor, ROOT_PREFIX.len())?;
    be64(cursor)
}
