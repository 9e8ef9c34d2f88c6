// Path: crates/state/src/tree/immutable.rs

//! A read-only tree view anchored at one version's root. Nodes are faulted in
//! from the node database on demand during descent; views for different
//! versions share cached nodes freely because nodes are content-addressed.

use super::iterator::{Traversal, TreeIterator};
use super::node::NodeRef;
use super::node_db::NodeDb;
use super::{RootHash, EMPTY_ROOT_HASH};
use canopy_types::error::StateError;
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Clone)]
pub struct ImmutableTree {
    pub(crate) root: Option<NodeRef>,
    pub(crate) ndb: Arc<NodeDb>,
    pub(crate) version: u64,
}

impl ImmutableTree {
    pub(crate) fn new(root: Option<NodeRef>, ndb: Arc<NodeDb>, version: u64) -> Self {
        Self { root, ndb, version }
    }

    /// Anchors a view at a committed version's root.
    pub fn at_version(ndb: Arc<NodeDb>, version: u64) -> Result<Self, StateError> {
        let root = ndb.get_root(version)?.map(NodeRef::Saved);
        Ok(Self { root, ndb, version })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of leaves in the tree.
    pub fn size(&self) -> Result<u64, StateError> {
        match &self.root {
            None => Ok(0),
            Some(r) => Ok(self.ndb.resolve(r)?.size),
        }
    }

    pub fn height(&self) -> Result<i32, StateError> {
        match &self.root {
            None => Ok(0),
            Some(r) => Ok(self.ndb.resolve(r)?.height),
        }
    }

    /// The Merkle root hash of this version. The empty tree hashes to the
    /// all-zero vector.
    pub fn hash(&self) -> Result<RootHash, StateError> {
        match &self.root {
            None => Ok(EMPTY_ROOT_HASH),
            Some(r) => r.hash(),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        get_in(&self.ndb, self.root.as_ref(), key)
    }

    pub fn has(&self, key: &[u8]) -> Result<bool, StateError> {
        Ok(self.get(key)?.is_some())
    }

    /// Returns the in-order index of `key` (or the index at which it would be
    /// inserted) together with its value when present.
    pub fn get_with_index(&self, key: &[u8]) -> Result<(u64, Option<Vec<u8>>), StateError> {
        get_with_index_in(&self.ndb, self.root.as_ref(), key)
    }

    /// An authenticated iterator over `[start, end)` in the requested order,
    /// positioned on its first element.
    pub fn iter(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> TreeIterator<'_> {
        TreeIterator::new(start, end, ascending, Some(self))
    }

    /// Walks every key-value pair ascending. The callback returns `true` to
    /// stop; the result reports whether it did.
    pub fn iterate<F>(&self, f: F) -> Result<bool, StateError>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        self.iterate_range(None, None, false, true, f)
    }

    /// Walks the key-value pairs in `[start, end)` (or `[start, end]` when
    /// `inclusive`) in the requested order.
    pub fn iterate_range<F>(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        inclusive: bool,
        ascending: bool,
        mut f: F,
    ) -> Result<bool, StateError>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let mut traversal = Traversal::new(self, start, end, ascending, inclusive, false)?;
        while let Some((node, _path)) = traversal.next()? {
            if node.is_leaf() && f(&node.key, &node.value) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl std::fmt::Debug for ImmutableTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImmutableTree")
            .field("version", &self.version)
            .field("root", &self.hash().map(hex::encode))
            .finish()
    }
}

/// Recursive point lookup shared by the immutable view and the working tree.
pub(crate) fn get_in(
    ndb: &NodeDb,
    root: Option<&NodeRef>,
    key: &[u8],
) -> Result<Option<Vec<u8>>, StateError> {
    let Some(node_ref) = root else {
        return Ok(None);
    };
    let node = ndb.resolve(node_ref)?;
    if node.is_leaf() {
        if node.key == key {
            return Ok(Some(node.value.clone()));
        }
        return Ok(None);
    }
    if key < node.key.as_slice() {
        get_in(ndb, Some(node.left_ref()?), key)
    } else {
        get_in(ndb, Some(node.right_ref()?), key)
    }
}

fn get_with_index_in(
    ndb: &NodeDb,
    root: Option<&NodeRef>,
    key: &[u8],
) -> Result<(u64, Option<Vec<u8>>), StateError> {
    let Some(node_ref) = root else {
        return Ok((0, None));
    };
    let node = ndb.resolve(node_ref)?;
    if node.is_leaf() {
        return Ok(match node.key.as_slice().cmp(key) {
            Ordering::Less => (1, None),
            Ordering::Greater => (0, None),
            Ordering::Equal => (0, Some(node.value.clone())),
        });
    }
    if key < node.key.as_slice() {
        get_with_index_in(ndb, Some(node.left_ref()?), key)
    } else {
        let right_ref = node.right_ref()?;
        let right = ndb.resolve(right_ref)?;
        let (mut index, value) = get_with_index_in(ndb, Some(right_ref), key)?;
        index += node.size - right.size;
        Ok((index, value))
    }
}
