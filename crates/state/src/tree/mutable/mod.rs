// Path: crates/state/src/tree/mutable/mod.rs

//! The mutable working tree. Wraps a persisted baseline, accumulates pending
//! insertions and removals as inline nodes above it, and commits them as a
//! new version. Every mutation builds fresh nodes bottom-up; persisted nodes
//! replaced along the rebuilt path are collected as orphans and written with
//! their live window at the next save.

use super::fast_node::FastNode;
use super::immutable::{get_in, ImmutableTree};
use super::iterator::{Traversal, UnsavedFastIterator};
use super::node::{Node, NodeHash, NodeRef};
use super::node_db::{NodeDb, FAST_STORAGE_VERSION};
use super::options::TreeOptions;
use super::{RootHash, EMPTY_ROOT_HASH};
use ahash::AHashMap;
use canopy_storage::KvStore;
use canopy_types::error::StateError;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[cfg(test)]
mod tests;

pub struct MutableTree {
    /// The working root: shared committed nodes by hash, fresh nodes inline.
    root: Option<NodeRef>,
    ndb: Arc<NodeDb>,
    /// The committed version this working tree sits on; 0 before any save.
    version: u64,
    /// Versions known to exist, maintained by loads, saves and deletes.
    versions: BTreeSet<u64>,
    /// Persisted nodes replaced since the last save: hash → their version.
    orphans: AHashMap<NodeHash, u64>,
    unsaved_additions: BTreeMap<Vec<u8>, FastNode>,
    unsaved_removals: BTreeSet<Vec<u8>>,
}

impl MutableTree {
    /// Creates a working tree over `db`. The tree starts empty; use
    /// [`MutableTree::load_version`] to position it on committed state.
    pub fn new(db: Arc<dyn KvStore>, opts: TreeOptions) -> Result<Self, StateError> {
        let ndb = Arc::new(NodeDb::new(db, opts)?);
        Ok(Self {
            root: None,
            ndb,
            version: 0,
            versions: BTreeSet::new(),
            orphans: AHashMap::new(),
            unsaved_additions: BTreeMap::new(),
            unsaved_removals: BTreeSet::new(),
        })
    }

    /// The version this working tree is based on.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The node database this tree commits through.
    pub fn node_db(&self) -> &NodeDb {
        &self.ndb
    }

    /// The latest committed version in the store.
    pub fn latest_version(&self) -> u64 {
        self.ndb.latest_version()
    }

    /// The version the next save will commit.
    fn working_version(&self) -> u64 {
        let initial = self.ndb.options().initial_version;
        if self.version == 0 && initial > 1 {
            initial
        } else {
            self.version + 1
        }
    }

    pub fn is_empty(&self) -> Result<bool, StateError> {
        Ok(self.size()? == 0)
    }

    /// Number of leaves reachable from the working root.
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

    /// The root hash the working tree would commit, without saving.
    pub fn working_hash(&self) -> Result<RootHash, StateError> {
        match &self.root {
            None => Ok(EMPTY_ROOT_HASH),
            Some(r) => r.hash(),
        }
    }

    pub fn version_exists(&self, version: u64) -> bool {
        self.versions.contains(&version)
    }

    /// Committed versions known to this tree, ascending.
    pub fn versions(&self) -> Vec<u64> {
        self.versions.iter().copied().collect()
    }

    /// Point read through the working root, overlay applied.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        get_in(&self.ndb, self.root.as_ref(), key)
    }

    pub fn has(&self, key: &[u8]) -> Result<bool, StateError> {
        Ok(self.get(key)?.is_some())
    }

    /// Point read preferring the overlay, then the fast-index, falling back
    /// to tree descent. A fast-index hit only counts when its version is
    /// visible from the loaded version; a miss is only authoritative when the
    /// loaded version is the latest and the index is fully populated.
    pub fn get_fast(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        if let Some(node) = self.unsaved_additions.get(key) {
            return Ok(Some(node.value.clone()));
        }
        if self.unsaved_removals.contains(key) {
            return Ok(None);
        }
        if self.ndb.fast_index_enabled() {
            if let Some(node) = self.ndb.get_fast_node(key)? {
                if node.version_last_updated_at <= self.version {
                    return Ok(Some(node.value));
                }
            } else if self.version == self.ndb.latest_version()
                && self.ndb.storage_version()? >= FAST_STORAGE_VERSION
            {
                return Ok(None);
            }
        }
        self.get(key)
    }

    /// Borrowed views of the overlay, for constructing an
    /// [`UnsavedFastIterator`] by hand. The iterator must not outlive the
    /// next mutation or save.
    pub fn unsaved_additions(&self) -> &BTreeMap<Vec<u8>, FastNode> {
        &self.unsaved_additions
    }

    pub fn unsaved_removals(&self) -> &BTreeSet<Vec<u8>> {
        &self.unsaved_removals
    }

    /// An iterator over `[start, end)` merging the persisted fast-index with
    /// this tree's unsaved overlay.
    pub fn unsaved_iter(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> UnsavedFastIterator<'_> {
        UnsavedFastIterator::new(
            start,
            end,
            ascending,
            Some(&self.ndb),
            Some(&self.unsaved_additions),
            Some(&self.unsaved_removals),
        )
    }

    /// A read-only view of a committed version.
    pub fn get_immutable(&self, version: u64) -> Result<ImmutableTree, StateError> {
        ImmutableTree::at_version(self.ndb.clone(), version)
    }

    /// Sets `key` to `value` in the working tree. Returns whether the key
    /// already existed.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<bool, StateError> {
        let mut orphans = Vec::new();
        let (new_root, updated) = self.set_recursive(self.root.clone(), key, value, &mut orphans)?;
        self.root = Some(new_root);
        self.commit_orphans(orphans);
        if self.ndb.fast_index_enabled() {
            let node = FastNode::new(key.to_vec(), value.to_vec(), self.working_version());
            self.unsaved_additions.insert(key.to_vec(), node);
            self.unsaved_removals.remove(key);
        }
        Ok(updated)
    }

    /// Removes `key` from the working tree, returning the prior value.
    pub fn remove(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        let mut orphans = Vec::new();
        let (new_root, _new_key, removed) =
            self.remove_recursive(self.root.clone(), key, &mut orphans)?;
        if removed.is_none() {
            return Ok(None);
        }
        self.root = new_root;
        self.commit_orphans(orphans);
        if self.ndb.fast_index_enabled() {
            // A pending addition is negated by deletion, not recorded as a
            // removal; only persisted state needs a removal record.
            if self.unsaved_additions.remove(key).is_none() {
                self.unsaved_removals.insert(key.to_vec());
            }
        }
        Ok(removed)
    }

    /// Commits the working tree as the next version: writes every pending
    /// node and the new root, records the collected orphans with window
    /// `[their version, new version - 1]`, and flushes the fast-index
    /// overlay. Both overlay maps are empty afterwards.
    pub fn save_version(&mut self) -> Result<(RootHash, u64), StateError> {
        let version = self.working_version();
        if self.ndb.has_version(version)? {
            return Err(StateError::VersionAlreadyExists(version));
        }

        let root_hash = match self.root.clone() {
            None => {
                self.ndb.save_root(version, None)?;
                EMPTY_ROOT_HASH
            }
            Some(root) => {
                let hash = self.save_branch(&root)?;
                self.ndb.save_root(version, Some(hash))?;
                self.root = Some(NodeRef::Saved(hash));
                hash
            }
        };

        let window_end = version.saturating_sub(1);
        for (hash, from) in std::mem::take(&mut self.orphans) {
            if from <= window_end {
                self.ndb.save_orphan(hash, from, window_end)?;
            } else {
                log::warn!(
                    "dropping orphan {} with window starting at {from} past version {version}",
                    hex::encode(hash)
                );
            }
        }

        if self.ndb.fast_index_enabled() {
            for (_, mut node) in std::mem::take(&mut self.unsaved_additions) {
                node.version_last_updated_at = version;
                self.ndb.save_fast_node(&node)?;
            }
            for key in std::mem::take(&mut self.unsaved_removals) {
                self.ndb.delete_fast_node(&key)?;
            }
        } else {
            self.unsaved_additions.clear();
            self.unsaved_removals.clear();
        }

        self.version = version;
        self.versions.insert(version);
        log::debug!("saved version {version} root {}", hex::encode(root_hash));
        Ok((root_hash, version))
    }

    /// Positions the working tree on a committed version; 0 means the latest.
    /// Pending changes and the overlay are discarded.
    pub fn load_version(&mut self, version: u64) -> Result<u64, StateError> {
        let all = self.ndb.versions()?;
        self.versions = all.iter().copied().collect();

        let initial = self.ndb.options().initial_version;
        if initial > 1 {
            if let Some(&first) = all.first() {
                if first < initial {
                    return Err(StateError::InitialVersionMismatch {
                        initial,
                        found: first,
                    });
                }
            }
        }

        let target = if version == 0 {
            self.ndb.latest_version()
        } else {
            version
        };
        if target == 0 {
            self.reset_to_empty();
            return Ok(0);
        }
        if !self.versions.contains(&target) {
            return Err(StateError::VersionNotFound(target));
        }
        self.position_on(target)?;
        Ok(target)
    }

    /// Like [`MutableTree::load_version`] but touches only the target root,
    /// avoiding a cold scan of all versions.
    pub fn lazy_load_version(&mut self, version: u64) -> Result<u64, StateError> {
        let target = if version == 0 {
            self.ndb.latest_version()
        } else {
            version
        };
        if target == 0 {
            self.reset_to_empty();
            return Ok(0);
        }
        self.position_on(target)?;
        self.versions.insert(target);
        Ok(target)
    }

    fn reset_to_empty(&mut self) {
        self.root = None;
        self.version = 0;
        self.orphans.clear();
        self.unsaved_additions.clear();
        self.unsaved_removals.clear();
    }

    fn position_on(&mut self, version: u64) -> Result<(), StateError> {
        let root = self.ndb.get_root(version)?;
        self.root = root.map(NodeRef::Saved);
        self.version = version;
        self.orphans.clear();
        self.unsaved_additions.clear();
        self.unsaved_removals.clear();
        self.upgrade_fast_index_if_needed()?;
        Ok(())
    }

    /// Deletes a committed version. The latest version cannot be deleted.
    pub fn delete_version(&mut self, version: u64) -> Result<(), StateError> {
        self.ndb.delete_version(version)?;
        self.versions.remove(&version);
        Ok(())
    }

    /// Deletes the committed versions in `[from, to)`.
    pub fn delete_versions_range(&mut self, from: u64, to: u64) -> Result<(), StateError> {
        self.ndb.delete_versions_range(from, to)?;
        for version in from..to {
            self.versions.remove(&version);
        }
        Ok(())
    }

    // ---- internals ----

    fn commit_orphans(&mut self, orphans: Vec<(NodeHash, u64)>) {
        for (hash, version) in orphans {
            self.orphans.insert(hash, version);
        }
    }

    /// Records a replaced or removed node as an orphan candidate. Only
    /// persisted nodes are tracked: pending nodes that never reach a save
    /// simply drop.
    fn track_orphan(orphans: &mut Vec<(NodeHash, u64)>, node_ref: &NodeRef, node: &Node) {
        if let NodeRef::Saved(hash) = node_ref {
            orphans.push((*hash, node.version));
        }
    }

    fn ref_height_size(&self, node_ref: &NodeRef) -> Result<(i32, u64), StateError> {
        let node = self.ndb.resolve(node_ref)?;
        Ok((node.height, node.size))
    }

    /// Builds a fresh branch, recomputing height and size from its children.
    fn make_inner(
        &self,
        key: Vec<u8>,
        left: NodeRef,
        right: NodeRef,
    ) -> Result<Arc<Node>, StateError> {
        let (left_height, left_size) = self.ref_height_size(&left)?;
        let (right_height, right_size) = self.ref_height_size(&right)?;
        Ok(Arc::new(Node::new_inner(
            key,
            left,
            right,
            1 + left_height.max(right_height),
            left_size + right_size,
            self.working_version(),
        )))
    }

    fn set_recursive(
        &self,
        node_ref: Option<NodeRef>,
        key: &[u8],
        value: &[u8],
        orphans: &mut Vec<(NodeHash, u64)>,
    ) -> Result<(NodeRef, bool), StateError> {
        let Some(node_ref) = node_ref else {
            let leaf = Node::new_leaf(key.to_vec(), value.to_vec(), self.working_version());
            return Ok((NodeRef::New(Arc::new(leaf)), false));
        };
        let node = self.ndb.resolve(&node_ref)?;

        if node.is_leaf() {
            let new_leaf = || {
                NodeRef::New(Arc::new(Node::new_leaf(
                    key.to_vec(),
                    value.to_vec(),
                    self.working_version(),
                )))
            };
            return match key.cmp(node.key.as_slice()) {
                Ordering::Less => {
                    // New leaf goes left; the branch routes on the smallest
                    // key of its right subtree, the existing leaf.
                    let inner = Node::new_inner(
                        node.key.clone(),
                        new_leaf(),
                        node_ref,
                        1,
                        2,
                        self.working_version(),
                    );
                    Ok((NodeRef::New(Arc::new(inner)), false))
                }
                Ordering::Greater => {
                    let inner = Node::new_inner(
                        key.to_vec(),
                        node_ref,
                        new_leaf(),
                        1,
                        2,
                        self.working_version(),
                    );
                    Ok((NodeRef::New(Arc::new(inner)), false))
                }
                Ordering::Equal => {
                    Self::track_orphan(orphans, &node_ref, &node);
                    Ok((new_leaf(), true))
                }
            };
        }

        Self::track_orphan(orphans, &node_ref, &node);
        let left = node.left_ref()?.clone();
        let right = node.right_ref()?.clone();
        let (new_left, new_right, updated) = if key < node.key.as_slice() {
            let (child, updated) = self.set_recursive(Some(left), key, value, orphans)?;
            (child, right, updated)
        } else {
            let (child, updated) = self.set_recursive(Some(right), key, value, orphans)?;
            (left, child, updated)
        };
        let new_node = self.make_inner(node.key.clone(), new_left, new_right)?;
        if updated {
            // Value replacement leaves the shape untouched.
            Ok((NodeRef::New(new_node), true))
        } else {
            Ok((self.balance(new_node, orphans)?, false))
        }
    }

    /// Removes `key`, returning the new subtree (or `None` when it collapses
    /// away), the replacement routing key bubbling up from a left-side
    /// collapse, and the removed value.
    #[allow(clippy::type_complexity)]
    fn remove_recursive(
        &self,
        node_ref: Option<NodeRef>,
        key: &[u8],
        orphans: &mut Vec<(NodeHash, u64)>,
    ) -> Result<(Option<NodeRef>, Option<Vec<u8>>, Option<Vec<u8>>), StateError> {
        let Some(node_ref) = node_ref else {
            return Ok((None, None, None));
        };
        let node = self.ndb.resolve(&node_ref)?;

        if node.is_leaf() {
            if node.key == key {
                Self::track_orphan(orphans, &node_ref, &node);
                return Ok((None, None, Some(node.value.clone())));
            }
            return Ok((Some(node_ref), None, None));
        }

        if key < node.key.as_slice() {
            let left = node.left_ref()?.clone();
            let (new_left, new_key, removed) = self.remove_recursive(Some(left), key, orphans)?;
            if removed.is_none() {
                return Ok((Some(node_ref), None, None));
            }
            Self::track_orphan(orphans, &node_ref, &node);
            let Some(new_left) = new_left else {
                // The left subtree collapsed away: the sibling is promoted
                // and this branch's routing key bubbles up to replace the
                // ancestor routing on the removed key.
                return Ok((
                    Some(node.right_ref()?.clone()),
                    Some(node.key.clone()),
                    removed,
                ));
            };
            let new_node = self.make_inner(node.key.clone(), new_left, node.right_ref()?.clone())?;
            Ok((Some(self.balance(new_node, orphans)?), new_key, removed))
        } else {
            let right = node.right_ref()?.clone();
            let (new_right, new_key, removed) = self.remove_recursive(Some(right), key, orphans)?;
            if removed.is_none() {
                return Ok((Some(node_ref), None, None));
            }
            Self::track_orphan(orphans, &node_ref, &node);
            let Some(new_right) = new_right else {
                return Ok((Some(node.left_ref()?.clone()), None, removed));
            };
            // A replacement routing key bubbling up from the right subtree is
            // consumed here: this branch routed on the removed key.
            let routing_key = new_key.unwrap_or_else(|| node.key.clone());
            let new_node = self.make_inner(routing_key, node.left_ref()?.clone(), new_right)?;
            Ok((Some(self.balance(new_node, orphans)?), None, removed))
        }
    }

    /// Rebalances a freshly built branch with AVL rotations. Double rotations
    /// are selected when the inner child outweighs the outer one.
    fn balance(
        &self,
        node: Arc<Node>,
        orphans: &mut Vec<(NodeHash, u64)>,
    ) -> Result<NodeRef, StateError> {
        let (left_height, _) = self.ref_height_size(node.left_ref()?)?;
        let (right_height, _) = self.ref_height_size(node.right_ref()?)?;
        let factor = left_height - right_height;

        let result = if factor > 1 {
            let left_ref = node.left_ref()?.clone();
            let left = self.ndb.resolve(&left_ref)?;
            let (inner_left, _) = self.ref_height_size(left.left_ref()?)?;
            let (inner_right, _) = self.ref_height_size(left.right_ref()?)?;
            if inner_left >= inner_right {
                self.rotate_right(&node, orphans)?
            } else {
                Self::track_orphan(orphans, &left_ref, &left);
                let new_left = self.rotate_left(&left, orphans)?;
                let new_node =
                    self.make_inner(node.key.clone(), new_left, node.right_ref()?.clone())?;
                self.rotate_right(&new_node, orphans)?
            }
        } else if factor < -1 {
            let right_ref = node.right_ref()?.clone();
            let right = self.ndb.resolve(&right_ref)?;
            let (inner_left, _) = self.ref_height_size(right.left_ref()?)?;
            let (inner_right, _) = self.ref_height_size(right.right_ref()?)?;
            if inner_right >= inner_left {
                self.rotate_left(&node, orphans)?
            } else {
                Self::track_orphan(orphans, &right_ref, &right);
                let new_right = self.rotate_right(&right, orphans)?;
                let new_node =
                    self.make_inner(node.key.clone(), node.left_ref()?.clone(), new_right)?;
                self.rotate_left(&new_node, orphans)?
            }
        } else {
            return Ok(NodeRef::New(node));
        };

        self.check_balanced(&result)?;
        Ok(result)
    }

    fn check_balanced(&self, node_ref: &NodeRef) -> Result<(), StateError> {
        let node = self.ndb.resolve(node_ref)?;
        if node.is_leaf() {
            return Ok(());
        }
        let (left_height, _) = self.ref_height_size(node.left_ref()?)?;
        let (right_height, _) = self.ref_height_size(node.right_ref()?)?;
        let factor = left_height - right_height;
        if !(-1..=1).contains(&factor) {
            return Err(StateError::InvariantViolation(format!(
                "balance factor {factor} after rotation"
            )));
        }
        Ok(())
    }

    /// Rotates the subtree right: the left child becomes the root, the old
    /// root becomes its right child. Routing keys travel with their nodes.
    fn rotate_right(
        &self,
        node: &Node,
        orphans: &mut Vec<(NodeHash, u64)>,
    ) -> Result<NodeRef, StateError> {
        let left_ref = node.left_ref()?.clone();
        let left = self.ndb.resolve(&left_ref)?;
        Self::track_orphan(orphans, &left_ref, &left);
        let new_right = self.make_inner(
            node.key.clone(),
            left.right_ref()?.clone(),
            node.right_ref()?.clone(),
        )?;
        let new_root = self.make_inner(
            left.key.clone(),
            left.left_ref()?.clone(),
            NodeRef::New(new_right),
        )?;
        Ok(NodeRef::New(new_root))
    }

    fn rotate_left(
        &self,
        node: &Node,
        orphans: &mut Vec<(NodeHash, u64)>,
    ) -> Result<NodeRef, StateError> {
        let right_ref = node.right_ref()?.clone();
        let right = self.ndb.resolve(&right_ref)?;
        Self::track_orphan(orphans, &right_ref, &right);
        let new_left = self.make_inner(
            node.key.clone(),
            node.left_ref()?.clone(),
            right.left_ref()?.clone(),
        )?;
        let new_root = self.make_inner(
            right.key.clone(),
            NodeRef::New(new_left),
            right.right_ref()?.clone(),
        )?;
        Ok(NodeRef::New(new_root))
    }

    /// Writes every pending node reachable from `node_ref`, children first,
    /// and returns the subtree's content address.
    fn save_branch(&self, node_ref: &NodeRef) -> Result<NodeHash, StateError> {
        match node_ref {
            NodeRef::Saved(hash) => Ok(*hash),
            NodeRef::New(node) => {
                if !node.is_leaf() {
                    self.save_branch(node.left_ref()?)?;
                    self.save_branch(node.right_ref()?)?;
                }
                self.ndb.save_node(node)
            }
        }
    }

    /// Populates the fast-index from the loaded tree when the store predates
    /// the fast-index schema. Runs only when positioned on the latest
    /// version, which is what the index mirrors.
    fn upgrade_fast_index_if_needed(&mut self) -> Result<(), StateError> {
        if !self.ndb.fast_index_enabled()
            || self.version == 0
            || self.version != self.ndb.latest_version()
            || self.ndb.storage_version()? >= FAST_STORAGE_VERSION
        {
            return Ok(());
        }
        let view = ImmutableTree::new(self.root.clone(), self.ndb.clone(), self.version);
        let mut traversal = Traversal::new(&view, None, None, true, false, false)?;
        while let Some((node, _path)) = traversal.next()? {
            if node.is_leaf() {
                self.ndb.save_fast_node(&FastNode::new(
                    node.key.clone(),
                    node.value.clone(),
                    node.version,
                ))?;
            }
        }
        self.ndb.set_storage_version(FAST_STORAGE_VERSION)?;
        log::debug!("populated fast-index from version {}", self.version);
        Ok(())
    }
}

impl std::fmt::Debug for MutableTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutableTree")
            .field("version", &self.version)
            .field("working_hash", &self.working_hash().map(hex::encode))
            .field("pending_orphans", &self.orphans.len())
            .field("unsaved_additions", &self.unsaved_additions.len())
            .field("unsaved_removals", &self.unsaved_removals.len())
            .finish()
    }
}
