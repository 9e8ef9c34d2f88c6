// Path: crates/state/src/tree/iterator/mod.rs

//! Iterator families over the tree and its fast-index, all satisfying the
//! same contract: construction positions the iterator on its first element,
//! constructors never panic (errors surface through `error()` with
//! `valid() == false`), and `close()` is idempotent.

mod difference;
pub mod fast;
pub mod unsaved;


pub use difference::DifferenceIterator;
pub use fast::FastIterator;
pub use unsaved::UnsavedFastIterator;

use super::immutable::ImmutableTree;
use super::node::Node;
use canopy_types::error::StateError;
use std::sync::Arc;

/// The contract shared by every iterator family.
pub trait StoreIterator {
    /// The start/end bounds passed at construction, even when the iterator is
    /// invalid due to a construction error.
    fn domain(&self) -> (Option<&[u8]>, Option<&[u8]>);

    /// False once exhausted or closed; never transitions back to true.
    fn valid(&self) -> bool;

    /// The current key. Only meaningful while `valid()`.
    fn key(&self) -> &[u8];

    /// The current value. `None` only for difference elements present solely
    /// in the first input.
    fn value(&self) -> Option<&[u8]>;

    /// Advances to the next element, invalidating on exhaustion. A no-op once
    /// invalid or closed.
    fn next(&mut self);

    /// The error carried by an invalid iterator, if any.
    fn error(&self) -> Option<&StateError>;

    /// Permanently invalidates the iterator and releases its resources,
    /// surfacing any pending error exactly once.
    fn close(&mut self) -> Result<(), StateError>;
}

/// An iterator that additionally reports the left/right bit path from the
/// root to each emitted leaf.
pub trait PathIterator: StoreIterator {
    /// The path of the current element, `false` for left and `true` for right.
    fn path(&self) -> &[bool];
}

/// A node whose expansion has been delayed. When `expand` is set the node's
/// children still have to be traversed; otherwise the node is ready to emit.
struct DelayedNode {
    node: Arc<Node>,
    expand: bool,
    path: Vec<bool>,
}

/// A depth-first walk over an `ImmutableTree` bounded by `[start, end)` (or
/// `[start, end]` when inclusive), ascending or descending, emitting pre- or
/// post-order.
///
/// The walk keeps its future work on an explicit LIFO stack of delayed nodes
/// so that it can pause between elements; `next()` is a loop, bounding stack
/// depth to the tree height and making cancellation trivial (drop the stack).
pub(crate) struct Traversal<'a> {
    tree: &'a ImmutableTree,
    start: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    ascending: bool,
    inclusive: bool,
    post: bool,
    delayed: Vec<DelayedNode>,
}

impl<'a> Traversal<'a> {
    pub(crate) fn new(
        tree: &'a ImmutableTree,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
        inclusive: bool,
        post: bool,
    ) -> Result<Self, StateError> {
        let mut delayed = Vec::new();
        if let Some(root) = &tree.root {
            delayed.push(DelayedNode {
                node: tree.ndb.resolve(root)?,
                expand: true,
                path: Vec::new(),
            });
        }
        Ok(Self {
            tree,
            start: start.map(<[u8]>::to_vec),
            end: end.map(<[u8]>::to_vec),
            ascending,
            inclusive,
            post,
            delayed,
        })
    }

    /// Pops delayed nodes until one is ready to emit, expanding branches along
    /// the way. Bounds are checked against a node's own key only: a branch
    /// whose key lies outside the window may still have in-range descendants,
    /// so children are pruned per side, never because the parent is out of
    /// range.
    pub(crate) fn next(&mut self) -> Result<Option<(Arc<Node>, Vec<bool>)>, StateError> {
        loop {
            let Some(delayed) = self.delayed.pop() else {
                return Ok(None);
            };
            if !delayed.expand {
                return Ok(Some((delayed.node, delayed.path)));
            }
            let node = delayed.node;
            let path = delayed.path;

            let after_start = self
                .start
                .as_deref()
                .map_or(true, |s| s < node.key.as_slice());
            let start_or_after = after_start || self.start.as_deref() == Some(node.key.as_slice());
            let mut before_end = self
                .end
                .as_deref()
                .map_or(true, |e| node.key.as_slice() < e);
            if self.inclusive {
                before_end = before_end || self.end.as_deref() == Some(node.key.as_slice());
            }
            let in_bounds = start_or_after && before_end;

            // Post-order: re-queue the node itself behind its children.
            if self.post && (!node.is_leaf() || in_bounds) {
                self.delayed.push(DelayedNode {
                    node: node.clone(),
                    expand: false,
                    path: path.clone(),
                });
            }

            if !node.is_leaf() {
                // Push children in reverse of emission order; only sides that
                // can still satisfy the bounds are queued.
                for i in 0..2 {
                    let child = if self.ascending { 1 - i } else { i };
                    if child == 0 && after_start {
                        let left = self.tree.ndb.resolve(node.left_ref()?)?;
                        let mut child_path = path.clone();
                        child_path.push(false);
                        self.delayed.push(DelayedNode {
                            node: left,
                            expand: true,
                            path: child_path,
                        });
                    } else if child == 1 && before_end {
                        let right = self.tree.ndb.resolve(node.right_ref()?)?;
                        let mut child_path = path.clone();
                        child_path.push(true);
                        self.delayed.push(DelayedNode {
                            node: right,
                            expand: true,
                            path: child_path,
                        });
                    }
                }
            }

            // Pre-order: emit now, children are already queued.
            if !self.post && (!node.is_leaf() || in_bounds) {
                return Ok(Some((node, path)));
            }
        }
    }
}

/// The authenticated tree-walk iterator: a pre-order traversal filtered to
/// in-range leaves.
pub struct TreeIterator<'a> {
    start: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    key: Vec<u8>,
    value: Vec<u8>,
    path: Vec<bool>,
    valid: bool,
    err: Option<StateError>,
    traversal: Option<Traversal<'a>>,
}

impl<'a> TreeIterator<'a> {
    /// Builds an iterator over `[start, end)` in the requested order. When
    /// `tree` is absent the iterator is returned permanently invalid,
    /// carrying the error.
    pub fn new(
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
        tree: Option<&'a ImmutableTree>,
    ) -> Self {
        let mut iter = Self {
            start: start.map(<[u8]>::to_vec),
            end: end.map(<[u8]>::to_vec),
            key: Vec::new(),
            value: Vec::new(),
            path: Vec::new(),
            valid: false,
            err: None,
            traversal: None,
        };
        match tree {
            None => iter.err = Some(StateError::NilTreeForIterator),
            Some(tree) => match Traversal::new(tree, start, end, ascending, false, false) {
                Ok(traversal) => {
                    iter.valid = true;
                    iter.traversal = Some(traversal);
                    // Position on the first element.
                    iter.next();
                }
                Err(e) => iter.err = Some(e),
            },
        }
        iter
    }
}

impl StoreIterator for TreeIterator<'_> {
    fn domain(&self) -> (Option<&[u8]>, Option<&[u8]>) {
        (self.start.as_deref(), self.end.as_deref())
    }

    fn valid(&self) -> bool {
        self.valid
    }

    fn key(&self) -> &[u8] {
        &self.key
    }

    fn value(&self) -> Option<&[u8]> {
        Some(&self.value)
    }

    fn next(&mut self) {
        let Some(traversal) = self.traversal.as_mut() else {
            self.valid = false;
            return;
        };
        loop {
            match traversal.next() {
                Err(e) => {
                    self.err = Some(e);
                    self.traversal = None;
                    self.valid = false;
                    return;
                }
                Ok(None) => {
                    self.traversal = None;
                    self.valid = false;
                    return;
                }
                Ok(Some((node, path))) => {
                    if node.is_leaf() {
                        self.key.clone_from(&node.key);
                        self.value.clone_from(&node.value);
                        self.path = path;
                        return;
                    }
                    // Branches are skipped; keep unwinding.
                }
            }
        }
    }

    fn error(&self) -> Option<&StateError> {
        self.err.as_ref()
    }

    fn close(&mut self) -> Result<(), StateError> {
        self.traversal = None;
        self.valid = false;
        match self.err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl PathIterator for TreeIterator<'_> {
    fn path(&self) -> &[bool] {
        &self.path
    }
}
