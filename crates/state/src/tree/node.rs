// Path: crates/state/src/tree/node.rs

use super::encode;
use canopy_types::error::StateError;
use once_cell::sync::OnceCell;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// A content address of one tree node.
pub(crate) type NodeHash = [u8; 32];

pub(crate) fn sha256(data: &[u8]) -> NodeHash {
    Sha256::digest(data).into()
}

/// A reference to a child subtree. Persisted nodes are referenced by hash and
/// faulted in from the node database on demand; nodes produced by the working
/// tree are owned inline until the next save writes them out.
#[derive(Debug, Clone)]
pub(crate) enum NodeRef {
    Saved(NodeHash),
    New(Arc<Node>),
}

impl NodeRef {
    /// The content address of the referenced subtree root. For pending nodes
    /// this computes (and caches) the hash of the whole pending subtree.
    pub(crate) fn hash(&self) -> Result<NodeHash, StateError> {
        match self {
            NodeRef::Saved(hash) => Ok(*hash),
            NodeRef::New(node) => node.hash(),
        }
    }
}

/// One tree node. Leaves (`height == 0`) carry the value; branches carry a
/// routing key equal to the smallest key of their right subtree, and always
/// have both children.
#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) key: Vec<u8>,
    pub(crate) value: Vec<u8>,
    pub(crate) version: u64,
    pub(crate) height: i32,
    pub(crate) size: u64,
    hash: OnceCell<NodeHash>,
    pub(crate) left: Option<NodeRef>,
    pub(crate) right: Option<NodeRef>,
}

impl Node {
    pub(crate) fn new_leaf(key: Vec<u8>, value: Vec<u8>, version: u64) -> Self {
        Self {
            key,
            value,
            version,
            height: 0,
            size: 1,
            hash: OnceCell::new(),
            left: None,
            right: None,
        }
    }

    pub(crate) fn new_inner(
        key: Vec<u8>,
        left: NodeRef,
        right: NodeRef,
        height: i32,
        size: u64,
        version: u64,
    ) -> Self {
        Self {
            key,
            value: Vec::new(),
            version,
            height,
            size,
            hash: OnceCell::new(),
            left: Some(left),
            right: Some(right),
        }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.height == 0
    }

    pub(crate) fn left_ref(&self) -> Result<&NodeRef, StateError> {
        self.left.as_ref().ok_or_else(|| {
            StateError::InvariantViolation("inner node without a left child".into())
        })
    }

    pub(crate) fn right_ref(&self) -> Result<&NodeRef, StateError> {
        self.right.as_ref().ok_or_else(|| {
            StateError::InvariantViolation("inner node without a right child".into())
        })
    }

    /// The node's hash, computed lazily and cached. Once a node has been
    /// written out it is immutable and the hash is fixed.
    pub(crate) fn hash(&self) -> Result<NodeHash, StateError> {
        self.hash.get_or_try_init(|| self.compute_hash()).copied()
    }

    /// Hash over the canonical preimage: varint height, size and version,
    /// then for leaves the length-prefixed key and the length-prefixed hash
    /// of the value, for branches the two raw 32-byte child hashes.
    fn compute_hash(&self) -> Result<NodeHash, StateError> {
        let mut preimage = Vec::with_capacity(80 + self.key.len());
        encode::put_varint(&mut preimage, self.height as u64);
        encode::put_varint(&mut preimage, self.size);
        encode::put_varint(&mut preimage, self.version);
        if self.is_leaf() {
            encode::put_bytes(&mut preimage, &self.key)?;
            let value_hash = sha256(&self.value);
            encode::put_bytes(&mut preimage, &value_hash)?;
        } else {
            preimage.extend_from_slice(&self.left_ref()?.hash()?);
            preimage.extend_from_slice(&self.right_ref()?.hash()?);
        }
        Ok(sha256(&preimage))
    }

    /// Reconstructs a `Node` from decoded parts, validating that the content
    /// re-hashes to the address it was fetched under.
    pub(crate) fn from_decoded(
        decoded: encode::DecodedNode,
        expected: NodeHash,
    ) -> Result<Self, StateError> {
        let is_leaf = decoded.height == 0;
        let node = Self {
            key: decoded.key,
            value: decoded.value,
            version: decoded.version,
            height: decoded.height,
            size: decoded.size,
            hash: OnceCell::with_value(expected),
            left: (!is_leaf).then_some(NodeRef::Saved(decoded.left_hash)),
            right: (!is_leaf).then_some(NodeRef::Saved(decoded.right_hash)),
        };
        let actual = node.compute_hash()?;
        if actual != expected {
            return Err(StateError::Decode(format!(
                "node content hashes to {} but was stored under {}",
                hex::encode(actual),
                hex::encode(expected)
            )));
        }
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_hash_is_deterministic_and_cached() {
        let a = Node::new_leaf(b"k".to_vec(), b"v".to_vec(), 1);
        let b = Node::new_leaf(b"k".to_vec(), b"v".to_vec(), 1);
        assert_eq!(a.hash().unwrap(), b.hash().unwrap());
        assert_eq!(a.hash().unwrap(), a.hash().unwrap());

        // any field change produces a different address
        let c = Node::new_leaf(b"k".to_vec(), b"v".to_vec(), 2);
        assert_ne!(a.hash().unwrap(), c.hash().unwrap());
        let d = Node::new_leaf(b"k".to_vec(), b"w".to_vec(), 1);
        assert_ne!(a.hash().unwrap(), d.hash().unwrap());
    }

    #[test]
    fn test_inner_hash_covers_children() {
        let l = Arc::new(Node::new_leaf(b"a".to_vec(), b"1".to_vec(), 1));
        let r = Arc::new(Node::new_leaf(b"b".to_vec(), b"2".to_vec(), 1));
        let parent = Node::new_inner(
            b"b".to_vec(),
            NodeRef::New(l.clone()),
            NodeRef::New(r),
            1,
            2,
            1,
        );

        let r2 = Arc::new(Node::new_leaf(b"b".to_vec(), b"3".to_vec(), 1));
        let parent2 = Node::new_inner(b"b".to_vec(), NodeRef::New(l), NodeRef::New(r2), 1, 2, 1);
        assert_ne!(parent.hash().unwrap(), parent2.hash().unwrap());
    }
}
