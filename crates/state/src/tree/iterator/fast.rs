// Path: crates/state/src/tree/iterator/fast.rs

//! Iteration over the persisted fast-index: an ordered scan of `f/` records
//! with no tree traversal, O(1) per element.

use super::StoreIterator;
use crate::tree::fast_node::FastNode;
use crate::tree::node_db::NodeDb;
use canopy_storage::KvIter;
use canopy_types::error::StateError;

pub struct FastIterator<'a> {
    start: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    key: Vec<u8>,
    value: Vec<u8>,
    valid: bool,
    err: Option<StateError>,
    itr: Option<KvIter<'a>>,
}

impl<'a> FastIterator<'a> {
    /// Builds an iterator over the fast-index records in `[start, end)`. When
    /// `ndb` is absent the iterator is returned permanently invalid, carrying
    /// the error.
    pub fn new(
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
        ndb: Option<&'a NodeDb>,
    ) -> Self {
        let mut iter = Self {
            start: start.map(<[u8]>::to_vec),
            end: end.map(<[u8]>::to_vec),
            key: Vec::new(),
            value: Vec::new(),
            valid: false,
            err: None,
            itr: None,
        };
        match ndb {
            None => iter.err = Some(StateError::NilNodeDbForIterator),
            Some(ndb) => match ndb.fast_iterator(start, end, ascending) {
                Ok(itr) => {
                    iter.itr = Some(itr);
                    iter.valid = true;
                    iter.next();
                }
                Err(e) => iter.err = Some(e),
            },
        }
        iter
    }
}

impl StoreIterator for FastIterator<'_> {
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
        let Some(itr) = self.itr.as_mut() else {
            self.valid = false;
            return;
        };
        match itr.next() {
            None => {
                self.itr = None;
                self.valid = false;
            }
            Some((storage_key, raw)) => {
                let decoded = NodeDb::fast_entry_key(&storage_key)
                    .and_then(|key| FastNode::decode(key, &raw));
                match decoded {
                    Ok(node) => {
                        self.key = node.key;
                        self.value = node.value;
                    }
                    Err(e) => {
                        self.err = Some(e);
                        self.itr = None;
                        self.valid = false;
                    }
                }
            }
        }
    }

    fn error(&self) -> Option<&StateError> {
        self.err.as_ref()
    }

    fn close(&mut self) -> Result<(), StateError> {
        self.itr = None;
        self.valid = false;
        match self.err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
