// Path: crates/state/src/tree/iterator/unsaved.rs

//! Iteration over the fast-index merged with a working tree's unsaved
//! overlay: pending additions mask or replace persisted records, pending
//! removals hide them.

use super::fast::FastIterator;
use super::StoreIterator;
use crate::tree::fast_node::FastNode;
use crate::tree::node_db::NodeDb;
use canopy_types::error::StateError;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

pub struct UnsavedFastIterator<'a> {
    start: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    ascending: bool,
    key: Vec<u8>,
    value: Vec<u8>,
    valid: bool,
    err: Option<StateError>,
    unsaved: Vec<(&'a [u8], &'a FastNode)>,
    next_unsaved_idx: usize,
    removals: Option<&'a BTreeSet<Vec<u8>>>,
    fast: Option<FastIterator<'a>>,
}

impl<'a> UnsavedFastIterator<'a> {
    /// Builds an iterator over `[start, end)` merging the persisted
    /// fast-index with the overlay maps borrowed from a working tree. Absent
    /// collaborators produce a permanently invalid iterator; the node db is
    /// reported first, then additions, then removals.
    pub fn new(
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
        ndb: Option<&'a NodeDb>,
        additions: Option<&'a BTreeMap<Vec<u8>, FastNode>>,
        removals: Option<&'a BTreeSet<Vec<u8>>>,
    ) -> Self {
        let mut iter = Self {
            start: start.map(<[u8]>::to_vec),
            end: end.map(<[u8]>::to_vec),
            ascending,
            key: Vec::new(),
            value: Vec::new(),
            valid: false,
            err: None,
            unsaved: Vec::new(),
            next_unsaved_idx: 0,
            removals: None,
            fast: None,
        };
        let Some(ndb) = ndb else {
            iter.err = Some(StateError::NilNodeDbForIterator);
            return iter;
        };
        let Some(additions) = additions else {
            iter.err = Some(StateError::NilAdditionsForIterator);
            return iter;
        };
        let Some(removals) = removals else {
            iter.err = Some(StateError::NilRemovalsForIterator);
            return iter;
        };

        // Materialize the in-range overlay additions in the requested order.
        let mut unsaved: Vec<(&[u8], &FastNode)> = additions
            .iter()
            .map(|(key, node)| (key.as_slice(), node))
            .filter(|(key, _)| {
                start.map_or(true, |s| *key >= s) && end.map_or(true, |e| *key < e)
            })
            .collect();
        if !ascending {
            unsaved.reverse();
        }

        iter.unsaved = unsaved;
        iter.removals = Some(removals);
        iter.fast = Some(FastIterator::new(start, end, ascending, Some(ndb)));
        iter.valid = true;
        iter.next();
        iter
    }

    fn take_unsaved(&mut self) {
        if let Some((key, node)) = self.unsaved.get(self.next_unsaved_idx) {
            self.key = key.to_vec();
            self.value = node.value.clone();
            self.next_unsaved_idx += 1;
        } else {
            self.valid = false;
        }
    }
}

impl StoreIterator for UnsavedFastIterator<'_> {
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
        if self.err.is_some() {
            self.valid = false;
            return;
        }
        let Some(fast) = self.fast.as_mut() else {
            self.valid = false;
            return;
        };

        // Persisted records hidden by pending removals are skipped. A key can
        // never be in both overlay maps, so the unsaved cursor needs no check.
        if let Some(removals) = self.removals {
            while fast.valid() && removals.contains(fast.key()) {
                fast.next();
            }
        }

        let unsaved = self.unsaved.get(self.next_unsaved_idx).copied();
        match (fast.valid(), unsaved) {
            (false, None) => self.valid = false,
            (false, Some(_)) => self.take_unsaved(),
            (true, None) => {
                self.key = fast.key().to_vec();
                self.value = fast.value().unwrap_or_default().to_vec();
                fast.next();
            }
            (true, Some((unsaved_key, _))) => {
                let order = fast.key().cmp(unsaved_key);
                let order = if self.ascending { order } else { order.reverse() };
                match order {
                    Ordering::Less => {
                        self.key = fast.key().to_vec();
                        self.value = fast.value().unwrap_or_default().to_vec();
                        fast.next();
                    }
                    Ordering::Equal => {
                        // The pending addition shadows the persisted record.
                        fast.next();
                        self.take_unsaved();
                    }
                    Ordering::Greater => self.take_unsaved(),
                }
            }
        }

        if let Some(e) = self.fast.as_ref().and_then(|f| f.error()).cloned() {
            self.err = Some(e);
            self.valid = false;
        }
    }

    fn error(&self) -> Option<&StateError> {
        self.err.as_ref()
    }

    fn close(&mut self) -> Result<(), StateError> {
        self.fast = None;
        self.unsaved = Vec::new();
        self.next_unsaved_idx = 0;
        self.valid = false;
        match self.err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
