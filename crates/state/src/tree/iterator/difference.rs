// Path: crates/state/src/tree/iterator/difference.rs

use super::{PathIterator, StoreIterator};
use canopy_types::error::StateError;
use std::cmp::Ordering;

/// An iterator over the exclusive-or of two path iterators walking the same
/// domain at different versions: keys present in exactly one input, plus keys
/// present in both with differing values.
///
/// Elements present only in `a` are yielded with `value() == None`; updates
/// (matching keys, differing values) are yielded once with `b`'s value. The
/// emitted stream, applied to `a`'s version as removals and upserts,
/// reconstructs `b`'s version.
pub struct DifferenceIterator<A: PathIterator, B: PathIterator> {
    a: A,
    b: B,
    yield_a: bool,
    err: Option<StateError>,
}

impl<A: PathIterator, B: PathIterator> DifferenceIterator<A, B> {
    pub fn new(a: A, b: B) -> Self {
        let mut di = Self {
            a,
            b,
            yield_a: false,
            err: None,
        };
        di.seek();
        di
    }

    /// Re-establishes the invariant that both member iterators point to an
    /// element not present (with the same value) in the other set.
    fn seek(&mut self) {
        loop {
            if !self.b.valid() {
                self.yield_a = true;
                return;
            }
            if !self.a.valid() {
                self.yield_a = false;
                return;
            }
            match self.a.key().cmp(self.b.key()) {
                Ordering::Less => {
                    self.yield_a = true;
                    return;
                }
                Ordering::Greater => {
                    self.yield_a = false;
                    return;
                }
                Ordering::Equal => {
                    // Same key on both sides: identical values collapse and
                    // both cursors advance; on differing values only `a`
                    // advances, so the next comparison yields `b`'s update.
                    if self.a.value() == self.b.value() {
                        self.b.next();
                    }
                    self.a.next();
                }
            }
        }
    }
}

impl<A: PathIterator, B: PathIterator> StoreIterator for DifferenceIterator<A, B> {
    /// The union of the two input domains. An unbounded side wins.
    fn domain(&self) -> (Option<&[u8]>, Option<&[u8]>) {
        let (start_a, end_a) = self.a.domain();
        let (start_b, end_b) = self.b.domain();
        let start = match (start_a, start_b) {
            (Some(sa), Some(sb)) => Some(sa.min(sb)),
            _ => None,
        };
        let end = match (end_a, end_b) {
            (Some(ea), Some(eb)) => Some(ea.max(eb)),
            _ => None,
        };
        (start, end)
    }

    fn valid(&self) -> bool {
        self.a.valid() || self.b.valid()
    }

    fn key(&self) -> &[u8] {
        if self.yield_a {
            self.a.key()
        } else {
            self.b.key()
        }
    }

    fn value(&self) -> Option<&[u8]> {
        if self.yield_a {
            None
        } else {
            self.b.value()
        }
    }

    fn next(&mut self) {
        if !self.valid() {
            return;
        }
        if self.yield_a {
            self.a.next();
        } else {
            self.b.next();
        }
        self.seek();
    }

    fn error(&self) -> Option<&StateError> {
        self.err.as_ref()
    }

    /// Closes both children, concatenating their error messages so neither is
    /// lost.
    fn close(&mut self) -> Result<(), StateError> {
        let res_a = self.a.close();
        let res_b = self.b.close();
        let err = match (res_a, res_b) {
            (Ok(()), Ok(())) => None,
            (Err(ea), Ok(())) => Some(format!("error closing iterator A: {ea}")),
            (Ok(()), Err(eb)) => Some(format!("error closing iterator B: {eb}")),
            (Err(ea), Err(eb)) => Some(format!(
                "error closing iterator A: {ea}; error closing iterator B: {eb}"
            )),
        };
        match err {
            Some(msg) => {
                let e = StateError::IteratorClose(msg);
                self.err = Some(e.clone());
                Err(e)
            }
            None => Ok(()),
        }
    }
}

impl<A: PathIterator, B: PathIterator> PathIterator for DifferenceIterator<A, B> {
    fn path(&self) -> &[bool] {
        if self.yield_a {
            self.a.path()
        } else {
            self.b.path()
        }
    }
}
