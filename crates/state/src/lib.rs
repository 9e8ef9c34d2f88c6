// Path: crates/state/src/lib.rs
//! # Canopy State Lints
//!
//! This crate enforces a strict set of lints to ensure high-quality,
//! panic-free code. Panics are disallowed in non-test code to promote
//! robust error handling.
#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::indexing_slicing
    )
)]
//! # Canopy State
//!
//! A versioned, persistent, authenticated key-value store built on an
//! immutable AVL+ tree. Each committed version yields a Merkle root hash
//! committing to the entire key set at that version; historical versions stay
//! queryable until pruned, and point reads can bypass tree descent through a
//! flat fast-index.

pub mod tree;

pub use tree::iterator::{
    DifferenceIterator, FastIterator, PathIterator, StoreIterator, TreeIterator,
    UnsavedFastIterator,
};
pub use tree::{FastNode, ImmutableTree, MutableTree, NodeDb, TreeOptions};
pub use tree::{RootHash, EMPTY_ROOT_HASH};
