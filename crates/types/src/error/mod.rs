// Path: crates/types/src/error/mod.rs
//! Core error types for the canopy state store.

use thiserror::Error;

/// A trait for assigning a stable, machine-readable string code to an error.
pub trait ErrorCode {
    /// Returns the unique, stable string identifier for this error variant.
    fn code(&self) -> &'static str;
}

/// Represents errors that can occur within the durable byte-store layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A generic error originating from the underlying key-value store backend (e.g., redb).
    #[error("backend error: {0}")]
    Backend(String),
    /// An error occurred while serializing data for storage.
    #[error("encode error: {0}")]
    Encode(String),
    /// An error occurred while deserializing data from storage.
    #[error("decode error: {0}")]
    Decode(String),
    /// The requested key or item was not found in the store.
    #[error("not found")]
    NotFound,
}

impl ErrorCode for StorageError {
    fn code(&self) -> &'static str {
        match self {
            Self::Backend(_) => "STORAGE_BACKEND_ERROR",
            Self::Encode(_) => "STORAGE_ENCODE_ERROR",
            Self::Decode(_) => "STORAGE_DECODE_ERROR",
            Self::NotFound => "STORAGE_NOT_FOUND",
        }
    }
}

/// Errors related to the versioned tree engine and its iterators.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    /// An iterator was constructed without the immutable tree it walks.
    #[error("iterator must be created with an immutable tree but the tree was nil")]
    NilTreeForIterator,
    /// A fast iterator was constructed without a node database.
    #[error("fast iterator must be created with a node db but it was nil")]
    NilNodeDbForIterator,
    /// An unsaved fast iterator was constructed without the overlay additions map.
    #[error("unsaved fast iterator must be created with unsaved additions but they were nil")]
    NilAdditionsForIterator,
    /// An unsaved fast iterator was constructed without the overlay removals set.
    #[error("unsaved fast iterator must be created with unsaved removals but they were nil")]
    NilRemovalsForIterator,
    /// The requested version has never been saved or has been deleted.
    #[error("version {0} was not found")]
    VersionNotFound(u64),
    /// An attempt was made to save a version that is already committed.
    #[error("version {0} was already saved to a different hash")]
    VersionAlreadyExists(u64),
    /// The latest committed version cannot be deleted.
    #[error("cannot delete latest saved version ({0})")]
    CannotDeleteLatestVersion(u64),
    /// A version range passed to a lifecycle operation was malformed.
    #[error("invalid version range [{from}, {to})")]
    InvalidVersionRange {
        /// Inclusive lower bound of the rejected range.
        from: u64,
        /// Exclusive upper bound of the rejected range.
        to: u64,
    },
    /// The store contains versions predating the configured initial version.
    #[error("initial version set to {initial}, but found earlier version {found}")]
    InitialVersionMismatch {
        /// The configured initial version.
        initial: u64,
        /// The earlier version found in the store.
        found: u64,
    },
    /// A content-addressed node record was absent from storage.
    #[error("node {0} was not found in storage")]
    NodeMissing(String),
    /// A node or fast-index record could not be encoded for storage.
    #[error("encode error: {0}")]
    Encode(String),
    /// A node or fast-index record could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
    /// The AVL balance or height bookkeeping was found violated.
    #[error("balance invariant violated: {0}")]
    InvariantViolation(String),
    /// Closing a composite iterator failed in one or both children.
    #[error("error closing iterator: {0}")]
    IteratorClose(String),
    /// An error surfaced from the underlying byte store, wrapped with context.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ErrorCode for StateError {
    fn code(&self) -> &'static str {
        match self {
            Self::NilTreeForIterator => "STATE_NIL_TREE_FOR_ITERATOR",
            Self::NilNodeDbForIterator => "STATE_NIL_NODEDB_FOR_ITERATOR",
            Self::NilAdditionsForIterator => "STATE_NIL_ADDITIONS_FOR_ITERATOR",
            Self::NilRemovalsForIterator => "STATE_NIL_REMOVALS_FOR_ITERATOR",
            Self::VersionNotFound(_) => "STATE_VERSION_NOT_FOUND",
            Self::VersionAlreadyExists(_) => "STATE_VERSION_ALREADY_EXISTS",
            Self::CannotDeleteLatestVersion(_) => "STATE_CANNOT_DELETE_LATEST",
            Self::InvalidVersionRange { .. } => "STATE_INVALID_VERSION_RANGE",
            Self::InitialVersionMismatch { .. } => "STATE_INITIAL_VERSION_MISMATCH",
            Self::NodeMissing(_) => "STATE_NODE_MISSING",
            Self::Encode(_) => "STATE_ENCODE_ERROR",
            Self::Decode(_) => "STATE_DECODE_ERROR",
            Self::InvariantViolation(_) => "STATE_INVARIANT_VIOLATION",
            Self::IteratorClose(_) => "STATE_ITERATOR_CLOSE",
            Self::Storage(_) => "STATE_STORAGE_ERROR",
        }
    }
}
