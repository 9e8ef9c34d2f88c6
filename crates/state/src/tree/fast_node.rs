// Path: crates/state/src/tree/fast_node.rs

use super::encode;
use canopy_types::error::StateError;

/// A flat key → (value, version-last-updated) record persisted outside the
/// tree, keyed by raw key. The fast-index bypasses tree descent for point and
/// range reads against the latest version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastNode {
    pub(crate) key: Vec<u8>,
    pub(crate) version_last_updated_at: u64,
    pub(crate) value: Vec<u8>,
}

impl FastNode {
    pub(crate) fn new(key: Vec<u8>, value: Vec<u8>, version_last_updated_at: u64) -> Self {
        Self {
            key,
            version_last_updated_at,
            value,
        }
    }

    /// The raw key this record indexes.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The value live at the indexed key.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// The version at which the key last changed.
    pub fn version_last_updated_at(&self) -> u64 {
        self.version_last_updated_at
    }

    /// Encoded layout: varint version followed by the length-prefixed value.
    pub(crate) fn encode(&self) -> Result<Vec<u8>, StateError> {
        let mut buf = Vec::with_capacity(10 + self.value.len());
        encode::put_varint(&mut buf, self.version_last_updated_at);
        encode::put_bytes(&mut buf, &self.value)?;
        Ok(buf)
    }

    pub(crate) fn decode(key: &[u8], bytes: &[u8]) -> Result<Self, StateError> {
        let mut cursor = bytes;
        let version = encode::get_varint(&mut cursor)?;
        let value = encode::get_bytes(&mut cursor)?;
        if !cursor.is_empty() {
            return Err(StateError::Decode(format!(
                "{} trailing bytes after fast node",
                cursor.len()
            )));
        }
        Ok(Self::new(key.to_vec(), value, version))
    }
}
