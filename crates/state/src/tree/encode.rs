// Path: crates/state/src/tree/encode.rs

use super::node::{Node, NodeHash};
use canopy_types::error::StateError;

/// Appends an unsigned varint.
#[inline]
pub(super) fn put_varint(buf: &mut Vec<u8>, value: u64) {
    prost::encoding::encode_varint(value, buf);
}

/// Appends a length-prefixed byte string.
#[inline]
pub(super) fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), StateError> {
    prost::encode_length_delimiter(bytes.len(), buf)
        .map_err(|e| StateError::Encode(format!("encode varint(len): {e}")))?;
    buf.extend_from_slice(bytes);
    Ok(())
}

#[inline]
pub(super) fn get_varint(cursor: &mut &[u8]) -> Result<u64, StateError> {
    prost::encoding::decode_varint(cursor).map_err(|e| StateError::Decode(format!("varint: {e}")))
}

#[inline]
pub(super) fn get_bytes(cursor: &mut &[u8]) -> Result<Vec<u8>, StateError> {
    let len = prost::decode_length_delimiter(&mut *cursor)
        .map_err(|e| StateError::Decode(format!("varint(len): {e}")))?;
    Ok(take(cursor, len)?.to_vec())
}

/// Helper to advance a slice cursor by `n` bytes, returning the advanced part.
pub(super) fn take<'a>(cursor: &mut &'a [u8], n: usize) -> Result<&'a [u8], StateError> {
    if cursor.len() < n {
        return Err(StateError::Decode(format!(
            "truncated input: wanted {n} bytes, had {}",
            cursor.len()
        )));
    }
    let (head, tail) = cursor.split_at(n);
    *cursor = tail;
    Ok(head)
}

/// A parsed node, ready to be rebuilt by `Node::from_decoded`.
pub(super) struct DecodedNode {
    pub(super) version: u64,
    pub(super) height: i32,
    pub(super) size: u64,
    pub(super) key: Vec<u8>,
    pub(super) value: Vec<u8>,     // leaves only
    pub(super) left_hash: NodeHash, // branches only
    pub(super) right_hash: NodeHash,
}

/// Encodes a node into its persistent byte form: varint height, size and
/// version, length-prefixed key, then the length-prefixed raw value for
/// leaves or the two 32-byte child hashes for branches.
pub(super) fn encode_node(node: &Node) -> Result<Vec<u8>, StateError> {
    let mut buf = Vec::with_capacity(96 + node.key.len() + node.value.len());
    put_varint(&mut buf, node.height as u64);
    put_varint(&mut buf, node.size);
    put_varint(&mut buf, node.version);
    put_bytes(&mut buf, &node.key)?;
    if node.is_leaf() {
        put_bytes(&mut buf, &node.value)?;
    } else {
        buf.extend_from_slice(&node.left_ref()?.hash()?);
        buf.extend_from_slice(&node.right_ref()?.hash()?);
    }
    Ok(buf)
}

/// Minimal decoder matching `encode_node`. Rejects trailing bytes.
pub(super) fn decode_node(bytes: &[u8]) -> Result<DecodedNode, StateError> {
    let mut cursor = bytes;

    let height = get_varint(&mut cursor)?;
    let height = i32::try_from(height)
        .map_err(|_| StateError::Decode(format!("node height {height} out of range")))?;
    let size = get_varint(&mut cursor)?;
    let version = get_varint(&mut cursor)?;
    let key = get_bytes(&mut cursor)?;

    let mut value = Vec::new();
    let mut left_hash: NodeHash = [0u8; 32];
    let mut right_hash: NodeHash = [0u8; 32];
    if height == 0 {
        value = get_bytes(&mut cursor)?;
    } else {
        left_hash.copy_from_slice(take(&mut cursor, 32)?);
        right_hash.copy_from_slice(take(&mut cursor, 32)?);
    }

    if !cursor.is_empty() {
        return Err(StateError::Decode(format!(
            "{} trailing bytes after node",
            cursor.len()
        )));
    }

    Ok(DecodedNode {
        version,
        height,
        size,
        key,
        value,
        left_hash,
        right_hash,
    })
}
