//! Canonical byte encodings: hash preimages and node-store codecs.
//!
//! The hash preimage is fixed bit-exactly for cross-implementation
//! compatibility: signed (zigzag) varints for height, size and version,
//! unsigned varints as length prefixes. The storage codecs below share the
//! same primitives but are internal to the node store.

use crate::fast_node::FastNode;
use crate::node::{ChildRef, Node};
use canopy_types::{NodeHash, StorageError, Version, HASH_SIZE};

pub(crate) fn write_uvarint(buf: &mut Vec<u8>, n: u64) {
    let mut tmp = unsigned_varint::encode::u64_buffer();
    buf.extend_from_slice(unsigned_varint::encode::u64(n, &mut tmp));
}

pub(crate) fn write_varint(buf: &mut Vec<u8>, n: i64) {
    write_uvarint(buf, ((n << 1) ^ (n >> 63)) as u64);
}

pub(crate) fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_uvarint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

pub(crate) fn read_uvarint(rd: &mut &[u8]) -> Result<u64, StorageError> {
    let (value, rest) =
        unsigned_varint::decode::u64(rd).map_err(|e| StorageError::Decode(e.to_string()))?;
    *rd = rest;
    Ok(value)
}

pub(crate) fn read_varint(rd: &mut &[u8]) -> Result<i64, StorageError> {
    let raw = read_uvarint(rd)?;
    Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
}

pub(crate) fn read_bytes(rd: &mut &[u8]) -> Result<Vec<u8>, StorageError> {
    let len = read_uvarint(rd)? as usize;
    if rd.len() < len {
        return Err(StorageError::Decode(format!(
            "truncated field: want {len} bytes, have {}",
            rd.len()
        )));
    }
    let (bytes, rest) = rd.split_at(len);
    *rd = rest;
    Ok(bytes.to_vec())
}

fn read_hash(rd: &mut &[u8]) -> Result<NodeHash, StorageError> {
    let bytes = read_bytes(rd)?;
    let arr: [u8; HASH_SIZE] = bytes
        .try_into()
        .map_err(|_| StorageError::Decode("child hash is not 32 bytes".into()))?;
    Ok(NodeHash(arr))
}

/// Encode a node for the node store. Not the hash preimage: the preimage
/// hashes the value, this stores it.
///
/// Layout: `varint(height) ‖ varint(size) ‖ varint(version) ‖ bytes(key)`
/// followed by `bytes(value)` for leaves or both child hashes for inner
/// nodes. Leaf-ness is recovered from `height == 0`.
pub(crate) fn encode_node(node: &Node) -> Result<Vec<u8>, StorageError> {
    let mut buf = Vec::with_capacity(64 + node.key.len());
    write_varint(&mut buf, node.height as i64);
    write_varint(&mut buf, node.size);
    write_varint(&mut buf, node.version);
    write_bytes(&mut buf, &node.key);
    match &node.value {
        Some(value) => write_bytes(&mut buf, value),
        None => {
            for child in [&node.left, &node.right] {
                match child {
                    Some(ChildRef::Hash(h)) => write_bytes(&mut buf, &h.0),
                    _ => {
                        return Err(StorageError::Encode(
                            "inner node has an unpersisted child".into(),
                        ))
                    }
                }
            }
        }
    }
    Ok(buf)
}

/// Decode a node previously written by [`encode_node`]. The node comes back
/// persisted, carrying `hash` as its store key.
pub(crate) fn decode_node(hash: NodeHash, bytes: &[u8]) -> Result<Node, StorageError> {
    let mut rd = bytes;
    let height = read_varint(&mut rd)?;
    let height = i8::try_from(height)
        .map_err(|_| StorageError::Decode(format!("height {height} out of range")))?;
    let size = read_varint(&mut rd)?;
    let version = read_varint(&mut rd)?;
    let key = read_bytes(&mut rd)?;

    let mut node = if height == 0 {
        let value = read_bytes(&mut rd)?;
        Node::new_leaf(key, value, version)
    } else {
        let left = read_hash(&mut rd)?;
        let right = read_hash(&mut rd)?;
        Node::new_inner(
            key,
            version,
            height,
            size,
            ChildRef::Hash(left),
            ChildRef::Hash(right),
        )
    };
    node.hash = Some(hash);
    node.persisted = true;
    Ok(node)
}

/// Encode a fast-index entry; the key lives in the store key, so only the
/// version and value are written.
pub(crate) fn encode_fast_node(node: &FastNode) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10 + node.value.len());
    write_varint(&mut buf, node.version_last_updated_at);
    write_bytes(&mut buf, &node.value);
    buf
}

/// Decode a fast-index entry stored under `key`.
pub(crate) fn decode_fast_node(key: Vec<u8>, bytes: &[u8]) -> Result<FastNode, StorageError> {
    let mut rd = bytes;
    let version: Version = read_varint(&mut rd)?;
    let value = read_bytes(&mut rd)?;
    Ok(FastNode {
        key,
        value,
        version_last_updated_at: version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_roundtrip() {
        for n in [0i64, 1, -1, 2, 127, 128, -128, i64::MAX, i64::MIN] {
            let mut buf = Vec::new();
            write_varint(&mut buf, n);
            let mut rd = buf.as_slice();
            assert_eq!(read_varint(&mut rd).unwrap(), n);
            assert!(rd.is_empty());
        }
    }

    #[test]
    fn zigzag_matches_known_values() {
        // zigzag(1) = 2, zigzag(-1) = 1, zigzag(2) = 4
        let mut buf = Vec::new();
        write_varint(&mut buf, 1);
        assert_eq!(buf, vec![2]);
        buf.clear();
        write_varint(&mut buf, -1);
        assert_eq!(buf, vec![1]);
        buf.clear();
        write_varint(&mut buf, 2);
        assert_eq!(buf, vec![4]);
    }

    #[test]
    fn bytes_roundtrip() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, b"hello");
        write_bytes(&mut buf, b"");
        let mut rd = buf.as_slice();
        assert_eq!(read_bytes(&mut rd).unwrap(), b"hello");
        assert_eq!(read_bytes(&mut rd).unwrap(), b"");
    }

    #[test]
    fn truncated_bytes_is_an_error() {
        let mut buf = Vec::new();
        write_uvarint(&mut buf, 100);
        buf.extend_from_slice(b"short");
        let mut rd = buf.as_slice();
        assert!(read_bytes(&mut rd).is_err());
    }

    #[test]
    fn leaf_node_roundtrip() {
        let leaf = Node::new_leaf(b"key".to_vec(), b"value".to_vec(), 7);
        let hash = leaf.subtree_hash();
        let bytes = encode_node(&leaf).unwrap();
        let back = decode_node(hash, &bytes).unwrap();
        assert!(back.is_leaf());
        assert_eq!(back.key, b"key");
        assert_eq!(back.value.as_deref(), Some(b"value".as_slice()));
        assert_eq!(back.version, 7);
        assert_eq!(back.size, 1);
        assert!(back.persisted);
        assert_eq!(back.subtree_hash(), hash);
    }

    #[test]
    fn fast_node_roundtrip() {
        let node = FastNode::new(b"k".to_vec(), b"v".to_vec(), 42);
        let bytes = encode_fast_node(&node);
        let back = decode_fast_node(b"k".to_vec(), &bytes).unwrap();
        assert_eq!(back.key, b"k");
        assert_eq!(back.value, b"v");
        assert_eq!(back.version_last_updated_at, 42);
    }
}
